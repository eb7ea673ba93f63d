//! Error types for the text2image task pipeline.

use crate::registry::TaskHandle;
use crate::task::TaskStatus;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the text2image library.
#[derive(Error, Debug)]
pub enum Text2ImageError {
    /// The library context has not been initialized (or was shut down).
    #[error("Library not initialized")]
    NotInitialized,

    /// A caller-supplied argument was rejected.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The handle does not name a live task.
    #[error("Task not found: {0}")]
    TaskNotFound(TaskHandle),

    /// The render engine refused to start.
    #[error("Failed to initialize render engine '{engine}': {message}")]
    EngineInit { engine: String, message: String },

    /// The render engine reported a failure for a task.
    #[error("Rendering failed: {0}")]
    RenderFailure(String),

    /// The render succeeded but the result could not be written to disk.
    #[error("Failed to write output file '{path}': {message}")]
    OutputWriteError { path: PathBuf, message: String },

    /// The task has not reached the `Completed` state.
    #[error("Task not completed (status: {status})")]
    TaskNotCompleted { status: TaskStatus },

    /// The task completed but the engine produced no bytes.
    #[error("No result available")]
    NoResult,

    /// The worker pool no longer accepts work.
    #[error("Thread pool has been shut down")]
    PoolStopped,

    /// A caller-owned copy of the result could not be allocated.
    #[error("Failed to allocate {size} bytes for the result buffer")]
    AllocationFailure { size: usize },

    /// The task was already submitted for rendering.
    #[error("Task already started (status: {status})")]
    TaskAlreadyStarted { status: TaskStatus },

    /// The task was cancelled before a worker picked it up.
    #[error("Task was cancelled")]
    TaskCancelled,

    /// The operating system refused to start a worker thread.
    #[error("Failed to spawn worker thread: {0}")]
    WorkerSpawnFailed(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, Text2ImageError>;

/// Stable numeric error codes, shared with the C surface.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok = 0,
    NotInitialized = 1,
    InvalidArgument = 2,
    TaskNotFound = 3,
    EngineInitError = 4,
    RenderFailure = 5,
    OutputWriteError = 6,
    TaskNotCompleted = 7,
    NoResult = 8,
    PoolStopped = 9,
    AllocationFailure = 10,
    TaskAlreadyStarted = 11,
    TaskCancelled = 12,
    WorkerSpawnFailed = 13,
    InvalidConfig = 14,
}

impl Text2ImageError {
    /// The numeric code reported across the C ABI.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotInitialized => ErrorCode::NotInitialized,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::TaskNotFound(_) => ErrorCode::TaskNotFound,
            Self::EngineInit { .. } => ErrorCode::EngineInitError,
            Self::RenderFailure(_) => ErrorCode::RenderFailure,
            Self::OutputWriteError { .. } => ErrorCode::OutputWriteError,
            Self::TaskNotCompleted { .. } => ErrorCode::TaskNotCompleted,
            Self::NoResult => ErrorCode::NoResult,
            Self::PoolStopped => ErrorCode::PoolStopped,
            Self::AllocationFailure { .. } => ErrorCode::AllocationFailure,
            Self::TaskAlreadyStarted { .. } => ErrorCode::TaskAlreadyStarted,
            Self::TaskCancelled => ErrorCode::TaskCancelled,
            Self::WorkerSpawnFailed(_) => ErrorCode::WorkerSpawnFailed,
            Self::InvalidConfig(_) => ErrorCode::InvalidConfig,
        }
    }
}

impl From<serde_json::Error> for Text2ImageError {
    fn from(err: serde_json::Error) -> Self {
        Text2ImageError::InvalidConfig(err.to_string())
    }
}
