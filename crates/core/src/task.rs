//! Render tasks and their state machine.
//!
//! A task moves `Pending -> Running -> {Completed, Failed}`, or
//! `Pending -> Cancelled` when cancelled before a worker picks it up. Every
//! transition is a compare-and-swap on an atomic status, so no thread can
//! observe a status going backwards.
//!
//! The result bytes and the error message are written once, by the thread
//! running the render step, *before* the status is published with release
//! ordering. A reader that loads `Completed` with acquire ordering therefore
//! always sees the final bytes.

use crate::config::RenderOptions;
use crate::error::{Result, Text2ImageError};
use crate::registry::TaskHandle;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Lifecycle state of a task.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Created, not yet picked up by a render step.
    Pending = 0,
    /// A render step is executing.
    Running = 1,
    /// The engine succeeded; the result is available.
    Completed = 2,
    /// The engine failed; the error message is available.
    Failed = 3,
    /// Cancelled before rendering started.
    Cancelled = 4,
}

impl TaskStatus {
    /// Whether no further transition can leave this state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
        )
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskStatus::Pending,
            1 => TaskStatus::Running,
            2 => TaskStatus::Completed,
            3 => TaskStatus::Failed,
            _ => TaskStatus::Cancelled,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Scheduling hint. The pool serves tasks FIFO regardless; the field exists
/// so callers can record intent for a future scheduling policy.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TaskPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
}

impl TaskPriority {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TaskPriority::Low,
            2 => TaskPriority::High,
            _ => TaskPriority::Normal,
        }
    }
}

/// A unit of document-to-image work.
pub struct Task {
    handle: TaskHandle,
    document: String,
    stylesheet: String,
    options: RenderOptions,
    priority: AtomicU8,
    status: AtomicU8,
    /// Set once a render path has taken ownership of the task.
    claimed: AtomicBool,
    result: OnceLock<Vec<u8>>,
    error_message: OnceLock<String>,
    output_error: OnceLock<String>,
    render_time: OnceLock<Duration>,
    created_at: Instant,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("handle", &self.handle)
            .field("status", &self.status())
            .field("priority", &self.priority())
            .field("document_len", &self.document.len())
            .field("stylesheet_len", &self.stylesheet.len())
            .field("result_len", &self.result.get().map(Vec::len))
            .field("error_message", &self.error_message.get())
            .finish()
    }
}

impl Task {
    /// Create a pending task.
    ///
    /// Tasks are normally created through
    /// [`LibraryContext::create_task`](crate::LibraryContext::create_task),
    /// which also registers them; this constructor exists for engine tests.
    pub fn new(
        handle: TaskHandle,
        document: impl Into<String>,
        stylesheet: impl Into<String>,
        options: RenderOptions,
    ) -> Self {
        Self {
            handle,
            document: document.into(),
            stylesheet: stylesheet.into(),
            options,
            priority: AtomicU8::new(TaskPriority::Normal as u8),
            status: AtomicU8::new(TaskStatus::Pending as u8),
            claimed: AtomicBool::new(false),
            result: OnceLock::new(),
            error_message: OnceLock::new(),
            output_error: OnceLock::new(),
            render_time: OnceLock::new(),
            created_at: Instant::now(),
        }
    }

    pub fn handle(&self) -> TaskHandle {
        self.handle
    }

    pub fn document(&self) -> &str {
        &self.document
    }

    pub fn stylesheet(&self) -> &str {
        &self.stylesheet
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    /// Current status (acquire load).
    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn priority(&self) -> TaskPriority {
        TaskPriority::from_u8(self.priority.load(Ordering::Relaxed))
    }

    pub fn set_priority(&self, priority: TaskPriority) {
        self.priority.store(priority as u8, Ordering::Relaxed);
    }

    /// The encoded image, once the task is `Completed`.
    pub fn result(&self) -> Option<&[u8]> {
        if self.status() == TaskStatus::Completed {
            self.result.get().map(Vec::as_slice)
        } else {
            None
        }
    }

    /// Why the render failed, once the task is `Failed`.
    pub fn error_message(&self) -> Option<&str> {
        if self.status() == TaskStatus::Failed {
            self.error_message.get().map(String::as_str)
        } else {
            None
        }
    }

    /// Why the output file could not be written, for a task that rendered
    /// successfully but failed to save.
    pub fn output_error(&self) -> Option<&str> {
        self.output_error.get().map(String::as_str)
    }

    /// Wall time spent in the render engine, once the task is terminal.
    pub fn render_time(&self) -> Option<Duration> {
        self.render_time.get().copied()
    }

    /// Time since the task was created.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Cancel the task if it has not started.
    ///
    /// Cancelling an already cancelled task is a no-op.
    pub fn cancel(&self) -> Result<()> {
        if self.transition(TaskStatus::Pending, TaskStatus::Cancelled) {
            return Ok(());
        }
        match self.status() {
            TaskStatus::Cancelled => Ok(()),
            status => Err(Text2ImageError::TaskAlreadyStarted { status }),
        }
    }

    /// Take ownership of the task for one render request.
    pub(crate) fn claim(&self) -> Result<()> {
        match self.status() {
            TaskStatus::Pending => {}
            TaskStatus::Cancelled => return Err(Text2ImageError::TaskCancelled),
            status => return Err(Text2ImageError::TaskAlreadyStarted { status }),
        }
        if self.claimed.swap(true, Ordering::AcqRel) {
            return Err(Text2ImageError::TaskAlreadyStarted {
                status: self.status(),
            });
        }
        Ok(())
    }

    /// Undo a claim whose submission never reached a worker.
    pub(crate) fn release_claim(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    /// `Pending -> Running`.
    pub(crate) fn begin(&self) -> Result<()> {
        if self.transition(TaskStatus::Pending, TaskStatus::Running) {
            return Ok(());
        }
        match self.status() {
            TaskStatus::Cancelled => Err(Text2ImageError::TaskCancelled),
            status => Err(Text2ImageError::TaskAlreadyStarted { status }),
        }
    }

    /// `Running -> Completed`, publishing `bytes`.
    pub(crate) fn complete(&self, bytes: Vec<u8>, elapsed: Duration) {
        let _ = self.result.set(bytes);
        let _ = self.render_time.set(elapsed);
        self.transition(TaskStatus::Running, TaskStatus::Completed);
    }

    /// `Running -> Failed`, publishing `message`.
    pub(crate) fn fail(&self, message: String, elapsed: Duration) {
        let _ = self.error_message.set(message);
        let _ = self.render_time.set(elapsed);
        self.transition(TaskStatus::Running, TaskStatus::Failed);
    }

    pub(crate) fn record_output_error(&self, message: String) {
        let _ = self.output_error.set(message);
    }

    fn transition(&self, from: TaskStatus, to: TaskStatus) -> bool {
        debug_assert!(from.can_transition_to(to));
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn new_task() -> Task {
        let handle = TaskHandle::from_raw(1 << (usize::BITS / 2)).unwrap();
        Task::new(handle, "<p>A</p>", "p { color: red }", RenderOptions::default())
    }

    // ========== TaskStatus tests ==========

    #[test]
    fn test_status_edges() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Running.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Running));
    }

    #[test]
    fn test_status_terminal() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    // ========== Task lifecycle tests ==========

    #[test]
    fn test_new_task_is_pending() {
        let task = new_task();
        assert_eq!(task.status(), TaskStatus::Pending);
        assert_eq!(task.priority(), TaskPriority::Normal);
        assert!(task.result().is_none());
        assert!(task.error_message().is_none());
        assert_eq!(task.document(), "<p>A</p>");
        assert_eq!(task.stylesheet(), "p { color: red }");
    }

    #[test]
    fn test_complete_publishes_result() {
        let task = new_task();
        task.begin().unwrap();
        assert_eq!(task.status(), TaskStatus::Running);
        assert!(task.result().is_none());

        task.complete(vec![1, 2, 3], Duration::from_millis(5));
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.result(), Some(&[1u8, 2, 3][..]));
        assert_eq!(task.render_time(), Some(Duration::from_millis(5)));
        assert!(task.error_message().is_none());
    }

    #[test]
    fn test_fail_publishes_message() {
        let task = new_task();
        task.begin().unwrap();
        task.fail("bad markup".to_string(), Duration::ZERO);
        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(task.error_message(), Some("bad markup"));
        assert!(task.result().is_none());
    }

    #[test]
    fn test_terminal_state_is_sticky() {
        let task = new_task();
        task.begin().unwrap();
        task.complete(vec![9], Duration::ZERO);

        assert!(matches!(
            task.begin(),
            Err(Text2ImageError::TaskAlreadyStarted {
                status: TaskStatus::Completed
            })
        ));
        assert!(task.cancel().is_err());
        assert_eq!(task.status(), TaskStatus::Completed);
    }

    #[test]
    fn test_cancel_pending_task() {
        let task = new_task();
        task.cancel().unwrap();
        assert_eq!(task.status(), TaskStatus::Cancelled);
        // Idempotent
        task.cancel().unwrap();
        assert!(matches!(task.begin(), Err(Text2ImageError::TaskCancelled)));
        assert!(matches!(task.claim(), Err(Text2ImageError::TaskCancelled)));
    }

    #[test]
    fn test_cancel_running_task_fails() {
        let task = new_task();
        task.begin().unwrap();
        assert!(matches!(
            task.cancel(),
            Err(Text2ImageError::TaskAlreadyStarted {
                status: TaskStatus::Running
            })
        ));
    }

    #[test]
    fn test_claim_is_exclusive() {
        let task = new_task();
        task.claim().unwrap();
        assert!(matches!(
            task.claim(),
            Err(Text2ImageError::TaskAlreadyStarted { .. })
        ));

        task.release_claim();
        task.claim().unwrap();
    }

    #[test]
    fn test_priority_round_trip() {
        let task = new_task();
        task.set_priority(TaskPriority::High);
        assert_eq!(task.priority(), TaskPriority::High);
        task.set_priority(TaskPriority::Low);
        assert_eq!(task.priority(), TaskPriority::Low);
    }

    #[test]
    fn test_completed_reader_sees_bytes_across_threads() {
        for _ in 0..50 {
            let task = Arc::new(new_task());
            let writer = {
                let task = Arc::clone(&task);
                thread::spawn(move || {
                    task.begin().unwrap();
                    task.complete(vec![7; 1024], Duration::ZERO);
                })
            };

            loop {
                if task.status() == TaskStatus::Completed {
                    assert_eq!(task.result().map(<[u8]>::len), Some(1024));
                    break;
                }
                thread::yield_now();
            }
            writer.join().unwrap();
        }
    }

    #[test]
    fn test_status_never_goes_backwards() {
        let task = Arc::new(new_task());
        let observer = {
            let task = Arc::clone(&task);
            thread::spawn(move || {
                let mut last = TaskStatus::Pending as u8;
                while !task.status().is_terminal() {
                    let now = task.status() as u8;
                    assert!(now >= last);
                    last = now;
                }
            })
        };
        task.begin().unwrap();
        task.fail("boom".to_string(), Duration::ZERO);
        observer.join().unwrap();
    }
}
