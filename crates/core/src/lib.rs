//! # text2image-core
//!
//! Concurrent task pipeline for rendering markup and stylesheets to images.
//!
//! The library is organised around a [`LibraryContext`] that owns:
//!
//! - a **task registry** handing out opaque, generation-checked handles
//! - a **resizable worker pool** of OS threads serving a FIFO queue
//! - one **render engine** behind the [`RenderEngine`] trait
//! - a **last-error slot** for callers that only see success flags
//!
//! Tasks can be rendered synchronously on the calling thread or queued on
//! the pool with a completion callback. Results are always handed out as
//! caller-owned copies.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use text2image_core::{ImageFormat, LibraryContext, RenderOptions};
//!
//! fn main() -> anyhow::Result<()> {
//!     let context = LibraryContext::builder().pool_size(4).build()?;
//!     context.initialize()?;
//!
//!     let options = RenderOptions::default().format(ImageFormat::Png);
//!     let handle = context.create_task("<p>Hello</p>", "p { color: red }", Some(options))?;
//!     context.render_sync(handle, Some("out.png".as_ref()))?;
//!
//!     let bytes = context.get_result(handle)?;
//!     println!("Rendered {} bytes", bytes.len());
//!
//!     context.free_task(handle);
//!     context.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Asynchronous Rendering
//!
//! ```rust,no_run
//! use text2image_core::LibraryContext;
//!
//! fn main() -> anyhow::Result<()> {
//!     let context = LibraryContext::default();
//!     context.initialize()?;
//!
//!     let handle = context.create_task("<h1>Queued</h1>", "", None)?;
//!     context.render_async(
//!         handle,
//!         None,
//!         Some(Box::new(|handle, success| {
//!             println!("Task {} finished: {}", handle, success);
//!         })),
//!     )?;
//!
//!     // Drains the queue before returning.
//!     context.shutdown();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod pool;
pub mod raster;
pub mod registry;
pub mod task;

// Re-export main types for convenience
pub use config::{
    BackgroundType, ContextConfig, ImageFormat, PoolConfig, RenderOptions, Resolution,
};
pub use context::{ContextBuilder, LibraryContext};
pub use dispatch::{Dispatcher, LastError};
pub use engine::{engine_factory, EngineFactory, RenderEngine};
pub use error::{ErrorCode, Result, Text2ImageError};
pub use pool::{PoolHealth, RenderCallback, ThreadPool};
pub use raster::RasterEngine;
pub use registry::{TaskHandle, TaskRegistry};
pub use task::{Task, TaskPriority, TaskStatus};

/// Initialize the library's logging.
///
/// Reads the filter from `RUST_LOG`. Safe to call more than once; only the
/// first call installs a subscriber, and none is installed if the host
/// application already set one.
pub fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init();
}
