//! The render engine capability.
//!
//! The task pipeline never depends on a concrete backend. Anything that can
//! turn a [`Task`]'s document, stylesheet and options into encoded image
//! bytes implements [`RenderEngine`]; the built-in
//! [`RasterEngine`](crate::raster::RasterEngine) is one such backend.

use crate::task::Task;
use std::sync::Arc;

/// A document-to-image backend.
///
/// One instance is shared by the synchronous caller path and every pool
/// worker, so `render` may be called concurrently.
pub trait RenderEngine: Send + Sync {
    /// Short name used in logs and error messages.
    fn name(&self) -> &str;

    /// Prepare the engine. Called once per context initialization, before
    /// any task is rendered.
    fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release engine resources. Called once, after every in-flight render
    /// has finished.
    fn shutdown(&self) {}

    /// Render a task and return the encoded image.
    ///
    /// Errors become the task's error message; the task is marked `Failed`.
    fn render(&self, task: &Task) -> anyhow::Result<Vec<u8>>;
}

/// Builds a fresh engine for each context initialization.
pub type EngineFactory = Arc<dyn Fn() -> Arc<dyn RenderEngine> + Send + Sync>;

/// Wrap a constructor as an [`EngineFactory`].
pub fn engine_factory<E, F>(make: F) -> EngineFactory
where
    E: RenderEngine + 'static,
    F: Fn() -> E + Send + Sync + 'static,
{
    Arc::new(move || Arc::new(make()) as Arc<dyn RenderEngine>)
}
