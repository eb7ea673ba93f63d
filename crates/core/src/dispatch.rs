//! The render step shared by synchronous callers and pool workers.
//!
//! [`Dispatcher::execute`] is the boundary where engine failures, including
//! panics, become a `Failed` task plus an error value. Nothing that happens
//! inside an engine can unwind past it.

use crate::engine::RenderEngine;
use crate::error::{ErrorCode, Result, Text2ImageError};
use crate::task::Task;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Process-wide "most recent failure" slot.
///
/// Concurrent failures overwrite each other; per-task diagnostics live in
/// [`Task::error_message`] and [`Task::output_error`].
#[derive(Debug, Default)]
pub struct LastError {
    slot: Mutex<Option<(ErrorCode, String)>>,
}

impl LastError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, err: &Text2ImageError) {
        *self.slot.lock() = Some((err.code(), err.to_string()));
    }

    pub fn message(&self) -> Option<String> {
        self.slot.lock().as_ref().map(|(_, message)| message.clone())
    }

    /// Code of the most recent failure, `ErrorCode::Ok` if none.
    pub fn code(&self) -> ErrorCode {
        self.slot
            .lock()
            .as_ref()
            .map_or(ErrorCode::Ok, |(code, _)| *code)
    }

    pub fn clear(&self) {
        *self.slot.lock() = None;
    }
}

/// Runs tasks through a render engine.
pub struct Dispatcher {
    engine: Arc<dyn RenderEngine>,
    last_error: Arc<LastError>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("engine", &self.engine.name())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(engine: Arc<dyn RenderEngine>, last_error: Arc<LastError>) -> Self {
        Self { engine, last_error }
    }

    pub fn engine(&self) -> &Arc<dyn RenderEngine> {
        &self.engine
    }

    pub fn last_error(&self) -> &LastError {
        &self.last_error
    }

    /// Render `task` on the calling thread and optionally save the result.
    ///
    /// A failed save returns `OutputWriteError` but leaves the task
    /// `Completed`: the render itself succeeded.
    pub fn execute(&self, task: &Task, output_path: Option<&Path>) -> Result<()> {
        task.begin()?;

        let handle = task.handle();
        debug!("Rendering task {} with engine '{}'", handle, self.engine.name());

        let start = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.engine.render(task)));
        let elapsed = start.elapsed();

        match outcome {
            Ok(Ok(bytes)) => {
                debug!(
                    "Task {} rendered {} bytes in {:?}",
                    handle,
                    bytes.len(),
                    elapsed
                );
                task.complete(bytes, elapsed);
            }
            Ok(Err(err)) => {
                let message = format!("{:#}", err);
                warn!("Task {} failed: {}", handle, message);
                task.fail(message.clone(), elapsed);
                return Err(Text2ImageError::RenderFailure(message));
            }
            Err(payload) => {
                let message = format!(
                    "render engine '{}' panicked: {}",
                    self.engine.name(),
                    panic_message(payload.as_ref())
                );
                error!("Task {}: {}", handle, message);
                task.fail(message.clone(), elapsed);
                return Err(Text2ImageError::RenderFailure(message));
            }
        }

        match output_path {
            Some(path) if !path.as_os_str().is_empty() => self.save(task, path),
            _ => Ok(()),
        }
    }

    fn save(&self, task: &Task, path: &Path) -> Result<()> {
        let bytes = task.result().unwrap_or_default();
        if let Err(e) = std::fs::write(path, bytes) {
            let err = Text2ImageError::OutputWriteError {
                path: path.to_path_buf(),
                message: e.to_string(),
            };
            warn!("Task {}: {}", task.handle(), err);
            task.record_output_error(err.to_string());
            return Err(err);
        }
        debug!(
            "Wrote {} bytes for task {} to {:?}",
            bytes.len(),
            task.handle(),
            path
        );
        Ok(())
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RenderOptions;
    use crate::registry::TaskHandle;
    use crate::task::TaskStatus;
    use anyhow::{anyhow, Context};
    use tempfile::TempDir;

    struct Echo;

    impl RenderEngine for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn render(&self, task: &Task) -> anyhow::Result<Vec<u8>> {
            Ok(task.document().as_bytes().to_vec())
        }
    }

    struct Broken;

    impl RenderEngine for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn render(&self, _task: &Task) -> anyhow::Result<Vec<u8>> {
            Err(anyhow!("unbalanced tag")).context("layout failed")
        }
    }

    struct Panicky;

    impl RenderEngine for Panicky {
        fn name(&self) -> &str {
            "panicky"
        }

        fn render(&self, _task: &Task) -> anyhow::Result<Vec<u8>> {
            panic!("glyph cache corrupted")
        }
    }

    fn dispatcher(engine: impl RenderEngine + 'static) -> Dispatcher {
        Dispatcher::new(Arc::new(engine), Arc::new(LastError::new()))
    }

    fn task(document: &str) -> Task {
        Task::new(
            TaskHandle::from_raw(1 << (usize::BITS / 2)).unwrap(),
            document,
            "",
            RenderOptions::default(),
        )
    }

    // ========== LastError tests ==========

    #[test]
    fn test_last_error_starts_empty() {
        let last = LastError::new();
        assert!(last.message().is_none());
        assert_eq!(last.code(), ErrorCode::Ok);
    }

    #[test]
    fn test_last_error_overwrites_and_clears() {
        let last = LastError::new();
        last.record(&Text2ImageError::NotInitialized);
        last.record(&Text2ImageError::NoResult);
        assert_eq!(last.message().as_deref(), Some("No result available"));
        assert_eq!(last.code(), ErrorCode::NoResult);

        last.clear();
        assert!(last.message().is_none());
    }

    // ========== Dispatcher tests ==========

    #[test]
    fn test_execute_success() {
        let dispatcher = dispatcher(Echo);
        let task = task("<p>A</p>");
        dispatcher.execute(&task, None).unwrap();
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.result(), Some(&b"<p>A</p>"[..]));
        assert!(task.render_time().is_some());
    }

    #[test]
    fn test_execute_engine_error_fails_task() {
        let dispatcher = dispatcher(Broken);
        let task = task("<p>");
        let err = dispatcher.execute(&task, None).unwrap_err();
        assert!(matches!(err, Text2ImageError::RenderFailure(_)));
        assert_eq!(task.status(), TaskStatus::Failed);
        assert_eq!(
            task.error_message(),
            Some("layout failed: unbalanced tag")
        );
    }

    #[test]
    fn test_execute_catches_engine_panic() {
        let dispatcher = dispatcher(Panicky);
        let task = task("<p>A</p>");
        let err = dispatcher.execute(&task, None).unwrap_err();
        assert!(err.to_string().contains("glyph cache corrupted"));
        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(task.error_message().unwrap().contains("panicky"));
    }

    #[test]
    fn test_execute_writes_output() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.png");
        let dispatcher = dispatcher(Echo);
        let task = task("bytes on disk");

        dispatcher.execute(&task, Some(&path)).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"bytes on disk");
    }

    #[test]
    fn test_execute_empty_output_path_is_ignored() {
        let dispatcher = dispatcher(Echo);
        let task = task("x");
        dispatcher.execute(&task, Some(Path::new(""))).unwrap();
        assert_eq!(task.status(), TaskStatus::Completed);
    }

    #[test]
    fn test_write_failure_keeps_task_completed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing-dir").join("out.png");
        let dispatcher = dispatcher(Echo);
        let task = task("<p>A</p>");

        let err = dispatcher.execute(&task, Some(&path)).unwrap_err();
        assert!(matches!(err, Text2ImageError::OutputWriteError { .. }));
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.result(), Some(&b"<p>A</p>"[..]));
        assert!(task.output_error().unwrap().contains("missing-dir"));
    }

    #[test]
    fn test_execute_skips_cancelled_task() {
        let dispatcher = dispatcher(Echo);
        let task = task("never");
        task.cancel().unwrap();
        assert!(matches!(
            dispatcher.execute(&task, None),
            Err(Text2ImageError::TaskCancelled)
        ));
        assert_eq!(task.status(), TaskStatus::Cancelled);
    }

    #[test]
    fn test_panic_message_variants() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
