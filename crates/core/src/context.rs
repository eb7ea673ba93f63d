//! Library context tying together the task registry, the worker pool and
//! the render engine.
//!
//! This module provides the high-level API: initialize, create tasks,
//! render them synchronously or on the pool, fetch results and shut down.
//! A context can be initialized again after a shutdown.

use crate::config::{ContextConfig, PoolConfig, RenderOptions};
use crate::dispatch::{Dispatcher, LastError};
use crate::engine::{engine_factory, EngineFactory, RenderEngine};
use crate::error::{ErrorCode, Result, Text2ImageError};
use crate::pool::{PoolHealth, RenderCallback, ThreadPool};
use crate::raster::RasterEngine;
use crate::registry::{TaskHandle, TaskRegistry};
use crate::task::{Task, TaskPriority, TaskStatus};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Everything that exists only while the context is initialized.
struct Runtime {
    dispatcher: Arc<Dispatcher>,
    pool: ThreadPool,
    /// `true` while synchronous renders may start. Each synchronous render
    /// holds a read guard for its whole duration; shutdown takes the write
    /// guard to wait for them before releasing the engine.
    sync_gate: RwLock<bool>,
}

/// Process-wide entry point of the library.
pub struct LibraryContext {
    config: RwLock<ContextConfig>,
    engine_factory: EngineFactory,
    /// Serializes initialize and shutdown.
    lifecycle: Mutex<()>,
    runtime: RwLock<Option<Arc<Runtime>>>,
    registry: TaskRegistry,
    last_error: Arc<LastError>,
    /// Pool size requested through `set_max_threads`, applied to the
    /// running pool and to any pool built later.
    requested_threads: Mutex<Option<usize>>,
}

impl std::fmt::Debug for LibraryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibraryContext")
            .field("initialized", &self.is_initialized())
            .field("tasks", &self.registry.len())
            .field("config", &*self.config.read())
            .finish()
    }
}

impl Default for LibraryContext {
    fn default() -> Self {
        Self::new(ContextConfig::default())
    }
}

impl LibraryContext {
    /// Create an uninitialized context using the built-in raster engine.
    pub fn new(config: ContextConfig) -> Self {
        Self::with_engine_factory(config, engine_factory(RasterEngine::new))
    }

    /// Create an uninitialized context using a custom engine.
    pub fn with_engine_factory(config: ContextConfig, engine_factory: EngineFactory) -> Self {
        Self {
            config: RwLock::new(config),
            engine_factory,
            lifecycle: Mutex::new(()),
            runtime: RwLock::new(None),
            registry: TaskRegistry::new(),
            last_error: Arc::new(LastError::new()),
            requested_threads: Mutex::new(None),
        }
    }

    /// Start building a context.
    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    /// Construct the engine and the pool. Succeeds without doing anything
    /// if the context is already initialized.
    pub fn initialize(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        if self.is_initialized() {
            debug!("Context already initialized");
            return Ok(());
        }
        let result = self.start();
        self.record(result)
    }

    /// Replace the configuration, then initialize.
    ///
    /// An already initialized context keeps running with its current
    /// configuration.
    pub fn initialize_with(&self, config: ContextConfig) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        if self.is_initialized() {
            warn!("Context already initialized; new configuration ignored");
            return Ok(());
        }
        if let Err(e) = config.validate() {
            return self.record(Err(e));
        }
        *self.config.write() = config;
        *self.requested_threads.lock() = None;
        let result = self.start();
        self.record(result)
    }

    fn start(&self) -> Result<()> {
        let config = self.config.read().clone();

        let engine: Arc<dyn RenderEngine> = (self.engine_factory)();
        engine
            .initialize()
            .map_err(|e| Text2ImageError::EngineInit {
                engine: engine.name().to_string(),
                message: format!("{:#}", e),
            })?;

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&engine),
            Arc::clone(&self.last_error),
        ));

        let requested = self.requested_threads.lock();
        let pool_config = PoolConfig {
            pool_size: requested.unwrap_or(config.pool.pool_size),
            ..config.pool
        };
        let pool = match ThreadPool::new(&pool_config, Arc::clone(&dispatcher)) {
            Ok(pool) => pool,
            Err(e) => {
                engine.shutdown();
                return Err(e);
            }
        };

        *self.runtime.write() = Some(Arc::new(Runtime {
            dispatcher,
            pool,
            sync_gate: RwLock::new(true),
        }));
        drop(requested);

        info!(
            "Initialized with engine '{}' and {} workers",
            engine.name(),
            pool_config.pool_size
        );
        Ok(())
    }

    /// Stop intake, drain the pool, release the engine and free every task.
    ///
    /// Blocks until in-flight renders finish. A no-op when not initialized.
    pub fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock();
        let Some(runtime) = self.runtime.write().take() else {
            debug!("Shutdown requested but context is not initialized");
            return;
        };

        info!("Shutting down");
        runtime.pool.shutdown();

        {
            let mut open = runtime.sync_gate.write();
            *open = false;
        }
        runtime.dispatcher.engine().shutdown();

        let freed = self.registry.clear();
        info!("Shutdown complete ({} tasks released)", freed);
    }

    pub fn is_initialized(&self) -> bool {
        self.runtime.read().is_some()
    }

    /// Register a new pending task. `None` options take the context's
    /// defaults.
    pub fn create_task(
        &self,
        document: &str,
        stylesheet: &str,
        options: Option<RenderOptions>,
    ) -> Result<TaskHandle> {
        let result = self.create_task_inner(document, stylesheet, options);
        self.record(result)
    }

    fn create_task_inner(
        &self,
        document: &str,
        stylesheet: &str,
        options: Option<RenderOptions>,
    ) -> Result<TaskHandle> {
        // Held across the insert so a concurrent shutdown cannot clear the
        // registry underneath it.
        let runtime = self.runtime.read();
        if runtime.is_none() {
            return Err(Text2ImageError::NotInitialized);
        }
        if document.is_empty() {
            return Err(Text2ImageError::InvalidArgument(
                "document must not be empty".to_string(),
            ));
        }
        let options = options.unwrap_or_else(|| self.default_options());
        options.validate()?;

        let task = self
            .registry
            .insert_with(|handle| Task::new(handle, document, stylesheet, options))?;
        Ok(task.handle())
    }

    /// Resolve a handle to the shared task.
    pub fn lookup(&self, handle: TaskHandle) -> Result<Arc<Task>> {
        self.registry
            .get(handle)
            .ok_or(Text2ImageError::TaskNotFound(handle))
    }

    /// Drop the registry's reference. Unknown handles are ignored; a
    /// running task stays alive until its worker is done with it.
    pub fn free_task(&self, handle: TaskHandle) {
        self.registry.remove(handle);
    }

    /// Number of registered tasks.
    pub fn task_count(&self) -> usize {
        self.registry.len()
    }

    /// Render on the calling thread, optionally saving the result.
    pub fn render_sync(&self, handle: TaskHandle, output_path: Option<&Path>) -> Result<()> {
        let result = self.render_sync_inner(handle, output_path);
        self.record(result)
    }

    fn render_sync_inner(&self, handle: TaskHandle, output_path: Option<&Path>) -> Result<()> {
        let runtime = self.current_runtime()?;
        let task = self.lookup(handle)?;

        let open = runtime.sync_gate.read();
        if !*open {
            return Err(Text2ImageError::NotInitialized);
        }
        task.claim()?;
        runtime.dispatcher.execute(&task, output_path)
    }

    /// Queue the task on the pool and return immediately.
    ///
    /// On success the callback runs exactly once on a worker thread. On
    /// failure nothing is queued and the callback is dropped uncalled.
    pub fn render_async(
        &self,
        handle: TaskHandle,
        output_path: Option<PathBuf>,
        callback: Option<RenderCallback>,
    ) -> Result<()> {
        let result = self.render_async_inner(handle, output_path, callback);
        self.record(result)
    }

    fn render_async_inner(
        &self,
        handle: TaskHandle,
        output_path: Option<PathBuf>,
        callback: Option<RenderCallback>,
    ) -> Result<()> {
        let runtime = self.current_runtime()?;
        let task = self.lookup(handle)?;
        task.claim()?;

        let submitted = runtime.pool.submit(Arc::clone(&task), output_path, callback);
        if submitted.is_err() {
            task.release_claim();
        }
        submitted
    }

    /// Copy of the encoded image of a completed task.
    pub fn get_result(&self, handle: TaskHandle) -> Result<Vec<u8>> {
        let result = self.lookup(handle).and_then(|task| match task.result() {
            Some([]) => Err(Text2ImageError::NoResult),
            Some(bytes) => Ok(bytes.to_vec()),
            None if task.status() == TaskStatus::Completed => Err(Text2ImageError::NoResult),
            None => Err(Text2ImageError::TaskNotCompleted {
                status: task.status(),
            }),
        });
        self.record(result)
    }

    /// Cancel a task that has not started rendering.
    pub fn cancel_task(&self, handle: TaskHandle) -> Result<()> {
        let result = self.lookup(handle).and_then(|task| task.cancel());
        if result.is_ok() {
            debug!("Cancelled task {}", handle);
        }
        self.record(result)
    }

    pub fn task_status(&self, handle: TaskHandle) -> Result<TaskStatus> {
        let result = self.lookup(handle).map(|task| task.status());
        self.record(result)
    }

    /// The failure message of a `Failed` task.
    pub fn task_error(&self, handle: TaskHandle) -> Result<Option<String>> {
        let result = self
            .lookup(handle)
            .map(|task| task.error_message().map(str::to_string));
        self.record(result)
    }

    /// The save failure of a task whose render succeeded.
    pub fn task_output_error(&self, handle: TaskHandle) -> Result<Option<String>> {
        let result = self
            .lookup(handle)
            .map(|task| task.output_error().map(str::to_string));
        self.record(result)
    }

    pub fn task_priority(&self, handle: TaskHandle) -> Result<TaskPriority> {
        let result = self.lookup(handle).map(|task| task.priority());
        self.record(result)
    }

    pub fn set_task_priority(&self, handle: TaskHandle, priority: TaskPriority) -> Result<()> {
        let result = self.lookup(handle).map(|task| task.set_priority(priority));
        self.record(result)
    }

    /// Resize the pool. `0` means one worker per CPU core.
    ///
    /// Before initialization the value is remembered and used when the
    /// pool is built.
    pub fn set_max_threads(&self, threads: usize) -> Result<()> {
        let threads = if threads == 0 { num_cpus::get() } else { threads };

        let mut requested = self.requested_threads.lock();
        *requested = Some(threads);

        let runtime = self.runtime.read().clone();
        let result = match runtime {
            Some(runtime) => runtime.pool.set_target_size(threads),
            None => {
                debug!("Pool size {} will apply at initialization", threads);
                Ok(())
            }
        };
        drop(requested);
        self.record(result)
    }

    pub fn health(&self) -> Result<PoolHealth> {
        let result = self.current_runtime().map(|runtime| runtime.pool.health());
        self.record(result)
    }

    /// Options used for tasks created without their own.
    pub fn default_options(&self) -> RenderOptions {
        self.config.read().default_options.clone()
    }

    pub fn config(&self) -> ContextConfig {
        self.config.read().clone()
    }

    /// Message of the most recent failure from any thread.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.message()
    }

    pub fn last_error_code(&self) -> ErrorCode {
        self.last_error.code()
    }

    /// Report a failure detected outside the context, such as a bad
    /// argument at a language boundary.
    pub fn set_last_error(&self, err: &Text2ImageError) {
        debug!("{}", err);
        self.last_error.record(err);
    }

    pub fn clear_last_error(&self) {
        self.last_error.clear();
    }

    fn current_runtime(&self) -> Result<Arc<Runtime>> {
        self.runtime
            .read()
            .clone()
            .ok_or(Text2ImageError::NotInitialized)
    }

    fn record<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(ref err) = result {
            self.set_last_error(err);
        }
        result
    }
}

/// Builder for creating a LibraryContext with custom settings.
pub struct ContextBuilder {
    config: ContextConfig,
    engine_factory: Option<EngineFactory>,
}

impl ContextBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: ContextConfig::default(),
            engine_factory: None,
        }
    }

    /// Set the number of worker threads.
    pub fn pool_size(mut self, size: usize) -> Self {
        self.config.pool.pool_size = size;
        self
    }

    /// Set the worker thread name prefix.
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.pool.thread_name_prefix = prefix.into();
        self
    }

    /// Set the options for tasks created without their own.
    pub fn default_options(mut self, options: RenderOptions) -> Self {
        self.config.default_options = options;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ContextConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom engine, constructed anew at every initialization.
    pub fn engine<E, F>(mut self, make: F) -> Self
    where
        E: RenderEngine + 'static,
        F: Fn() -> E + Send + Sync + 'static,
    {
        self.engine_factory = Some(engine_factory(make));
        self
    }

    /// Validate the configuration and build an uninitialized context.
    pub fn build(self) -> Result<LibraryContext> {
        self.config.validate()?;
        let factory = self
            .engine_factory
            .unwrap_or_else(|| engine_factory(RasterEngine::new));
        Ok(LibraryContext::with_engine_factory(self.config, factory))
    }
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}
