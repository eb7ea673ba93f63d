//! Resizable worker pool for asynchronous rendering.
//!
//! Workers are OS threads sharing one FIFO queue guarded by a mutex and a
//! condition variable. The target size can change at runtime: growing
//! spawns the missing workers immediately, shrinking lets idle workers
//! retire on their own. Shutdown stops intake and drains what is already
//! queued before joining every worker.

use crate::config::PoolConfig;
use crate::dispatch::{panic_message, Dispatcher};
use crate::error::{Result, Text2ImageError};
use crate::registry::TaskHandle;
use crate::task::Task;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Completion notification, invoked once with the final success flag.
pub type RenderCallback = Box<dyn FnOnce(TaskHandle, bool) + Send + 'static>;

/// A queued render request.
struct Job {
    task: Arc<Task>,
    /// Where to save the result, if anywhere.
    output_path: Option<PathBuf>,
    callback: Option<RenderCallback>,
}

/// Everything guarded by the pool lock.
#[derive(Default)]
struct PoolState {
    queue: VecDeque<Job>,
    /// Desired number of workers.
    target: usize,
    /// Workers that have been spawned and have not exited.
    live: usize,
    /// Workers currently executing a job.
    active: usize,
    /// Jobs finished since the pool started.
    completed: u64,
    stopping: bool,
    next_worker_id: usize,
}

struct PoolShared {
    state: Mutex<PoolState>,
    available: Condvar,
    dispatcher: Arc<Dispatcher>,
    thread_name_prefix: String,
}

impl PoolShared {
    fn worker_loop(&self, id: usize) {
        debug!("Worker {} started", id);
        loop {
            let job = {
                let mut state = self.state.lock();
                loop {
                    if state.live > state.target {
                        state.live -= 1;
                        debug!("Worker {} retiring (target {})", id, state.target);
                        return;
                    }
                    if let Some(job) = state.queue.pop_front() {
                        state.active += 1;
                        break job;
                    }
                    if state.stopping {
                        state.live -= 1;
                        debug!("Worker {} exiting", id);
                        return;
                    }
                    self.available.wait(&mut state);
                }
            };

            self.run(job);

            let mut state = self.state.lock();
            state.active -= 1;
            state.completed += 1;
        }
    }

    fn run(&self, job: Job) {
        let Job {
            task,
            output_path,
            callback,
        } = job;
        let handle = task.handle();

        let success = match self.dispatcher.execute(&task, output_path.as_deref()) {
            Ok(()) => true,
            Err(err) => {
                if matches!(err, Text2ImageError::TaskCancelled) {
                    debug!("Task {} was cancelled before rendering", handle);
                }
                self.dispatcher.last_error().record(&err);
                false
            }
        };
        // The callback may free the task; drop the worker's reference first.
        drop(task);

        if let Some(callback) = callback {
            if let Err(payload) =
                panic::catch_unwind(AssertUnwindSafe(move || callback(handle, success)))
            {
                error!(
                    "Completion callback for task {} panicked: {}",
                    handle,
                    panic_message(payload.as_ref())
                );
            }
        }
    }
}

/// Pool of render worker threads.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("health", &self.health())
            .finish()
    }
}

impl ThreadPool {
    /// Create a pool and spawn `config.pool_size` workers.
    pub fn new(config: &PoolConfig, dispatcher: Arc<Dispatcher>) -> Result<Self> {
        config.validate()?;

        let pool = Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState::default()),
                available: Condvar::new(),
                dispatcher,
                thread_name_prefix: config.thread_name_prefix.clone(),
            }),
            workers: Mutex::new(Vec::with_capacity(config.pool_size)),
        };
        pool.set_target_size(config.pool_size)?;

        info!("Thread pool started with {} workers", config.pool_size);
        Ok(pool)
    }

    /// Queue a task for rendering and wake one idle worker.
    pub fn submit(
        &self,
        task: Arc<Task>,
        output_path: Option<PathBuf>,
        callback: Option<RenderCallback>,
    ) -> Result<()> {
        let handle = task.handle();
        {
            let mut state = self.shared.state.lock();
            if state.stopping {
                return Err(Text2ImageError::PoolStopped);
            }
            state.queue.push_back(Job {
                task,
                output_path,
                callback,
            });
        }
        self.shared.available.notify_one();
        debug!("Queued task {}", handle);
        Ok(())
    }

    /// Change the number of workers. Values below 1 are raised to 1.
    ///
    /// Growth spawns the missing workers before returning. Shrinking only
    /// lowers the target; idle workers notice and exit, busy ones finish
    /// their current task first.
    pub fn set_target_size(&self, size: usize) -> Result<()> {
        let size = size.max(1);
        // Held until the new handles are stored, so a concurrent shutdown
        // either sees them or makes this call fail on `stopping`.
        let mut workers = self.workers.lock();
        let ids: Vec<usize> = {
            let mut state = self.shared.state.lock();
            if state.stopping {
                return Err(Text2ImageError::PoolStopped);
            }
            let previous = state.target;
            state.target = size;

            let missing = size.saturating_sub(state.live);
            state.live += missing;
            let first = state.next_worker_id;
            state.next_worker_id += missing;

            if size < previous {
                debug!("Shrinking pool from {} to {} workers", previous, size);
                self.shared.available.notify_all();
            }
            (first..first + missing).collect()
        };

        workers.retain(|worker| !worker.is_finished());

        for (spawned, id) in ids.iter().copied().enumerate() {
            let shared = Arc::clone(&self.shared);
            let spawn = thread::Builder::new()
                .name(format!("{}-{}", self.shared.thread_name_prefix, id))
                .spawn(move || shared.worker_loop(id));
            match spawn {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    self.shared.state.lock().live -= ids.len() - spawned;
                    error!("Failed to spawn worker {}: {}", id, e);
                    return Err(Text2ImageError::WorkerSpawnFailed(e));
                }
            }
        }

        if !ids.is_empty() {
            debug!("Spawned {} workers (target {})", ids.len(), size);
        }
        Ok(())
    }

    /// Desired number of workers.
    pub fn target_size(&self) -> usize {
        self.shared.state.lock().target
    }

    /// Workers that have not exited yet. Converges to the target after a
    /// shrink.
    pub fn worker_count(&self) -> usize {
        self.shared.state.lock().live
    }

    /// Get pool health information.
    pub fn health(&self) -> PoolHealth {
        let state = self.shared.state.lock();
        PoolHealth {
            target_size: state.target,
            workers: state.live,
            active: state.active,
            queued: state.queue.len(),
            completed: state.completed,
            is_shutdown: state.stopping,
        }
    }

    /// Stop intake, drain the queue and join every worker.
    ///
    /// Safe to call more than once. When called from a worker thread (for
    /// example from a completion callback), that worker is left to exit on
    /// its own instead of being joined.
    pub fn shutdown(&self) {
        let already_stopping = {
            let mut state = self.shared.state.lock();
            std::mem::replace(&mut state.stopping, true)
        };
        self.shared.available.notify_all();

        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        if !already_stopping {
            info!("Shutting down thread pool");
        }

        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                warn!("Thread pool shut down from one of its own workers");
                continue;
            }
            if worker.join().is_err() {
                error!("Worker thread panicked");
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Health information for the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolHealth {
    /// Desired number of workers.
    pub target_size: usize,
    /// Workers alive right now.
    pub workers: usize,
    /// Workers executing a task.
    pub active: usize,
    /// Tasks waiting in the queue.
    pub queued: usize,
    /// Tasks finished since the pool started.
    pub completed: u64,
    /// Whether the pool is shut down.
    pub is_shutdown: bool,
}
