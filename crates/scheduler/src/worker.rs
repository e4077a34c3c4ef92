//! Decode worker pool.
//!
//! A fixed set of threads pull dispatches from the [`PriorityScheduler`],
//! run the decode executor, and report the outcome. The number of threads
//! bounds how many decodes run at once.

use crate::scheduler::{Dispatch, JobOutcome, PriorityScheduler};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Default number of decode workers.
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// Default time a worker waits for work before rechecking shutdown.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Callback that performs one page decode.
///
/// Invoked on a worker thread for every dispatched item whose generation is
/// still current. The page stays marked in flight until the executor drops
/// or [releases](Dispatch::release) the dispatch. The returned outcome is
/// recorded in the scheduler stats.
pub type DecodeExecutor = Arc<dyn Fn(Dispatch) -> JobOutcome + Send + Sync>;

/// Configuration for the decode worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker threads to spawn.
    /// Default: 3.
    pub num_workers: usize,

    /// Maximum time a worker will wait for a dispatch before checking shutdown.
    /// Default: 50ms.
    pub poll_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: DEFAULT_WORKER_COUNT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl WorkerPoolConfig {
    /// Create a new worker pool configuration. Zero is raised to one worker.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers: num_workers.max(1),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set the poll interval for workers.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Decode worker pool.
///
/// Dropping the pool closes the scheduler and joins every worker. A decode
/// that is already running is allowed to finish first.
///
/// # Example
///
/// ```
/// use djvu_reader_scheduler::{
///     Dispatch, JobOutcome, PriorityScheduler, Tier, WorkerPool, WorkerPoolConfig,
/// };
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let scheduler = Arc::new(PriorityScheduler::default());
/// let executor = Arc::new(|dispatch: Dispatch| {
///     println!("decoding page {}", dispatch.item.page_index);
///     JobOutcome::Completed
/// });
///
/// let pool = WorkerPool::new(scheduler.clone(), executor, WorkerPoolConfig::default()).unwrap();
///
/// let generation = scheduler.begin_generation();
/// scheduler.submit(0, Tier::Interactive, generation);
/// assert!(scheduler.wait_idle(Duration::from_secs(5)));
///
/// pool.shutdown();
/// ```
pub struct WorkerPool {
    workers: Vec<Worker>,
    shutdown: Arc<AtomicBool>,
    scheduler: Arc<PriorityScheduler>,
}

impl WorkerPool {
    /// Create and start a new worker pool.
    ///
    /// # Arguments
    ///
    /// * `scheduler` - Scheduler to pull dispatches from
    /// * `executor` - Decode callback
    /// * `config` - Worker pool configuration
    ///
    /// # Errors
    ///
    /// Returns an error if a worker thread cannot be spawned. Workers that
    /// were already started are shut down before returning.
    pub fn new(
        scheduler: Arc<PriorityScheduler>,
        executor: DecodeExecutor,
        config: WorkerPoolConfig,
    ) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut pool = Self {
            workers: Vec::with_capacity(config.num_workers),
            shutdown: shutdown.clone(),
            scheduler: scheduler.clone(),
        };

        for id in 0..config.num_workers {
            let worker = Worker::spawn(
                id,
                scheduler.clone(),
                executor.clone(),
                shutdown.clone(),
                config.poll_interval,
            )?;
            pool.workers.push(worker);
        }

        tracing::debug!(workers = config.num_workers, "decode worker pool started");
        Ok(pool)
    }

    /// Get the number of worker threads.
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Check if the worker pool is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Shutdown the worker pool gracefully.
    ///
    /// Blocks until every worker has finished its current decode and exited.
    pub fn shutdown(self) {
        drop(self);
    }

    fn stop_and_join(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.scheduler.close();

        for worker in self.workers.drain(..) {
            worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.stop_and_join();
            tracing::debug!("decode worker pool stopped");
        }
    }
}

/// A single worker thread in the worker pool.
struct Worker {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(
        id: usize,
        scheduler: Arc<PriorityScheduler>,
        executor: DecodeExecutor,
        shutdown: Arc<AtomicBool>,
        poll_interval: Duration,
    ) -> std::io::Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("djvu-decode-worker-{}", id))
            .spawn(move || {
                Self::run(scheduler, executor, shutdown, poll_interval);
            })?;

        Ok(Self {
            id,
            thread: Some(thread),
        })
    }

    /// Main worker loop.
    ///
    /// The generation is checked again after dispatch; an item that went
    /// stale while waiting is not decoded. The dispatch (and with it the
    /// in-flight mark) is gone before the outcome is reported, even if the
    /// executor panics.
    fn run(
        scheduler: Arc<PriorityScheduler>,
        executor: DecodeExecutor,
        shutdown: Arc<AtomicBool>,
        poll_interval: Duration,
    ) {
        while !shutdown.load(Ordering::Acquire) {
            let Some(dispatch) = scheduler.wait_for_dispatch(poll_interval) else {
                continue;
            };

            let page = dispatch.item.page_index;
            let outcome = if scheduler.is_current(dispatch.item.generation) {
                let executor = &executor;
                panic::catch_unwind(AssertUnwindSafe(move || executor(dispatch))).unwrap_or_else(
                    |_| {
                        tracing::error!(page, "decode executor panicked");
                        JobOutcome::Failed
                    },
                )
            } else {
                drop(dispatch);
                JobOutcome::Discarded
            };

            scheduler.finish(outcome);
        }
    }

    /// Wait for the worker thread to finish.
    fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!(worker = self.id, "decode worker exited by panic");
            }
        }
    }
}
