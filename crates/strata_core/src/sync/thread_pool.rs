//! # Thread Pool
//!
//! One handle, three execution strategies chosen by size:
//!
//! ```text
//!   size 1   Synchronous   submit() is lazy, execute() runs inline
//!   size 2   Shared        one lane of 2 workers, no batching
//!   size 3+  Split         task lane (size/3) + batch lane (the rest)
//! ```
//!
//! The split lanes keep a long batched generation from starving direct
//! submissions. The pool is an ordinary value: construct it once, share it
//! through an `Arc`, drop it to join the workers.

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::error::PoolResult;
use crate::memory::ObjectPool;
use crate::sync::batcher::{BatchLatch, Batcher};
use crate::sync::lane::{Job, WorkerLane};
use crate::sync::task::{run_guarded, Task};

/// Idle batch latches kept per pool.
const LATCH_RETAIN: usize = 16;

/// How the pool executes work.
enum Strategy {
    /// Everything runs on the calling thread.
    Synchronous,
    /// One lane for tasks and batches alike.
    Shared(WorkerLane),
    /// Separate lanes for direct tasks and batch sub-jobs.
    Split {
        tasks: WorkerLane,
        batches: WorkerLane,
    },
}

/// A fixed-size worker pool with an optional batch lane.
///
/// # Example
///
/// ```rust,ignore
/// let pool = ThreadPool::new(4)?;
/// let answer = pool.submit(|| 6 * 7).join()?;
/// assert_eq!(answer, 42);
/// ```
pub struct ThreadPool {
    size: usize,
    strategy: Strategy,
    latches: ObjectPool<Arc<BatchLatch>>,
}

impl ThreadPool {
    /// Creates a pool of `size` threads.
    ///
    /// `0` means one thread per available core.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Spawn`](crate::PoolError::Spawn) if a worker
    /// thread could not be started.
    pub fn new(size: usize) -> PoolResult<Self> {
        let size = if size == 0 {
            std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
        } else {
            size
        };

        let strategy = match size {
            1 => Strategy::Synchronous,
            2 => Strategy::Shared(WorkerLane::spawn("shared", 2)?),
            _ => {
                let task_threads = (size / 3).max(1);
                Strategy::Split {
                    tasks: WorkerLane::spawn("task", task_threads)?,
                    batches: WorkerLane::spawn("batch", size - task_threads)?,
                }
            }
        };

        let pool = Self {
            size,
            strategy,
            latches: ObjectPool::new(LATCH_RETAIN, || Arc::new(BatchLatch::default())),
        };
        tracing::info!(size, strategy = pool.strategy_name(), "thread pool started");
        Ok(pool)
    }

    /// Creates a pool that runs everything on the calling thread.
    #[must_use]
    pub fn synchronous() -> Self {
        Self {
            size: 1,
            strategy: Strategy::Synchronous,
            latches: ObjectPool::new(LATCH_RETAIN, || Arc::new(BatchLatch::default())),
        }
    }

    /// Configured parallelism.
    #[must_use]
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the pool has a dedicated batch lane.
    #[must_use]
    #[inline]
    pub fn supports_batching(&self) -> bool {
        self.size > 2
    }

    /// Name of the active strategy, for logs.
    #[must_use]
    pub fn strategy_name(&self) -> &'static str {
        match self.strategy {
            Strategy::Synchronous => "synchronous",
            Strategy::Shared(_) => "shared",
            Strategy::Split { .. } => "split",
        }
    }

    /// Jobs waiting in the pool's queues.
    #[must_use]
    pub fn queued(&self) -> usize {
        match &self.strategy {
            Strategy::Synchronous => 0,
            Strategy::Shared(lane) => lane.queued(),
            Strategy::Split { tasks, batches } => tasks.queued() + batches.queued(),
        }
    }

    /// Submits a task and returns a handle to its result.
    ///
    /// On the synchronous strategy the task does not run until the handle is
    /// joined.
    pub fn submit<T, F>(&self, task: F) -> Task<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let lane = match &self.strategy {
            Strategy::Synchronous => return Task::deferred(task),
            Strategy::Shared(lane) | Strategy::Split { tasks: lane, .. } => lane,
        };

        let (sender, receiver) = crossbeam_channel::bounded(1);
        let job: Job = Box::new(move || {
            // The handle may have been dropped already
            let _ = sender.send(run_guarded(task));
        });
        match lane.execute(job) {
            Ok(()) => Task::pending(receiver),
            Err(error) => Task::ready(Err(error)),
        }
    }

    /// Runs a job without a result handle.
    ///
    /// On the synchronous strategy the job runs before this returns. Panics
    /// are caught and logged.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::ShutDown`](crate::PoolError::ShutDown) if the
    /// task lane no longer accepts work.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) -> PoolResult<()> {
        match &self.strategy {
            Strategy::Synchronous => {
                Self::run_inline(Box::new(job));
                Ok(())
            }
            Strategy::Shared(lane) | Strategy::Split { tasks: lane, .. } => {
                lane.execute(Box::new(job))
            }
        }
    }

    /// Checks out a batcher.
    ///
    /// Its latch is recycled when the batcher is dropped.
    #[must_use]
    pub fn batcher(&self) -> Batcher<'_> {
        Batcher::new(self, self.latches.get())
    }

    /// Idle batch latches ready for reuse.
    #[must_use]
    pub fn idle_batchers(&self) -> usize {
        self.latches.free_count()
    }

    /// Routes a batch sub-job to the lane that serves batches.
    pub(crate) fn execute_batch(&self, job: Job) -> PoolResult<()> {
        match &self.strategy {
            Strategy::Synchronous => {
                Self::run_inline(job);
                Ok(())
            }
            Strategy::Shared(lane) | Strategy::Split { batches: lane, .. } => lane.execute(job),
        }
    }

    fn run_inline(job: Job) {
        if let Err(error) = run_guarded(job) {
            tracing::error!(%error, "inline job failed");
        }
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("size", &self.size)
            .field("strategy", &self.strategy_name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PoolError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_strategy_by_size() {
        assert_eq!(ThreadPool::new(1).unwrap().strategy_name(), "synchronous");
        assert_eq!(ThreadPool::new(2).unwrap().strategy_name(), "shared");
        assert_eq!(ThreadPool::new(3).unwrap().strategy_name(), "split");

        assert!(!ThreadPool::new(2).unwrap().supports_batching());
        assert!(ThreadPool::new(3).unwrap().supports_batching());
        assert!(ThreadPool::new(0).unwrap().size() >= 1);
    }

    #[test]
    fn test_synchronous_submit_is_lazy() {
        let pool = ThreadPool::synchronous();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&counter);
        let task = pool.submit(move || c.fetch_add(1, Ordering::SeqCst) + 1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        assert_eq!(task.join(), Ok(1));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_submit_runs_off_thread() {
        let pool = ThreadPool::new(4).unwrap();
        let caller = thread::current().id();
        let worker = pool.submit(move || thread::current().id()).join().unwrap();
        assert_ne!(worker, caller);
    }

    #[test]
    fn test_submit_reports_panic() {
        let pool = ThreadPool::new(2).unwrap();
        let task: Task<()> = pool.submit(|| panic!("no terrain today"));
        assert_eq!(
            task.join(),
            Err(PoolError::TaskPanicked("no terrain today".to_string()))
        );
    }

    #[test]
    fn test_execute_drains_before_drop() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new(3).unwrap();
            for _ in 0..64 {
                let counter = Arc::clone(&counter);
                pool.execute(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn test_batches_do_not_block_tasks() {
        let pool = ThreadPool::new(3).unwrap();
        let (release, gate) = crossbeam_channel::bounded::<()>(0);

        // Occupy both batch workers until the direct task has answered
        let mut batch = pool.batcher();
        batch.size(2);
        for _ in 0..2 {
            let gate = gate.clone();
            batch
                .submit(move || {
                    let _ = gate.recv();
                })
                .unwrap();
        }

        assert_eq!(pool.submit(|| 7).join(), Ok(7));
        drop(release);
        batch.close();
    }
}
