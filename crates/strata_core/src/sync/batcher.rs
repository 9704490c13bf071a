//! # Batcher
//!
//! Bounded fan-out/fan-in barrier.
//!
//! ```text
//!   size(n) ──> submit ──┬──> [batch lane] ──> count_down ─┐
//!               submit ──┼──> [batch lane] ──> count_down ─┼──> wait() returns
//!               submit ──┘                                 │    once count == n
//!                                               ...  ──────┘
//! ```
//!
//! Completion is counted under the latch mutex and the waiter re-checks the
//! count under the same mutex, so tasks finishing before `wait` is called
//! can't be missed.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{PoolError, PoolResult};
use crate::memory::Pooled;
use crate::sync::lane::Job;
use crate::sync::ThreadPool;

/// Reusable completion counter behind a [`Batcher`].
#[derive(Default)]
pub(crate) struct BatchLatch {
    /// Tasks finished in the current round.
    completed: Mutex<usize>,
    done: Condvar,
}

impl BatchLatch {
    /// Starts a new round.
    fn reset(&self) {
        *self.completed.lock() = 0;
    }

    /// Marks one task finished.
    fn count_down(&self) {
        let mut completed = self.completed.lock();
        *completed += 1;
        drop(completed);
        self.done.notify_all();
    }

    /// Blocks until at least `target` tasks have finished.
    fn wait_for(&self, target: usize) {
        let mut completed = self.completed.lock();
        while *completed < target {
            self.done.wait(&mut completed);
        }
    }

    fn completed(&self) -> usize {
        *self.completed.lock()
    }
}

/// Counts its task down when dropped, even if the task panicked.
struct CountDown(Arc<BatchLatch>);

impl Drop for CountDown {
    fn drop(&mut self) {
        self.0.count_down();
    }
}

/// Scoped fan-out/fan-in barrier obtained from [`ThreadPool::batcher`].
///
/// Declare the number of tasks with [`size`](Self::size), submit exactly
/// that many, then [`close`](Self::close) to block until all of them have
/// finished. Dropping an open batcher waits as well.
///
/// Submitting more tasks than declared is rejected with
/// [`PoolError::BatchOverflow`].
///
/// # Example
///
/// ```rust,ignore
/// let mut batch = pool.batcher();
/// batch.size(4);
/// for job in jobs {
///     batch.submit(job)?;
/// }
/// batch.close(); // all four jobs are done past this line
/// ```
pub struct Batcher<'p> {
    pool: &'p ThreadPool,
    latch: Pooled<Arc<BatchLatch>>,
    expected: usize,
    submitted: usize,
    closed: bool,
}

impl<'p> Batcher<'p> {
    pub(crate) fn new(pool: &'p ThreadPool, latch: Pooled<Arc<BatchLatch>>) -> Self {
        latch.reset();
        Self {
            pool,
            latch,
            expected: 0,
            submitted: 0,
            closed: false,
        }
    }

    /// Starts a round of `tasks` tasks.
    ///
    /// Waits for any task still running from the previous round first.
    pub fn size(&mut self, tasks: usize) -> &mut Self {
        self.latch.wait_for(self.submitted);
        self.latch.reset();
        self.expected = tasks;
        self.submitted = 0;
        self.closed = false;
        self
    }

    /// Submits one task of the current round.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::BatchOverflow`] if the round is already full.
    pub fn submit(&mut self, task: impl FnOnce() + Send + 'static) -> PoolResult<()> {
        if self.submitted >= self.expected {
            let error = PoolError::BatchOverflow {
                expected: self.expected,
                attempted: self.submitted + 1,
            };
            tracing::error!(%error, "rejected batch submission");
            return Err(error);
        }
        self.submitted += 1;

        let guard = CountDown(Arc::clone(&self.latch));
        let job: Job = Box::new(move || {
            let _guard = guard;
            task();
        });

        // A job the lane refuses is dropped here, which counts it down
        self.pool.execute_batch(job)
    }

    /// Blocks until every task of the current round has finished.
    ///
    /// Calling it again is a no-op for the same round. If fewer tasks were
    /// submitted than declared, only the submitted ones are awaited.
    pub fn wait(&self) {
        if self.submitted < self.expected {
            tracing::warn!(
                expected = self.expected,
                submitted = self.submitted,
                "batch closed short of its declared size"
            );
        }
        self.latch.wait_for(self.submitted);
    }

    /// Waits for the round and releases the batcher.
    pub fn close(mut self) {
        self.wait();
        self.closed = true;
    }

    /// Tasks declared for the current round.
    #[must_use]
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Tasks finished so far in the current round.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.latch.completed()
    }
}

impl Drop for Batcher<'_> {
    fn drop(&mut self) {
        if !self.closed {
            self.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_batch(pool: &ThreadPool, tasks: usize) -> usize {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut batch = pool.batcher();
        batch.size(tasks);
        for _ in 0..tasks {
            let counter = Arc::clone(&counter);
            batch
                .submit(move || {
                    std::thread::sleep(Duration::from_millis(1));
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        batch.close();
        counter.load(Ordering::SeqCst)
    }

    #[test]
    fn test_barrier_waits_for_all_tasks() {
        for size in [1, 2, 4, 8] {
            let pool = ThreadPool::new(size).unwrap();
            assert_eq!(counting_batch(&pool, 16), 16, "pool size {size}");
        }
    }

    #[test]
    fn test_overflow_is_rejected() {
        let pool = ThreadPool::new(4).unwrap();
        let mut batch = pool.batcher();
        batch.size(2);
        batch.submit(|| {}).unwrap();
        batch.submit(|| {}).unwrap();

        let err = batch.submit(|| {}).unwrap_err();
        assert_eq!(
            err,
            PoolError::BatchOverflow {
                expected: 2,
                attempted: 3
            }
        );
        batch.close();
    }

    #[test]
    fn test_wait_twice_does_not_double_count() {
        let pool = ThreadPool::new(3).unwrap();
        let mut batch = pool.batcher();
        batch.size(3);
        for _ in 0..3 {
            batch.submit(|| {}).unwrap();
        }
        batch.wait();
        batch.wait();
        assert_eq!(batch.completed(), 3);
        drop(batch);
    }

    #[test]
    fn test_reuse_after_resize() {
        let pool = ThreadPool::new(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut batch = pool.batcher();

        for round in 1..=3 {
            batch.size(round);
            for _ in 0..round {
                let counter = Arc::clone(&counter);
                batch
                    .submit(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
            }
            batch.wait();
            assert_eq!(batch.completed(), round);
        }

        batch.close();
        assert_eq!(counter.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_panicking_task_still_counts_down() {
        let pool = ThreadPool::new(4).unwrap();
        let mut batch = pool.batcher();
        batch.size(2);
        batch.submit(|| panic!("sub-job failed")).unwrap();
        batch.submit(|| {}).unwrap();
        batch.wait();
        assert_eq!(batch.completed(), 2);
    }

    #[test]
    fn test_latches_are_recycled() {
        let pool = ThreadPool::new(4).unwrap();
        for _ in 0..10 {
            let mut batch = pool.batcher();
            batch.size(1);
            batch.submit(|| {}).unwrap();
            batch.close();
        }
        assert_eq!(pool.idle_batchers(), 1);
    }
}
