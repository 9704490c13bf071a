//! # Task Handles
//!
//! The result side of a submitted task.

use std::panic::{catch_unwind, AssertUnwindSafe};

use crossbeam_channel::Receiver;

use crate::error::{PoolError, PoolResult};

/// Where a task's result will come from.
enum TaskState<T> {
    /// Not run yet; runs on the thread that first asks for it.
    Deferred(Box<dyn FnOnce() -> T + Send>),
    /// Running (or queued) on a worker lane.
    Pending(Receiver<PoolResult<T>>),
    /// Already resolved.
    Ready(PoolResult<T>),
}

/// Handle to a task submitted to a [`ThreadPool`](super::ThreadPool).
///
/// `join` blocks until the result is available. A panic inside the task is
/// reported as [`PoolError::TaskPanicked`].
pub struct Task<T> {
    state: TaskState<T>,
}

impl<T> Task<T> {
    /// Wraps a closure evaluated on first access.
    pub(crate) fn deferred(task: impl FnOnce() -> T + Send + 'static) -> Self {
        Self {
            state: TaskState::Deferred(Box::new(task)),
        }
    }

    /// Wraps the receiving end of a worker lane job.
    pub(crate) fn pending(receiver: Receiver<PoolResult<T>>) -> Self {
        Self {
            state: TaskState::Pending(receiver),
        }
    }

    /// Wraps an already known result.
    pub(crate) fn ready(result: PoolResult<T>) -> Self {
        Self {
            state: TaskState::Ready(result),
        }
    }

    /// Returns true if `join` would not block.
    ///
    /// Deferred tasks report `false` until joined.
    #[must_use]
    pub fn is_done(&self) -> bool {
        match &self.state {
            TaskState::Deferred(_) => false,
            TaskState::Pending(receiver) => !receiver.is_empty(),
            TaskState::Ready(_) => true,
        }
    }

    /// Blocks until the task has finished and returns its result.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::TaskPanicked`] if the task panicked, or
    /// [`PoolError::Abandoned`] if its lane shut down before running it.
    pub fn join(self) -> PoolResult<T> {
        match self.state {
            TaskState::Deferred(task) => run_guarded(task),
            TaskState::Pending(receiver) => receiver.recv().unwrap_or(Err(PoolError::Abandoned)),
            TaskState::Ready(result) => result,
        }
    }
}

/// Runs `task`, turning a panic into an error.
pub(crate) fn run_guarded<T>(task: impl FnOnce() -> T) -> PoolResult<T> {
    catch_unwind(AssertUnwindSafe(task)).map_err(|payload| PoolError::from_panic(payload.as_ref()))
}
