//! # Core Error Types
//!
//! Errors raised by the worker lanes, batch barriers and cache entries.

use thiserror::Error;

/// Errors that can occur in the concurrency layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// More tasks were submitted to a batcher than it was sized for.
    #[error("batch overflow: batcher sized for {expected} tasks, got task #{attempted}")]
    BatchOverflow {
        /// The size declared through `Batcher::size`.
        expected: usize,
        /// The 1-based index of the rejected submission.
        attempted: usize,
    },

    /// A task panicked before producing its result.
    #[error("task panicked: {0}")]
    TaskPanicked(String),

    /// The task was dropped before it produced a result.
    #[error("task was dropped before it produced a result")]
    Abandoned,

    /// The worker lane has shut down and no longer accepts work.
    #[error("worker lane `{0}` is shut down")]
    ShutDown(&'static str),

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

impl PoolError {
    /// Builds a [`PoolError::TaskPanicked`] from a caught panic payload.
    #[must_use]
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        Self::TaskPanicked(message)
    }
}

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;
