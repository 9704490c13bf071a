//! # Concurrency Primitives
//!
//! Worker lanes, task handles and the batch barrier used to build tiles in
//! parallel.
//!
//! ## The Problem
//!
//! ```text
//! Direct lookups:     short, latency sensitive
//! Batched generation: long, fans out into many sub-jobs
//!
//! One shared queue:   a batched build starves every lookup behind it
//! ```
//!
//! ## The Solution: Lanes
//!
//! ```text
//!   submit()/execute() ──> [task lane]
//!   Batcher::submit()  ──> [batch lane] ──> latch ──> Batcher::wait()
//! ```
//!
//! Waiting is always a blocking wait on a condition variable or channel.

mod batcher;
mod lane;
mod task;
mod thread_pool;

pub use batcher::Batcher;
pub use task::Task;
pub(crate) use task::run_guarded;
pub use thread_pool::ThreadPool;
