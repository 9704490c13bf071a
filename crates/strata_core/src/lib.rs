//! # STRATA Core
//!
//! Memory and concurrency primitives for lazily generated, pooled terrain:
//! - Bounded recycling pools for large arrays and scratch objects
//! - A thread pool with synchronous, shared and split strategies
//! - A fan-out/fan-in batch barrier
//! - An expiring, at-most-once memoization cache
//!
//! ## Architecture Rules
//!
//! 1. **No global state** - pools and caches are constructed and passed down
//! 2. **Move-only handles** - a returned pool item can't be touched again
//! 3. **Blocking waits only** - condition variables and channels, no spinning
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use strata_core::{Cache, ThreadPool};
//!
//! let pool = Arc::new(ThreadPool::new(0)?);
//! let cache: Cache<u64> = Cache::new(pool, Duration::from_secs(30), Duration::from_secs(5));
//! let value = cache.get_or_compute(42, || Ok(42 * 42))?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod cache;
pub mod error;
pub mod memory;
pub mod sync;

pub use cache::{Cache, CacheEntry, CacheStats, DeadCheck, EvictHook};
pub use error::{PoolError, PoolResult};
pub use memory::{ArrayPool, ObjectPool, PoolStats, Pooled};
pub use sync::{Batcher, Task, ThreadPool};
