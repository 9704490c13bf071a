//! # Memory Management
//!
//! Recycling pools for the large buffers tiles are built from.
//!
//! ## Design Philosophy
//!
//! Tile buffers are allocated once and reused:
//! - A checkout never fails, an empty pool just allocates
//! - A return never blocks, a full pool just drops
//! - A checked-out item is owned by exactly one guard

mod pool;

pub use pool::{ArrayPool, ObjectPool, PoolStats, Pooled};
