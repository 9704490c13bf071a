//! # Recycling Pools
//!
//! Bounded free lists for large arrays and scratch objects that are
//! frequently checked out and returned.
//!
//! A checkout is a [`Pooled`] guard. Dropping (or closing) the guard hands
//! the item back to its free list, or discards it when the list is already
//! at its retain limit. The guard is move-only, so an item can't be used
//! after it has been returned.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Counters describing pool traffic.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Items created because the free list was empty.
    pub allocated: u64,
    /// Checkouts served from the free list.
    pub reused: u64,
    /// Items handed back and kept.
    pub returned: u64,
    /// Items handed back and dropped because the free list was full.
    pub discarded: u64,
}

/// Shared free list behind every pool and guard.
struct FreeList<T> {
    /// Items ready for reuse.
    items: Mutex<Vec<T>>,
    /// Maximum number of items kept.
    retain: usize,
    allocated: AtomicU64,
    reused: AtomicU64,
    returned: AtomicU64,
    discarded: AtomicU64,
}

impl<T> FreeList<T> {
    fn new(retain: usize) -> Self {
        Self {
            items: Mutex::new(Vec::with_capacity(retain)),
            retain,
            allocated: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            returned: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    fn take(&self) -> Option<T> {
        let item = self.items.lock().pop();
        if item.is_some() {
            self.reused.fetch_add(1, Ordering::Relaxed);
        } else {
            self.allocated.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    fn give_back(&self, item: T) {
        let mut items = self.items.lock();
        if items.len() < self.retain {
            items.push(item);
            drop(items);
            self.returned.fetch_add(1, Ordering::Relaxed);
        } else {
            drop(items);
            self.discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn free_count(&self) -> usize {
        self.items.lock().len()
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// A checked-out pool item.
///
/// Returns the item to its pool when dropped or closed.
pub struct Pooled<T> {
    /// `None` only while the guard is being torn down.
    item: Option<T>,
    home: Arc<FreeList<T>>,
}

impl<T> Pooled<T> {
    fn new(item: T, home: Arc<FreeList<T>>) -> Self {
        Self {
            item: Some(item),
            home,
        }
    }

    /// Returns the item to its pool now.
    ///
    /// Equivalent to dropping the guard.
    pub fn close(self) {
        drop(self);
    }

    /// Takes the item out of the pool's custody for good.
    ///
    /// The item will not be returned to the pool.
    #[must_use]
    pub fn detach(mut self) -> T {
        match self.item.take() {
            Some(item) => item,
            None => unreachable!("pooled item already released"),
        }
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        match &self.item {
            Some(item) => item,
            None => unreachable!("pooled item already released"),
        }
    }
}

impl<T> DerefMut for Pooled<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.item {
            Some(item) => item,
            None => unreachable!("pooled item already released"),
        }
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.home.give_back(item);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pooled").field(&self.item).finish()
    }
}

/// A pool of objects built by a factory.
///
/// # Thread Safety
///
/// Cloning the pool shares the same free list. All operations take a
/// single short-lived lock.
///
/// # Example
///
/// ```rust,ignore
/// let pool = ObjectPool::new(8, || Vec::<u8>::with_capacity(4096));
///
/// let mut scratch = pool.get();
/// scratch.push(1);
/// drop(scratch); // back in the free list
/// ```
pub struct ObjectPool<T> {
    shared: Arc<FreeList<T>>,
    factory: Arc<dyn Fn() -> T + Send + Sync>,
}

impl<T> ObjectPool<T> {
    /// Creates a pool that keeps at most `retain` idle objects.
    #[must_use]
    pub fn new(retain: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            shared: Arc::new(FreeList::new(retain)),
            factory: Arc::new(factory),
        }
    }

    /// Checks out an object, building a fresh one if none is idle.
    #[must_use]
    pub fn get(&self) -> Pooled<T> {
        let item = self.shared.take().unwrap_or_else(|| (self.factory)());
        Pooled::new(item, Arc::clone(&self.shared))
    }

    /// Pre-builds up to `count` objects into the free list.
    pub fn warm(&self, count: usize) {
        let mut items = self.shared.items.lock();
        while items.len() < count.min(self.shared.retain) {
            items.push((self.factory)());
        }
    }

    /// Number of idle objects.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.shared.free_count()
    }

    /// Maximum number of idle objects kept.
    #[must_use]
    pub fn retain(&self) -> usize {
        self.shared.retain
    }

    /// Traffic counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }
}

impl<T> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            factory: Arc::clone(&self.factory),
        }
    }
}

/// A pool of `Vec<T>` buffers.
///
/// Buffers come back resized to the requested length. Elements that were
/// already in a recycled buffer are kept as they are, so element types that
/// carry state should be reset before the buffer is returned.
pub struct ArrayPool<T> {
    shared: Arc<FreeList<Vec<T>>>,
}

impl<T: Default> ArrayPool<T> {
    /// Creates a pool that keeps at most `retain` idle arrays.
    #[must_use]
    pub fn new(retain: usize) -> Self {
        Self {
            shared: Arc::new(FreeList::new(retain)),
        }
    }

    /// Checks out an array of exactly `size` elements.
    ///
    /// Never fails: an empty free list means a fresh allocation.
    #[must_use]
    pub fn get(&self, size: usize) -> Pooled<Vec<T>> {
        let array = match self.shared.take() {
            Some(mut array) => {
                array.truncate(size);
                array.resize_with(size, T::default);
                array
            }
            None => {
                let mut array = Vec::with_capacity(size);
                array.resize_with(size, T::default);
                array
            }
        };
        Pooled::new(array, Arc::clone(&self.shared))
    }

    /// Pre-allocates up to `count` arrays of `size` elements.
    pub fn warm(&self, count: usize, size: usize) {
        let mut items = self.shared.items.lock();
        while items.len() < count.min(self.shared.retain) {
            let mut array = Vec::with_capacity(size);
            array.resize_with(size, T::default);
            items.push(array);
        }
    }

    /// Number of idle arrays.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.shared.free_count()
    }

    /// Maximum number of idle arrays kept.
    #[must_use]
    pub fn retain(&self) -> usize {
        self.shared.retain
    }

    /// Traffic counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }
}

impl<T> Clone for ArrayPool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}
