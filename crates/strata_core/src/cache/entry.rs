//! # Cache Entries
//!
//! A lazily evaluated, at-most-once computation with a last-access stamp.
//!
//! ```text
//!   Pending(factory) ──first get()──> Running ──> Done(Ok | Err)
//!                                        │
//!                      later get() ──────┘ wait on condvar
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::PoolError;
use crate::sync::{run_guarded, Task, ThreadPool};

/// Boxed computation producing an entry's value.
pub(crate) type Factory<V, E> = Box<dyn FnOnce() -> Result<V, E> + Send>;

enum EntryState<V, E> {
    /// Not started.
    Pending(Factory<V, E>),
    /// A thread is running the factory.
    Running,
    /// Resolved, successfully or not.
    Done(Result<V, E>),
}

/// A memoized value computed at most once.
///
/// The first caller of [`get`](Self::get) runs the factory on its own
/// thread; everyone else blocks until the result is published. A panic in
/// the factory resolves the entry with [`PoolError::TaskPanicked`] converted
/// into `E`.
pub struct CacheEntry<V, E = PoolError> {
    key: u64,
    state: Mutex<EntryState<V, E>>,
    ready: Condvar,
    /// Last access, in milliseconds on the owning cache's clock.
    timestamp: AtomicU64,
}

impl<V, E> CacheEntry<V, E>
where
    V: Clone,
    E: Clone + From<PoolError>,
{
    pub(crate) fn new(key: u64, now_ms: u64, factory: Factory<V, E>) -> Self {
        Self {
            key,
            state: Mutex::new(EntryState::Pending(factory)),
            ready: Condvar::new(),
            timestamp: AtomicU64::new(now_ms),
        }
    }

    /// Key this entry is stored under.
    #[must_use]
    #[inline]
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Last access time in milliseconds since the cache was created.
    #[must_use]
    #[inline]
    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }

    /// Records an access at `now_ms`.
    #[inline]
    pub(crate) fn touch(&self, now_ms: u64) {
        self.timestamp.fetch_max(now_ms, Ordering::AcqRel);
    }

    /// Returns true once the value (or its error) is available.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(*self.state.lock(), EntryState::Done(_))
    }

    /// Returns true if the computation resolved with an error.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(*self.state.lock(), EntryState::Done(Err(_)))
    }

    /// Returns true while a thread is running the factory.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), EntryState::Running)
    }

    /// The resolved result, without blocking or starting the computation.
    #[must_use]
    pub fn peek(&self) -> Option<Result<V, E>> {
        match &*self.state.lock() {
            EntryState::Done(result) => Some(result.clone()),
            EntryState::Pending(_) | EntryState::Running => None,
        }
    }

    /// Returns the value, computing it on this thread if nobody has started.
    ///
    /// # Errors
    ///
    /// Returns the factory's error, or a converted
    /// [`PoolError::TaskPanicked`] if it panicked. Every caller sees the same
    /// error.
    pub fn get(&self) -> Result<V, E> {
        let mut state = self.state.lock();
        let factory = loop {
            match std::mem::replace(&mut *state, EntryState::Running) {
                EntryState::Pending(factory) => break factory,
                EntryState::Running => self.ready.wait(&mut state),
                EntryState::Done(result) => {
                    *state = EntryState::Done(result.clone());
                    return result;
                }
            }
        };
        drop(state);

        let result = run_guarded(factory).unwrap_or_else(|panic| Err(E::from(panic)));

        *self.state.lock() = EntryState::Done(result.clone());
        self.ready.notify_all();
        result
    }
}

impl<V, E> CacheEntry<V, E>
where
    V: Clone + Send + 'static,
    E: Clone + From<PoolError> + Send + 'static,
{
    /// Chains `f` onto the value, running on `pool`.
    ///
    /// If the entry is still pending the pool thread computes it.
    pub fn then<U, F>(self: &Arc<Self>, pool: &ThreadPool, f: F) -> Task<Result<U, E>>
    where
        U: Send + 'static,
        F: FnOnce(V) -> U + Send + 'static,
    {
        let entry = Arc::clone(self);
        pool.submit(move || entry.get().map(f))
    }
}

impl<V, E> fmt::Debug for CacheEntry<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match &*self.state.lock() {
            EntryState::Pending(_) => "pending",
            EntryState::Running => "running",
            EntryState::Done(Ok(_)) => "done",
            EntryState::Done(Err(_)) => "failed",
        };
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("phase", &phase)
            .field("timestamp", &self.timestamp.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn entry<V, F>(factory: F) -> Arc<CacheEntry<V>>
    where
        V: Clone,
        F: FnOnce() -> Result<V, PoolError> + Send + 'static,
    {
        Arc::new(CacheEntry::new(1, 0, Box::new(factory)))
    }

    #[test]
    fn test_factory_runs_once_under_contention() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let entry = entry(move || {
            c.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            Ok(99_u32)
        });

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let entry = Arc::clone(&entry);
                thread::spawn(move || entry.get())
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), Ok(99));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(entry.is_done());
    }

    #[test]
    fn test_error_is_shared() {
        let entry: Arc<CacheEntry<u32>> = entry(|| Err(PoolError::Abandoned));
        assert_eq!(entry.get(), Err(PoolError::Abandoned));
        assert_eq!(entry.get(), Err(PoolError::Abandoned));
        assert!(entry.is_failed());
    }

    #[test]
    fn test_panic_resolves_entry() {
        let entry: Arc<CacheEntry<u32>> = entry(|| panic!("erosion diverged"));
        assert_eq!(
            entry.get(),
            Err(PoolError::TaskPanicked("erosion diverged".to_string()))
        );
        assert!(entry.is_failed());
    }

    #[test]
    fn test_peek_does_not_start() {
        let entry = entry(|| Ok(5_u8));
        assert_eq!(entry.peek(), None);
        assert!(!entry.is_done());
        assert_eq!(entry.get(), Ok(5));
        assert_eq!(entry.peek(), Some(Ok(5)));
    }

    #[test]
    fn test_touch_never_moves_backwards() {
        let entry = entry(|| Ok(()));
        entry.touch(50);
        entry.touch(10);
        assert_eq!(entry.timestamp(), 50);
    }

    #[test]
    fn test_then_chains_on_pool() {
        let pool = ThreadPool::new(3).unwrap();
        let entry = entry(|| Ok(20_u32));
        let doubled = entry.then(&pool, |v| v * 2).join().unwrap();
        assert_eq!(doubled, Ok(40));
    }
}
