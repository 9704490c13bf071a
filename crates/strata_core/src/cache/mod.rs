//! # Expiring Cache
//!
//! Memoization map from a 64-bit spatial key to a lazily computed value.
//!
//! ## Guarantees
//!
//! - At most one entry, and so at most one computation, per key at a time
//! - The map lock is held for lookups and inserts only, never while a
//!   value is being computed
//! - Entries idle for longer than `expire` are evicted by a sweep that runs
//!   at most once per `interval`, piggybacked on normal access
//! - A failed computation is never cached: its entry is evicted and the
//!   next caller starts over
//! - A value the dead check rejects is treated like a failed one: lookups
//!   replace it and sweeps evict it
//!
//! ## Example
//!
//! ```rust,ignore
//! let pool = Arc::new(ThreadPool::new(4)?);
//! let cache: Cache<Arc<Tile>> = Cache::new(pool, Duration::from_secs(30), Duration::from_secs(5));
//!
//! let tile = cache.get_or_compute(region_id, move || build_tile(x, z))?;
//! ```

mod entry;

pub use entry::CacheEntry;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use std::time::Instant;
#[cfg(target_arch = "wasm32")]
use web_time::Instant;

use parking_lot::Mutex;

use crate::error::PoolError;
use crate::sync::ThreadPool;

/// Callback invoked with the value of every evicted entry.
pub type EvictHook<V> = Arc<dyn Fn(&V) + Send + Sync>;

/// Predicate marking a computed value as dead.
pub type DeadCheck<V> = Arc<dyn Fn(&V) -> bool + Send + Sync>;

/// Cache traffic counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found a live entry.
    pub hits: u64,
    /// Lookups that created a new entry.
    pub misses: u64,
    /// Entries removed explicitly or by a sweep.
    pub evictions: u64,
    /// Completed sweep passes.
    pub sweeps: u64,
    /// Entries currently mapped.
    pub entries: usize,
}

/// Monotonic millisecond clock anchored at cache creation.
#[derive(Clone, Copy, Debug)]
struct Clock {
    epoch: Instant,
}

impl Clock {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    #[inline]
    fn now_ms(self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// State shared between the cache handle and its background jobs.
struct CacheInner<V, E> {
    entries: Mutex<HashMap<u64, Arc<CacheEntry<V, E>>>>,
    expire_ms: u64,
    interval_ms: u64,
    clock: Clock,
    /// Clock reading of the last scheduled sweep.
    last_sweep: AtomicU64,
    on_evict: Option<EvictHook<V>>,
    is_dead: Option<DeadCheck<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    sweeps: AtomicU64,
}

impl<V, E> CacheInner<V, E>
where
    V: Clone,
    E: Clone + From<PoolError>,
{
    /// Runs the evict hook on a removed entry's value, if it has one.
    fn evicted(&self, entry: &CacheEntry<V, E>) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        if let (Some(hook), Some(Ok(value))) = (&self.on_evict, entry.peek()) {
            hook(&value);
        }
    }

    /// Whether the entry holds a value the dead check rejects.
    fn is_dead(&self, entry: &CacheEntry<V, E>) -> bool {
        match (&self.is_dead, entry.peek()) {
            (Some(check), Some(Ok(value))) => check(&value),
            _ => false,
        }
    }

    fn remove(&self, key: u64) -> Option<Arc<CacheEntry<V, E>>> {
        let removed = self.entries.lock().remove(&key);
        if let Some(entry) = &removed {
            self.evicted(entry);
        }
        removed
    }

    fn remove_entry(&self, entry: &Arc<CacheEntry<V, E>>) -> bool {
        let mut entries = self.entries.lock();
        let mapped = entries
            .get(&entry.key())
            .is_some_and(|current| Arc::ptr_eq(current, entry));
        if mapped {
            entries.remove(&entry.key());
        }
        drop(entries);

        if mapped {
            self.evicted(entry);
        }
        mapped
    }

    fn remove_if(&self, key: u64, predicate: impl FnOnce(&V) -> bool) -> bool {
        let mut entries = self.entries.lock();
        let matched = entries
            .get(&key)
            .and_then(|entry| entry.peek())
            .is_some_and(|value| value.is_ok_and(|value| predicate(&value)));
        let removed = if matched { entries.remove(&key) } else { None };
        drop(entries);

        if let Some(entry) = &removed {
            self.evicted(entry);
        }
        removed.is_some()
    }

    /// Evicts every expired, failed or dead entry. Returns how many were
    /// removed.
    fn sweep(&self) -> usize {
        // Entries touched after this reading survive the pass
        let now = self.clock.now_ms();

        let mut entries = self.entries.lock();
        let doomed: Vec<u64> = entries
            .iter()
            .filter(|(_, entry)| {
                !entry.is_running()
                    && (entry.is_failed()
                        || self.is_dead(entry)
                        || now.saturating_sub(entry.timestamp()) > self.expire_ms)
            })
            .map(|(key, _)| *key)
            .collect();
        let removed: Vec<_> = doomed.iter().filter_map(|key| entries.remove(key)).collect();
        let remaining = entries.len();
        drop(entries);

        for entry in &removed {
            self.evicted(entry);
        }
        self.sweeps.fetch_add(1, Ordering::Relaxed);

        if !removed.is_empty() {
            tracing::debug!(evicted = removed.len(), remaining, "cache sweep");
        }
        removed.len()
    }
}

/// Expiring memoization map keyed by `u64`.
///
/// `E` is the error a computation may fail with. It must absorb
/// [`PoolError`] so that a panicking factory can be reported.
pub struct Cache<V, E = PoolError> {
    inner: Arc<CacheInner<V, E>>,
    pool: Arc<ThreadPool>,
}

impl<V, E> Cache<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + From<PoolError> + Send + Sync + fmt::Display + 'static,
{
    /// Creates a cache that evicts entries idle for longer than `expire`,
    /// sweeping at most once per `interval`.
    #[must_use]
    pub fn new(pool: Arc<ThreadPool>, expire: Duration, interval: Duration) -> Self {
        Self::build(pool, expire, interval, None, None)
    }

    /// Like [`new`](Self::new), calling `hook` with every evicted value.
    #[must_use]
    pub fn with_evict_hook(
        pool: Arc<ThreadPool>,
        expire: Duration,
        interval: Duration,
        hook: impl Fn(&V) + Send + Sync + 'static,
    ) -> Self {
        Self::build(pool, expire, interval, Some(Arc::new(hook)), None)
    }

    /// Like [`with_evict_hook`](Self::with_evict_hook), also evicting every
    /// value `is_dead` accepts as soon as a lookup or sweep sees it.
    #[must_use]
    pub fn with_hooks(
        pool: Arc<ThreadPool>,
        expire: Duration,
        interval: Duration,
        on_evict: impl Fn(&V) + Send + Sync + 'static,
        is_dead: impl Fn(&V) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::build(
            pool,
            expire,
            interval,
            Some(Arc::new(on_evict)),
            Some(Arc::new(is_dead)),
        )
    }

    fn build(
        pool: Arc<ThreadPool>,
        expire: Duration,
        interval: Duration,
        on_evict: Option<EvictHook<V>>,
        is_dead: Option<DeadCheck<V>>,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(HashMap::new()),
                expire_ms: duration_ms(expire),
                interval_ms: duration_ms(interval),
                clock: Clock::new(),
                last_sweep: AtomicU64::new(0),
                on_evict,
                is_dead,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
                sweeps: AtomicU64::new(0),
            }),
            pool,
        }
    }

    /// The pool background work is submitted to.
    #[must_use]
    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    /// Returns the entry for `key`, creating it from `factory` if absent.
    ///
    /// The factory does not run here: it runs on the first
    /// [`CacheEntry::get`]. A failed or dead entry is replaced.
    pub fn compute_if_absent<F>(&self, key: u64, factory: F) -> Arc<CacheEntry<V, E>>
    where
        F: FnOnce() -> Result<V, E> + Send + 'static,
    {
        let now = self.inner.clock.now_ms();

        let mut entries = self.inner.entries.lock();
        let live = entries
            .get(&key)
            .filter(|entry| !entry.is_failed() && !self.inner.is_dead(entry))
            .cloned();
        let (entry, replaced) = if let Some(entry) = live {
            entry.touch(now);
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            (entry, None)
        } else {
            let entry = Arc::new(CacheEntry::new(key, now, Box::new(factory)));
            let replaced = entries.insert(key, Arc::clone(&entry));
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
            (entry, replaced)
        };
        drop(entries);

        if let Some(old) = replaced {
            self.inner.evicted(&old);
        }
        self.maybe_sweep(now);
        entry
    }

    /// Returns the value for `key`, computing it on this thread if needed.
    ///
    /// # Errors
    ///
    /// Returns the computation's error. The failed entry is evicted.
    pub fn get_or_compute<F>(&self, key: u64, factory: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E> + Send + 'static,
    {
        let entry = self.compute_if_absent(key, factory);
        let result = entry.get();
        if let Err(error) = &result {
            if self.inner.remove_entry(&entry) {
                tracing::warn!(key, %error, "evicted failed cache entry");
            }
        }
        result
    }

    /// Creates the entry for `key` if absent and computes it in the
    /// background.
    ///
    /// Never blocks on the computation. If the pool refuses the job the
    /// entry stays pending and the first `get` computes it.
    pub fn queue<F>(&self, key: u64, factory: F) -> Arc<CacheEntry<V, E>>
    where
        F: FnOnce() -> Result<V, E> + Send + 'static,
    {
        let entry = self.compute_if_absent(key, factory);
        if entry.is_done() || entry.is_running() {
            return entry;
        }

        let job_entry = Arc::clone(&entry);
        let inner = Arc::clone(&self.inner);
        let queued = self.pool.execute(move || {
            if let Err(error) = job_entry.get() {
                if inner.remove_entry(&job_entry) {
                    tracing::warn!(key = job_entry.key(), %error, "evicted failed background entry");
                }
            }
        });
        if let Err(error) = queued {
            tracing::debug!(key, %error, "background computation not queued");
        }
        entry
    }

    /// Returns the value for `key` only if it is already computed.
    ///
    /// A dead value is evicted instead of returned.
    #[must_use]
    pub fn get_if_present(&self, key: u64) -> Option<V> {
        let entry = self.inner.entries.lock().get(&key).cloned()?;
        let value = entry.peek()?.ok()?;
        if self.inner.is_dead(&entry) {
            self.inner.remove_entry(&entry);
            return None;
        }
        entry.touch(self.inner.clock.now_ms());
        self.inner.hits.fetch_add(1, Ordering::Relaxed);
        Some(value)
    }

    /// Removes `key`. Does nothing if it is absent.
    ///
    /// The evict hook runs if the entry had a value.
    pub fn remove(&self, key: u64) -> Option<Arc<CacheEntry<V, E>>> {
        self.inner.remove(key)
    }

    /// Removes `entry` only if it is still the one mapped under its key.
    pub fn remove_entry(&self, entry: &Arc<CacheEntry<V, E>>) -> bool {
        self.inner.remove_entry(entry)
    }

    /// Removes `key` only if its computed value satisfies `predicate`.
    ///
    /// The check and the removal happen under one lock, so an entry that
    /// replaced the one the caller had in mind is never touched unless it
    /// matches too.
    pub fn remove_if(&self, key: u64, predicate: impl FnOnce(&V) -> bool) -> bool {
        self.inner.remove_if(key, predicate)
    }

    /// Evicts expired, failed and dead entries now. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.inner.last_sweep.store(self.inner.clock.now_ms(), Ordering::Relaxed);
        self.inner.sweep()
    }

    /// Schedules a background sweep if `interval` has passed since the last.
    fn maybe_sweep(&self, now: u64) {
        let last = self.inner.last_sweep.load(Ordering::Relaxed);
        if now.saturating_sub(last) < self.inner.interval_ms {
            return;
        }
        if self
            .inner
            .last_sweep
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            // Another caller won the slot
            return;
        }

        let inner = Arc::clone(&self.inner);
        if let Err(error) = self.pool.execute(move || {
            inner.sweep();
        }) {
            tracing::debug!(%error, "sweep not scheduled");
        }
    }

    /// Whether `key` is mapped, in any phase.
    #[must_use]
    pub fn contains_key(&self, key: u64) -> bool {
        self.inner.entries.lock().contains_key(&key)
    }

    /// Number of mapped entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Whether no entry is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Traffic counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            sweeps: self.inner.sweeps.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

impl<V, E> Clone for Cache<V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            pool: Arc::clone(&self.pool),
        }
    }
}

impl<V, E> fmt::Debug for Cache<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("entries", &self.inner.entries.lock().len())
            .field("expire_ms", &self.inner.expire_ms)
            .field("interval_ms", &self.inner.interval_ms)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn cache(expire_ms: u64) -> Cache<u64> {
        Cache::new(
            Arc::new(ThreadPool::synchronous()),
            Duration::from_millis(expire_ms),
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn test_at_most_one_computation_per_key() {
        let cache: Cache<u64> = Cache::new(
            Arc::new(ThreadPool::new(4).unwrap()),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                let calls = Arc::clone(&calls);
                thread::spawn(move || {
                    cache.get_or_compute(7, move || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(10));
                        Ok(49)
                    })
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap(), Ok(49));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_failed_entry_is_evicted_and_retried() {
        let cache = cache(60_000);

        let first = cache.get_or_compute(1, || Err(PoolError::Abandoned));
        assert_eq!(first, Err(PoolError::Abandoned));
        assert!(!cache.contains_key(1));

        assert_eq!(cache.get_or_compute(1, || Ok(10)), Ok(10));
        assert_eq!(cache.get_if_present(1), Some(10));
    }

    #[test]
    fn test_remove_is_idempotent_and_runs_hook() {
        let evicted = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&evicted);
        let cache: Cache<u64> = Cache::with_evict_hook(
            Arc::new(ThreadPool::synchronous()),
            Duration::from_secs(60),
            Duration::from_secs(60),
            move |value| {
                e.fetch_add(usize::try_from(*value).unwrap(), Ordering::SeqCst);
            },
        );

        assert_eq!(cache.get_or_compute(3, || Ok(5)), Ok(5));
        assert!(cache.remove(3).is_some());
        assert!(cache.remove(3).is_none());
        assert_eq!(evicted.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_remove_entry_ignores_replaced_entry() {
        let cache = cache(60_000);
        let old = cache.compute_if_absent(2, || Ok(1));
        assert!(cache.remove(2).is_some());
        let _new = cache.compute_if_absent(2, || Ok(2));

        assert!(!cache.remove_entry(&old));
        assert!(cache.contains_key(2));
    }

    #[test]
    fn test_remove_if_checks_current_value() {
        let cache = cache(60_000);
        assert_eq!(cache.get_or_compute(6, || Ok(1)), Ok(1));
        assert!(!cache.remove_if(6, |value| *value == 0));
        assert!(cache.contains_key(6));
        assert!(cache.remove_if(6, |value| *value == 1));
        assert!(!cache.remove_if(6, |_| true));

        // Pending entries are never matched
        let _entry = cache.compute_if_absent(7, || Ok(7));
        assert!(!cache.remove_if(7, |_| true));
        assert!(cache.contains_key(7));
    }

    #[test]
    fn test_dead_values_are_evicted_on_sight() {
        let dead = Arc::new(AtomicU64::new(u64::MAX));
        let evicted = Arc::new(AtomicUsize::new(0));
        let (d, e) = (Arc::clone(&dead), Arc::clone(&evicted));
        let cache: Cache<u64> = Cache::with_hooks(
            Arc::new(ThreadPool::synchronous()),
            Duration::from_secs(60),
            Duration::from_secs(3600),
            move |_| {
                e.fetch_add(1, Ordering::SeqCst);
            },
            move |value| *value == d.load(Ordering::SeqCst),
        );
        for key in 1..=3 {
            assert_eq!(cache.get_or_compute(key, move || Ok(key)), Ok(key));
        }

        dead.store(1, Ordering::SeqCst);
        assert_eq!(cache.get_if_present(1), None);
        assert!(!cache.contains_key(1));

        dead.store(2, Ordering::SeqCst);
        assert_eq!(cache.get_or_compute(2, || Ok(20)), Ok(20));
        assert_eq!(cache.stats().misses, 4);

        dead.store(3, Ordering::SeqCst);
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
        assert!(!cache.contains_key(3));
        assert_eq!(evicted.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_get_if_present_needs_resolved_value() {
        let cache = cache(60_000);
        let entry = cache.compute_if_absent(4, || Ok(16));
        assert_eq!(cache.get_if_present(4), None);
        assert_eq!(entry.get(), Ok(16));
        assert_eq!(cache.get_if_present(4), Some(16));
        assert_eq!(cache.get_if_present(5), None);
    }

    #[test]
    fn test_ttl_sweep() {
        let cache = cache(40);
        assert_eq!(cache.get_or_compute(1, || Ok(1)), Ok(1));
        assert_eq!(cache.get_or_compute(2, || Ok(2)), Ok(2));

        thread::sleep(Duration::from_millis(120));
        // Accessing 2 refreshes it
        assert_eq!(cache.get_if_present(2), Some(2));

        assert_eq!(cache.sweep(), 1);
        assert!(!cache.contains_key(1));
        assert!(cache.contains_key(2));
        assert_eq!(cache.stats().sweeps, 1);
    }

    #[test]
    fn test_sweep_is_piggybacked_on_access() {
        let cache: Cache<u64> = Cache::new(
            Arc::new(ThreadPool::synchronous()),
            Duration::from_millis(20),
            Duration::from_millis(20),
        );
        assert_eq!(cache.get_or_compute(1, || Ok(1)), Ok(1));
        thread::sleep(Duration::from_millis(80));

        // Synchronous pool: the scheduled sweep runs inline
        let _ = cache.compute_if_absent(2, || Ok(2));
        assert!(!cache.contains_key(1));
        assert!(cache.contains_key(2));
    }

    #[test]
    fn test_queue_computes_in_background() {
        let cache: Cache<u64> = Cache::new(
            Arc::new(ThreadPool::new(3).unwrap()),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        let entry = cache.queue(9, || Ok(81));
        assert_eq!(entry.get(), Ok(81));
        assert_eq!(cache.get_if_present(9), Some(81));
    }
}
