use std::{
    borrow::Cow,
    collections::HashMap,
    convert::Infallible,
    hash::Hash,
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    thread::{self, ThreadId},
};

use crate::Error;

/// Map of computed values shared by everything that memoizes through it.
///
/// Each instance is guarded by its own mutex, and a condition variable lets
/// callers wait for a value some other thread is computing. The function
/// producing a value always runs with the lock released.
#[derive(Debug)]
pub struct Cache<K, V> {
    inner: Mutex<CacheImpl<K, V>>,

    /// Signaled every time a pending slot is resolved, either way.
    ready: Condvar,

    options: CacheOptions,
}

/// Construction options for a `Cache`.
///
/// Default value has sensible choices for an unbounded cache that is only
/// ever filled on demand.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Number of entries the map is preallocated for.
    initial_capacity: usize,

    /// Name attached to every log event emitted by the cache.
    label: Cow<'static, str>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            initial_capacity: 0,
            label: Cow::Borrowed("memoize"),
        }
    }
}

impl CacheOptions {
    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    pub fn label(mut self, label: impl Into<Cow<'static, str>>) -> Self {
        self.label = label.into();
        self
    }

    pub fn get_initial_capacity(&self) -> usize {
        self.initial_capacity
    }

    pub fn get_label(&self) -> &str {
        &self.label
    }
}

/// Snapshot of the counters of a `Cache`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Values currently stored.
    pub len: usize,

    /// Computations currently running.
    pub pending: usize,

    /// Calls answered with a stored value, including callers that waited for
    /// another thread to finish computing it.
    pub hits: u64,

    /// Calls that had to run the function.
    pub misses: u64,

    /// Computations that returned an error or panicked.
    pub failures: u64,
}

impl CacheStats {
    /// Fraction of calls answered without running the function.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug)]
enum Slot<V> {
    /// Being computed by the given thread.
    Pending(ThreadId),
    Ready(V),
}

#[derive(Debug)]
struct CacheImpl<K, V> {
    map: HashMap<K, Slot<V>>,
    hits: u64,
    misses: u64,
    failures: u64,
}

impl<K, V> Default for Cache<K, V> {
    fn default() -> Self {
        Self::with_options(CacheOptions::default())
    }
}

impl<K, V> Cache<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: CacheOptions) -> Self {
        Cache {
            inner: Mutex::new(CacheImpl {
                map: HashMap::with_capacity(options.initial_capacity),
                hits: 0,
                misses: 0,
                failures: 0,
            }),
            ready: Condvar::new(),
            options,
        }
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// No user function ever runs while the lock is held, so the map is
    /// consistent even if some other thread panicked holding it.
    fn lock(&self) -> MutexGuard<'_, CacheImpl<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of values stored. Computations in flight are not counted.
    pub fn len(&self) -> usize {
        self.lock()
            .map
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let pending = inner
            .map
            .values()
            .filter(|slot| matches!(slot, Slot::Pending(_)))
            .count();
        CacheStats {
            len: inner.map.len() - pending,
            pending,
            hits: inner.hits,
            misses: inner.misses,
            failures: inner.failures,
        }
    }

    /// Drops every stored value, so the next request for any key computes it
    /// again. Computations in flight are left alone and will store their
    /// result when they finish.
    pub fn clear(&self) {
        let mut inner = self.lock();
        let before = inner.map.len();
        inner.map.retain(|_, slot| matches!(slot, Slot::Pending(_)));
        tracing::debug!(
            cache = %self.options.label,
            removed = before - inner.map.len(),
            "cache cleared"
        );
    }
}

impl<K: Eq + Hash, V: Clone> Cache<K, V> {
    /// Returns the stored value for `key` without computing anything.
    pub fn get(&self, key: &K) -> Option<V> {
        match self.lock().map.get(key) {
            Some(Slot::Ready(value)) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn contains_key(&self, key: &K) -> bool {
        matches!(self.lock().map.get(key), Some(Slot::Ready(_)))
    }

    /// Removes the stored value for `key`, if any. A computation in flight
    /// for `key` is not affected.
    pub fn invalidate(&self, key: &K) -> Option<V> {
        let mut inner = self.lock();
        if !matches!(inner.map.get(key), Some(Slot::Ready(_))) {
            return None;
        }
        match inner.map.remove(key) {
            Some(Slot::Ready(value)) => {
                tracing::debug!(cache = %self.options.label, "value invalidated");
                Some(value)
            }
            _ => None,
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Cache<K, V> {
    /// Returns the value stored for `key`, calling `constructor` to produce it
    /// if there is none.
    ///
    /// Only one constructor runs per key at a time: concurrent callers for the
    /// same key block until it finishes and then share its result. If it
    /// fails (or panics), nothing is stored and one of the waiting callers
    /// runs its own constructor instead.
    ///
    /// The lock is not held while `constructor` runs, so it may use this same
    /// cache for other keys. Asking for `key` itself from inside its own
    /// constructor returns `Error::Reentrant`.
    pub fn get_or_try_insert_with<E>(
        &self,
        key: K,
        constructor: impl FnOnce(&K) -> Result<V, E>,
    ) -> Result<V, Error<E>> {
        let this_thread = thread::current().id();

        let mut inner = self.lock();
        loop {
            match inner.map.get(&key) {
                Some(Slot::Ready(value)) => {
                    let value = value.clone();
                    inner.hits += 1;
                    tracing::trace!(cache = %self.options.label, "hit");
                    return Ok(value);
                }
                Some(Slot::Pending(owner)) if *owner == this_thread => {
                    tracing::warn!(
                        cache = %self.options.label,
                        "re-entrant request for a value this thread is computing"
                    );
                    return Err(Error::Reentrant);
                }
                Some(Slot::Pending(_)) => {
                    tracing::trace!(cache = %self.options.label, "waiting on pending value");
                    inner = self
                        .ready
                        .wait(inner)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                None => break,
            }
        }

        inner.map.insert(key.clone(), Slot::Pending(this_thread));
        inner.misses += 1;
        drop(inner);

        tracing::debug!(cache = %self.options.label, "computing value");
        let mut pending = PendingSlot {
            cache: self,
            key,
            value: None,
        };
        // If `constructor` panics, `pending` is dropped during unwinding and
        // releases the slot.
        match constructor(&pending.key) {
            Ok(value) => {
                pending.value = Some(value.clone());
                Ok(value)
            }
            Err(err) => Err(Error::Function(err)),
        }
    }

    /// Infallible version of `get_or_try_insert_with()`.
    ///
    /// # Panics
    ///
    /// If called for `key` from inside the constructor of that same `key`.
    pub fn get_or_insert_with(&self, key: K, constructor: impl FnOnce(&K) -> V) -> V {
        match self.get_or_try_insert_with(key, |k| Ok::<_, Infallible>(constructor(k))) {
            Ok(value) => value,
            Err(Error::Reentrant) => panic!(
                "memoized value requested again while it was being computed by the same thread"
            ),
            Err(Error::Function(never)) => match never {},
        }
    }
}

/// Resolves a `Slot::Pending` when dropped: stores the value if one was
/// produced, otherwise frees the slot for a retry. Either way, every waiter
/// is woken up.
struct PendingSlot<'a, K: Eq + Hash, V> {
    cache: &'a Cache<K, V>,
    key: K,
    value: Option<V>,
}

impl<'a, K: Eq + Hash, V> Drop for PendingSlot<'a, K, V> {
    fn drop(&mut self) {
        let label = &self.cache.options.label;
        let mut inner = self.cache.lock();
        match self.value.take() {
            Some(value) => {
                if let Some(slot) = inner.map.get_mut(&self.key) {
                    *slot = Slot::Ready(value);
                }
                tracing::debug!(cache = %label, "value computed");
            }
            None => {
                inner.map.remove(&self.key);
                inner.failures += 1;
                tracing::warn!(cache = %label, "computation failed, value not cached");
            }
        }
        drop(inner);
        self.cache.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        panic::{self, AssertUnwindSafe},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Barrier,
        },
        thread,
        time::Duration,
    };

    use super::*;

    #[test]
    fn computes_once_per_key() {
        let cache = Cache::new();
        let calls = AtomicUsize::new(0);
        let square = |x: &u64| {
            calls.fetch_add(1, Ordering::SeqCst);
            x * x
        };

        assert_eq!(cache.get_or_insert_with(4, square), 16);
        assert_eq!(cache.get_or_insert_with(4, square), 16);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(cache.get_or_insert_with(5, square), 25);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&4), Some(16));
        assert_eq!(cache.get(&6), None);
    }

    #[test]
    fn failure_is_not_cached() {
        let cache: Cache<u32, String> = Cache::new();

        let res = cache.get_or_try_insert_with(1, |_| Err("boom"));
        assert!(matches!(res, Err(Error::Function("boom"))));
        assert!(!cache.contains_key(&1));
        assert_eq!(cache.stats().failures, 1);

        let res = cache.get_or_try_insert_with(1, |k| Ok::<_, &str>(k.to_string()));
        assert_eq!(res.unwrap(), "1");

        let stats = cache.stats();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.len, 1);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn reentrant_request_is_an_error() {
        let cache: Cache<u32, u32> = Cache::new();

        let res = cache.get_or_try_insert_with(7, |k| {
            match cache.get_or_try_insert_with(*k, |k| Ok::<_, ()>(*k)) {
                Err(Error::Reentrant) => Err("reentrant"),
                _ => Ok(0),
            }
        });
        assert!(matches!(res, Err(Error::Function("reentrant"))));

        // The slot was released, so it can be computed now.
        assert_eq!(cache.get_or_insert_with(7, |k| k + 1), 8);
    }

    #[test]
    #[should_panic(expected = "same thread")]
    fn reentrant_infallible_request_panics() {
        let cache: Cache<u32, u32> = Cache::new();
        cache.get_or_insert_with(1, |k| cache.get_or_insert_with(*k, |k| *k));
    }

    #[test]
    fn other_keys_can_be_computed_from_a_constructor() {
        let cache: Cache<u32, u32> = Cache::new();
        let value =
            cache.get_or_insert_with(2, |k| cache.get_or_insert_with(k + 1, |k| k * 10) + 1);
        assert_eq!(value, 31);
        assert_eq!(cache.get(&3), Some(30));
    }

    #[test]
    fn panicking_constructor_releases_slot() {
        let cache: Cache<u32, u32> = Cache::new();

        let res = panic::catch_unwind(AssertUnwindSafe(|| {
            cache.get_or_insert_with(3, |_| panic!("constructor panicked"))
        }));
        assert!(res.is_err());

        let stats = cache.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.failures, 1);
        assert_eq!(cache.get_or_insert_with(3, |k| *k), 3);
    }

    #[test]
    fn waiters_share_one_computation() {
        const THREADS: usize = 100;

        let cache: Cache<u64, u64> = Cache::new();
        let calls = AtomicUsize::new(0);
        let barrier = Barrier::new(THREADS);

        let results: Vec<u64> = thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        cache.get_or_insert_with(5, |x| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(20));
                            x * x
                        })
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|&r| r == 25));

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, THREADS as u64 - 1);
    }

    #[test]
    fn waiters_retry_after_failure() {
        const THREADS: usize = 8;

        let cache: Cache<u32, u32> = Cache::new();
        let calls = AtomicUsize::new(0);
        let barrier = Barrier::new(THREADS);

        // Only the first computation fails; whoever runs next must succeed
        // and every later caller gets the stored value.
        let results: Vec<Result<u32, Error<&str>>> = thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        cache.get_or_try_insert_with(9, |k| {
                            let call = calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(10));
                            if call == 0 {
                                Err("first attempt fails")
                            } else {
                                Ok(k * 2)
                            }
                        })
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
        assert!(results.iter().flatten().all(|&v| v == 18));
        assert_eq!(cache.get(&9), Some(18));
    }

    #[test]
    fn invalidate_and_clear_force_recomputation() {
        let cache = Cache::with_options(CacheOptions::default().label("squares"));
        assert_eq!(cache.options().get_label(), "squares");

        let calls = AtomicUsize::new(0);
        let square = |x: &i32| {
            calls.fetch_add(1, Ordering::SeqCst);
            x * x
        };

        cache.get_or_insert_with(2, square);
        cache.get_or_insert_with(3, square);
        assert_eq!(cache.invalidate(&2), Some(4));
        assert_eq!(cache.invalidate(&2), None);
        assert_eq!(cache.len(), 1);

        cache.get_or_insert_with(2, square);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        cache.clear();
        assert!(cache.is_empty());
        cache.get_or_insert_with(3, square);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn hit_rate() {
        assert_eq!(CacheStats::default().hit_rate(), 0.0);

        let cache: Cache<u8, u8> =
            Cache::with_options(CacheOptions::default().initial_capacity(16));
        for _ in 0..4 {
            cache.get_or_insert_with(1, |k| *k);
        }
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (3, 1));
        assert_eq!(stats.hit_rate(), 0.75);
    }
}
