//! Memoization of pure functions behind an explicit, shareable cache.
//!
//! ```
//! let square = libmemoize::memoize(|x: &u64| x * x);
//! assert_eq!(square(4), 16);
//! assert_eq!(square(4), 16); // answered from the cache
//! ```

pub mod cache;

use cache::{Cache, CacheOptions};
use std::{fmt, hash::Hash, sync::Arc};

#[derive(thiserror::Error, Debug)]
pub enum Error<E> {
    #[error("the memoized function failed")]
    Function(#[source] E),
    #[error("value requested again while being computed by the same thread")]
    Reentrant,
}

impl<E> Error<E> {
    /// The error returned by the memoized function, if that is what this is.
    pub fn into_function_error(self) -> Option<E> {
        match self {
            Error::Function(err) => Some(err),
            Error::Reentrant => None,
        }
    }
}

/// A function wrapped with a cache, so that it runs at most once per distinct
/// argument.
///
/// `F` is either `Fn(&K) -> V` (use `get()`) or `Fn(&K) -> Result<V, E>` (use
/// `try_get()`). Results are only stored on success: a failed call is tried
/// again next time the same argument is requested.
pub struct Memoized<K, V, F> {
    /// Where results are stored. Can be shared with other `Memoized` or kept
    /// by whoever created it, to inspect or clear it.
    cache: Arc<Cache<K, V>>,

    function: F,
}

impl<K, V, F> Memoized<K, V, F> {
    /// Memoizes `function` into a new private cache.
    pub fn new(function: F) -> Self {
        Self::with_options(function, CacheOptions::default())
    }

    pub fn with_options(function: F, options: CacheOptions) -> Self {
        Self::with_cache(Arc::new(Cache::with_options(options)), function)
    }

    /// Memoizes `function` into a cache provided by the caller.
    ///
    /// The cache must only ever be filled with results of `function` (or of a
    /// function equivalent to it), otherwise `get()` may return values that
    /// `function` would not.
    pub fn with_cache(cache: Arc<Cache<K, V>>, function: F) -> Self {
        Memoized { cache, function }
    }

    pub fn cache(&self) -> &Arc<Cache<K, V>> {
        &self.cache
    }
}

impl<K, V, F> Memoized<K, V, F>
where
    K: Eq + Hash + Clone,
    V: Clone,
    F: Fn(&K) -> V,
{
    /// Returns `function(&key)`, computing it only if it is not cached yet.
    ///
    /// # Panics
    ///
    /// If `function` asks for this same `key` while computing it, or if
    /// `function` itself panics.
    pub fn get(&self, key: K) -> V {
        self.cache.get_or_insert_with(key, &self.function)
    }

    /// Turns this into a plain closure with the same behavior as `get()`.
    pub fn into_fn(self) -> impl Fn(K) -> V {
        move |key| self.get(key)
    }
}

impl<K, V, E, F> Memoized<K, V, F>
where
    K: Eq + Hash + Clone,
    V: Clone,
    F: Fn(&K) -> Result<V, E>,
{
    /// Returns `function(&key)`, computing it only if it is not cached yet.
    ///
    /// Errors from `function` are returned as `Error::Function` and are not
    /// cached.
    pub fn try_get(&self, key: K) -> Result<V, Error<E>> {
        self.cache.get_or_try_insert_with(key, &self.function)
    }

    /// Turns this into a plain closure with the same behavior as `try_get()`.
    pub fn into_try_fn(self) -> impl Fn(K) -> Result<V, Error<E>> {
        move |key| self.try_get(key)
    }
}

impl<K, V, F> fmt::Debug for Memoized<K, V, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memoized")
            .field("label", &self.cache.options().get_label())
            .finish_non_exhaustive()
    }
}

/// Wraps `function` so that it is evaluated at most once per distinct
/// argument. The returned closure owns its cache, which is dropped with it.
///
/// `function` should be deterministic and free of side effects.
pub fn memoize<K, V, F>(function: F) -> impl Fn(K) -> V
where
    K: Eq + Hash + Clone,
    V: Clone,
    F: Fn(&K) -> V,
{
    Memoized::new(function).into_fn()
}

/// Like `memoize()`, for a function that can fail. Failures propagate to the
/// caller and are not cached.
pub fn try_memoize<K, V, E, F>(function: F) -> impl Fn(K) -> Result<V, Error<E>>
where
    K: Eq + Hash + Clone,
    V: Clone,
    F: Fn(&K) -> Result<V, E>,
{
    Memoized::new(function).into_try_fn()
}

/// A memoized function that may call itself recursively through the cache,
/// like the textbook memoized Fibonacci.
///
/// The function receives a handle to the memoized version of itself as its
/// first argument. Recursing into the same key it is computing panics (see
/// `Cache::get_or_insert_with()`).
pub struct Recursive<K, V, F> {
    cache: Arc<Cache<K, V>>,
    function: F,
}

impl<K, V, F> Recursive<K, V, F>
where
    K: Eq + Hash + Clone,
    V: Clone,
    F: Fn(&dyn Fn(K) -> V, &K) -> V,
{
    pub fn new(function: F) -> Self {
        Self::with_cache(Arc::new(Cache::new()), function)
    }

    pub fn with_cache(cache: Arc<Cache<K, V>>, function: F) -> Self {
        Recursive { cache, function }
    }

    pub fn get(&self, key: K) -> V {
        let recurse: &dyn Fn(K) -> V = &|key: K| self.get(key);
        self.cache.get_or_insert_with(key, |k| (self.function)(recurse, k))
    }

    pub fn cache(&self) -> &Arc<Cache<K, V>> {
        &self.cache
    }
}
