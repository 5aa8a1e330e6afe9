//! Response cache for idempotent reads.
//!
//! Maps a key to a value, its insertion time and its time-to-live. Expiry is
//! lazy: `get` treats a stale entry as absent and removes it opportunistically.
//! A background sweep (see `Sweeper`) only bounds memory.

use crate::application::metrics::Metrics;
use crate::application::ports::{CacheInvalidator, Clock, Storage, Sweep};
use crate::domain::cache_entry::CacheEntry;
use crate::infrastructure::storage::ShardedStorage;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Time-bounded memo of query results.
///
/// Only side-effect-free reads should populate it. Two callers missing the
/// same key at once both compute and the last `set` wins.
///
/// Every invalidation bumps a generation shared by all clones. A
/// `get_or_compute` that overlaps an invalidation returns its value but does
/// not keep it, so a write that invalidated mid-read is never shadowed.
#[derive(Debug, Clone)]
pub struct ResponseCache<V, S = Arc<ShardedStorage<String, CacheEntry<V>>>>
where
    V: Clone + Send + Sync + Debug,
    S: Storage<String, CacheEntry<V>> + Clone,
{
    storage: S,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
    generation: Arc<AtomicU64>,
    _value: std::marker::PhantomData<fn() -> V>,
}

impl<V> ResponseCache<V>
where
    V: Clone + Send + Sync + Debug,
{
    /// Create a cache backed by sharded in-memory storage.
    pub fn in_memory(clock: Arc<dyn Clock>, metrics: Metrics) -> Self {
        Self::new(Arc::new(ShardedStorage::new()), clock, metrics)
    }
}

impl<V, S> ResponseCache<V, S>
where
    V: Clone + Send + Sync + Debug,
    S: Storage<String, CacheEntry<V>> + Clone,
{
    /// Create a new cache over `storage`.
    pub fn new(storage: S, clock: Arc<dyn Clock>, metrics: Metrics) -> Self {
        Self {
            storage,
            clock,
            metrics,
            generation: Arc::new(AtomicU64::new(0)),
            _value: std::marker::PhantomData,
        }
    }

    /// Look up a fresh value.
    ///
    /// Returns `None` on a miss, including when the stored entry has expired.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let key = key.to_string();

        let lookup = self
            .storage
            .with_existing_mut(&key, |entry| entry.is_fresh(now).then(|| entry.value.clone()));

        match lookup {
            Some(Some(value)) => {
                trace!(key = %key, "cache hit");
                self.metrics.record_cache_hit();
                Some(value)
            }
            Some(None) => {
                // Re-check under the removal lock: a concurrent `set` may have refreshed it
                self.storage.remove_if(&key, |entry| !entry.is_fresh(now));
                trace!(key = %key, "cache entry expired");
                self.metrics.record_cache_miss();
                None
            }
            None => {
                trace!(key = %key, "cache miss");
                self.metrics.record_cache_miss();
                None
            }
        }
    }

    /// Store `value` under `key` for `ttl`, replacing any previous entry.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let now = self.clock.now();
        self.storage.insert(key.into(), CacheEntry::new(value, now, ttl));
    }

    /// Return the cached value, or compute, store and return a new one.
    ///
    /// A failed computation stores nothing and its error is returned as is.
    /// A value computed while an invalidation ran is returned but not stored.
    pub fn get_or_compute<F, E>(&self, key: &str, ttl: Duration, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }

        let started = self.generation();
        let value = compute()?;
        if self.generation() != started {
            trace!(key, "invalidated during compute, not caching");
            return Ok(value);
        }

        self.set(key, value.clone(), ttl);
        // An invalidation that ran between the check and the insert may have missed the entry
        if self.generation() != started {
            self.storage.remove(&key.to_string());
        }
        Ok(value)
    }

    /// Invalidation counter, bumped before any entry is dropped.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one key. Returns whether it was present.
    pub fn invalidate(&self, key: &str) -> bool {
        self.bump_generation();
        let removed = self.storage.remove(&key.to_string()).is_some();
        if removed {
            debug!(key, "cache entry invalidated");
            self.metrics.record_invalidations(1);
        }
        removed
    }

    /// Drop every key that starts with `prefix`. Returns how many were dropped.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        self.bump_generation();
        let mut removed = 0;
        self.storage.retain(|key, _| {
            if key.starts_with(prefix) {
                removed += 1;
                false
            } else {
                true
            }
        });

        if removed > 0 {
            debug!(prefix, removed, "cache entries invalidated");
            self.metrics.record_invalidations(removed);
        }
        removed
    }

    /// Physically remove every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        self.storage.retain(|_, entry| {
            let fresh = entry.is_fresh(now);
            if !fresh {
                removed += 1;
            }
            fresh
        });
        removed
    }

    /// Number of stored entries, expired ones included until purged.
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Check if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.bump_generation();
        self.storage.clear();
    }

    /// Get a reference to the metrics.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

impl<V, S> CacheInvalidator for ResponseCache<V, S>
where
    V: Clone + Send + Sync + Debug,
    S: Storage<String, CacheEntry<V>> + Clone,
{
    fn invalidate(&self, key: &str) -> bool {
        ResponseCache::invalidate(self, key)
    }

    fn invalidate_prefix(&self, prefix: &str) -> usize {
        ResponseCache::invalidate_prefix(self, prefix)
    }
}

impl<V, S> Sweep for ResponseCache<V, S>
where
    V: Clone + Send + Sync + Debug,
    S: Storage<String, CacheEntry<V>> + Clone,
{
    fn name(&self) -> &'static str {
        "response_cache"
    }

    fn sweep(&self) -> usize {
        self.purge_expired()
    }
}
