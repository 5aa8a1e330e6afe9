//! Observability metrics for the toolkit.
//!
//! Provides counters about admission, caching, circuit breaking and event
//! storage for monitoring and debugging.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metrics tracking toolkit statistics.
///
/// All metrics use atomic operations for thread-safe updates and reads.
/// One `Metrics` value is cheap to clone and is shared by every component
/// built from the same `ServiceGuard`.
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    /// Requests admitted by the rate limiter
    requests_allowed: AtomicU64,
    /// Requests rejected by the rate limiter
    requests_rejected: AtomicU64,
    /// Cache lookups that returned a fresh value
    cache_hits: AtomicU64,
    /// Cache lookups that found nothing or an expired value
    cache_misses: AtomicU64,
    /// Cache entries dropped by explicit invalidation
    cache_invalidations: AtomicU64,
    /// Calls refused by an open circuit
    calls_short_circuited: AtomicU64,
    /// Transitions into the open state
    circuit_trips: AtomicU64,
    /// Events accepted by the event store
    events_appended: AtomicU64,
    /// Appends refused because of a stale expected version
    concurrency_conflicts: AtomicU64,
}

impl Metrics {
    /// Create a new metrics tracker.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::default()),
        }
    }

    pub(crate) fn record_allowed(&self) {
        self.inner.requests_allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.inner.requests_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_hit(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_miss(&self) {
        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalidations(&self, count: usize) {
        self.inner
            .cache_invalidations
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_short_circuit(&self) {
        self.inner
            .calls_short_circuited
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_trip(&self) {
        self.inner.circuit_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_appended(&self, count: usize) {
        self.inner
            .events_appended
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_conflict(&self) {
        self.inner
            .concurrency_conflicts
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Get the number of requests admitted.
    pub fn requests_allowed(&self) -> u64 {
        self.inner.requests_allowed.load(Ordering::Relaxed)
    }

    /// Get the number of requests rejected.
    pub fn requests_rejected(&self) -> u64 {
        self.inner.requests_rejected.load(Ordering::Relaxed)
    }

    /// Get the number of cache hits.
    pub fn cache_hits(&self) -> u64 {
        self.inner.cache_hits.load(Ordering::Relaxed)
    }

    /// Get the number of cache misses.
    pub fn cache_misses(&self) -> u64 {
        self.inner.cache_misses.load(Ordering::Relaxed)
    }

    /// Get the number of invalidated cache entries.
    pub fn cache_invalidations(&self) -> u64 {
        self.inner.cache_invalidations.load(Ordering::Relaxed)
    }

    /// Get the number of calls refused by an open circuit.
    pub fn calls_short_circuited(&self) -> u64 {
        self.inner.calls_short_circuited.load(Ordering::Relaxed)
    }

    /// Get the number of times a circuit opened.
    pub fn circuit_trips(&self) -> u64 {
        self.inner.circuit_trips.load(Ordering::Relaxed)
    }

    /// Get the number of stored events.
    pub fn events_appended(&self) -> u64 {
        self.inner.events_appended.load(Ordering::Relaxed)
    }

    /// Get the number of optimistic concurrency conflicts.
    pub fn concurrency_conflicts(&self) -> u64 {
        self.inner.concurrency_conflicts.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_allowed: self.requests_allowed(),
            requests_rejected: self.requests_rejected(),
            cache_hits: self.cache_hits(),
            cache_misses: self.cache_misses(),
            cache_invalidations: self.cache_invalidations(),
            calls_short_circuited: self.calls_short_circuited(),
            circuit_trips: self.circuit_trips(),
            events_appended: self.events_appended(),
            concurrency_conflicts: self.concurrency_conflicts(),
        }
    }

    /// Reset all metrics to zero.
    ///
    /// Useful for testing or when starting a new monitoring period.
    pub fn reset(&self) {
        let inner = &self.inner;
        for counter in [
            &inner.requests_allowed,
            &inner.requests_rejected,
            &inner.cache_hits,
            &inner.cache_misses,
            &inner.cache_invalidations,
            &inner.calls_short_circuited,
            &inner.circuit_trips,
            &inner.events_appended,
            &inner.concurrency_conflicts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time snapshot of metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub requests_allowed: u64,
    pub requests_rejected: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_invalidations: u64,
    pub calls_short_circuited: u64,
    pub circuit_trips: u64,
    pub events_appended: u64,
    pub concurrency_conflicts: u64,
}

impl MetricsSnapshot {
    /// Calculate the rejection rate (0.0 to 1.0).
    ///
    /// Returns 0.0 if no requests have been processed.
    pub fn rejection_rate(&self) -> f64 {
        ratio(
            self.requests_rejected,
            self.requests_allowed.saturating_add(self.requests_rejected),
        )
    }

    /// Calculate the cache hit rate (0.0 to 1.0).
    ///
    /// Returns 0.0 if the cache was never consulted.
    pub fn cache_hit_rate(&self) -> f64 {
        ratio(
            self.cache_hits,
            self.cache_hits.saturating_add(self.cache_misses),
        )
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}
