//! Cached values with a time-to-live.

use std::time::{Duration, Instant};

/// A memoized value and the moment it stops being valid.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// The cached payload
    pub value: V,
    /// When the value was stored
    pub inserted_at: Instant,
    /// How long the value stays valid
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    /// Create an entry stored at `inserted_at`.
    pub fn new(value: V, inserted_at: Instant, ttl: Duration) -> Self {
        Self {
            value,
            inserted_at,
            ttl,
        }
    }

    /// An entry is fresh while `now - inserted_at < ttl`.
    pub fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) < self.ttl
    }

    /// Remaining lifetime at `now`.
    pub fn time_to_live(&self, now: Instant) -> Duration {
        self.ttl
            .saturating_sub(now.saturating_duration_since(self.inserted_at))
    }
}
