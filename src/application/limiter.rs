//! Rate limiter coordination logic.
//!
//! The rate limiter decides whether a caller identified by a key may proceed,
//! based on a sliding time window and a request budget. Each key owns an
//! independent [`SlidingWindow`] in sharded storage, so unrelated callers never
//! contend for the same lock.

use crate::application::metrics::Metrics;
use crate::application::ports::{Clock, Storage, Sweep};
use crate::domain::window::{RateLimit, SlidingWindow};
use crate::infrastructure::storage::ShardedStorage;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Error returned by [`RateLimiter::check`] when the budget is exhausted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rate limit of {limit} per {window:?} exceeded for '{key}', retry after {retry_after:?}")]
pub struct RateLimitExceeded {
    /// Caller identity that was rejected
    pub key: String,
    /// Budget that was exhausted
    pub limit: usize,
    /// Window the budget applies to
    pub window: Duration,
    /// Time until the oldest admission leaves the window
    pub retry_after: Duration,
}

/// Sliding-window rate limiter.
///
/// A rejected call is never recorded and never blocks; the caller decides
/// whether to queue, reject or degrade.
#[derive(Debug, Clone)]
pub struct RateLimiter<S = Arc<ShardedStorage<String, SlidingWindow>>>
where
    S: Storage<String, SlidingWindow> + Clone,
{
    storage: S,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
}

impl RateLimiter {
    /// Create a rate limiter backed by sharded in-memory storage.
    pub fn in_memory(clock: Arc<dyn Clock>, metrics: Metrics) -> Self {
        Self::new(Arc::new(ShardedStorage::new()), clock, metrics)
    }
}

impl<S> RateLimiter<S>
where
    S: Storage<String, SlidingWindow> + Clone,
{
    /// Create a new rate limiter.
    ///
    /// # Arguments
    /// * `storage` - Per-key window storage
    /// * `clock` - Time source for admissions
    /// * `metrics` - Metrics tracker
    pub fn new(storage: S, clock: Arc<dyn Clock>, metrics: Metrics) -> Self {
        Self {
            storage,
            clock,
            metrics,
        }
    }

    /// Decide whether `key` may proceed under `limit` requests per `window`.
    ///
    /// Records the admission if and only if it returns `true`. A zero limit or
    /// a zero window admits nothing and leaves storage untouched.
    pub fn allow(&self, key: &str, limit: usize, window: Duration) -> bool {
        let now = self.clock.now();
        let allowed = !admits_nothing(limit, window)
            && self.storage.with_entry_mut(
                key.to_string(),
                SlidingWindow::new,
                |entry| entry.try_admit(now, limit, window),
            );

        if allowed {
            trace!(key, limit, "request admitted");
            self.metrics.record_allowed();
        } else {
            debug!(key, limit, window_ms = window.as_millis() as u64, "request rate limited");
            self.metrics.record_rejected();
        }

        allowed
    }

    /// Like [`allow`](Self::allow), but reports a rejection as an error.
    ///
    /// # Errors
    /// Returns `RateLimitExceeded` with the time until a slot frees up.
    pub fn check(&self, key: &str, limit: usize, window: Duration) -> Result<(), RateLimitExceeded> {
        let now = self.clock.now();
        let outcome = if admits_nothing(limit, window) {
            Err(Duration::ZERO)
        } else {
            self.storage.with_entry_mut(
                key.to_string(),
                SlidingWindow::new,
                |entry| {
                    if entry.try_admit(now, limit, window) {
                        Ok(())
                    } else {
                        Err(entry.retry_after(now, window))
                    }
                },
            )
        };

        match outcome {
            Ok(()) => {
                trace!(key, limit, "request admitted");
                self.metrics.record_allowed();
                Ok(())
            }
            Err(retry_after) => {
                debug!(
                    key,
                    limit,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "request rate limited"
                );
                self.metrics.record_rejected();
                Err(RateLimitExceeded {
                    key: key.to_string(),
                    limit,
                    window,
                    retry_after,
                })
            }
        }
    }

    /// [`allow`](Self::allow) with a validated budget.
    pub fn allow_with(&self, key: &str, rate: &RateLimit) -> bool {
        self.allow(key, rate.limit(), rate.window())
    }

    /// [`check`](Self::check) with a validated budget.
    ///
    /// # Errors
    /// Returns `RateLimitExceeded` if the budget is exhausted.
    pub fn check_with(&self, key: &str, rate: &RateLimit) -> Result<(), RateLimitExceeded> {
        self.check(key, rate.limit(), rate.window())
    }

    /// Budget left for `key` right now, without recording anything.
    pub fn remaining(&self, key: &str, limit: usize, window: Duration) -> usize {
        if admits_nothing(limit, window) {
            return 0;
        }
        let now = self.clock.now();
        self.storage
            .with_existing_mut(&key.to_string(), |entry| {
                entry.prune(now, window);
                limit.saturating_sub(entry.len())
            })
            .unwrap_or(limit)
    }

    /// Forget every admission recorded for `key`.
    pub fn reset(&self, key: &str) {
        self.storage.remove(&key.to_string());
    }

    /// Prune every window against `window` and drop keys left empty.
    ///
    /// Returns the number of keys removed.
    pub fn sweep_older_than(&self, window: Duration) -> usize {
        let now = self.clock.now();
        let before = self.storage.len();
        self.storage.retain(|_, entry| {
            entry.prune(now, window);
            entry.shrink();
            !entry.is_empty()
        });
        before.saturating_sub(self.storage.len())
    }

    /// Number of keys with a window in storage.
    pub fn tracked_keys(&self) -> usize {
        self.storage.len()
    }

    /// Get a reference to the metrics.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

fn admits_nothing(limit: usize, window: Duration) -> bool {
    limit == 0 || window.is_zero()
}

/// Sweeping a limiter on its own only knows the largest window it was
/// configured with; [`RateLimiterSweep`] pairs the two.
#[derive(Debug, Clone)]
pub struct RateLimiterSweep<S = Arc<ShardedStorage<String, SlidingWindow>>>
where
    S: Storage<String, SlidingWindow> + Clone,
{
    limiter: RateLimiter<S>,
    max_window: Duration,
}

impl<S> RateLimiterSweep<S>
where
    S: Storage<String, SlidingWindow> + Clone,
{
    /// Sweep `limiter` assuming no caller uses a window longer than `max_window`.
    pub fn new(limiter: RateLimiter<S>, max_window: Duration) -> Self {
        Self {
            limiter,
            max_window,
        }
    }
}

impl<S> Sweep for RateLimiterSweep<S>
where
    S: Storage<String, SlidingWindow> + Clone,
{
    fn name(&self) -> &'static str {
        "rate_limiter"
    }

    fn sweep(&self) -> usize {
        self.limiter.sweep_older_than(self.max_window)
    }
}
