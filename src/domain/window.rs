//! Sliding-window request log.
//!
//! A [`SlidingWindow`] holds the admission timestamps of one caller. The window
//! is the half-open interval `(now - window, now]`: a timestamp exactly
//! `window` old has already left it.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Error returned when a rate limit budget is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitConfigError {
    /// The request budget must allow at least one request
    #[error("rate limit must be greater than 0")]
    ZeroLimit,
    /// The window must have a non-zero length
    #[error("rate limit window must be greater than 0")]
    ZeroWindow,
}

/// A request budget: at most `limit` admissions per trailing `window`.
///
/// Deserialization goes through [`RateLimit::new`], so a decoded budget is
/// always valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "UncheckedRateLimit")]
pub struct RateLimit {
    limit: usize,
    window: Duration,
}

#[derive(Deserialize)]
struct UncheckedRateLimit {
    limit: usize,
    window: Duration,
}

impl TryFrom<UncheckedRateLimit> for RateLimit {
    type Error = RateLimitConfigError;

    fn try_from(raw: UncheckedRateLimit) -> Result<Self, Self::Error> {
        RateLimit::new(raw.limit, raw.window)
    }
}

impl RateLimit {
    /// Create a validated budget.
    ///
    /// # Errors
    /// Returns `RateLimitConfigError` if `limit` or `window` is zero.
    pub fn new(limit: usize, window: Duration) -> Result<Self, RateLimitConfigError> {
        if limit == 0 {
            return Err(RateLimitConfigError::ZeroLimit);
        }
        if window.is_zero() {
            return Err(RateLimitConfigError::ZeroWindow);
        }
        Ok(Self { limit, window })
    }

    /// Maximum admissions per window.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Length of the trailing window.
    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Admission timestamps for a single key, oldest first.
#[derive(Debug, Clone, Default)]
pub struct SlidingWindow {
    timestamps: VecDeque<Instant>,
}

impl SlidingWindow {
    /// Create an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every timestamp that is at least `window` old.
    pub fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.timestamps.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Prune, then record `now` if fewer than `limit` admissions remain in the window.
    ///
    /// Returns whether the request was admitted. A rejected attempt is not recorded.
    pub fn try_admit(&mut self, now: Instant, limit: usize, window: Duration) -> bool {
        if limit == 0 || window.is_zero() {
            return false;
        }

        self.prune(now, window);

        if self.timestamps.len() < limit {
            self.timestamps.push_back(now);
            true
        } else {
            false
        }
    }

    /// Time until the oldest retained admission leaves the window.
    ///
    /// Only meaningful right after a prune at `now`.
    pub fn retry_after(&self, now: Instant, window: Duration) -> Duration {
        self.timestamps
            .front()
            .map(|&oldest| window.saturating_sub(now.saturating_duration_since(oldest)))
            .unwrap_or(Duration::ZERO)
    }

    /// Number of admissions currently retained.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Check whether the window holds no admissions.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Release the backing buffer once the window has drained.
    pub fn shrink(&mut self) {
        if self.timestamps.is_empty() {
            self.timestamps.shrink_to_fit();
        }
    }
}
