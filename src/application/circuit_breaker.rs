//! Circuit breaker for calls to unreliable dependencies.
//!
//! Implements the circuit breaker pattern: after `failure_threshold`
//! consecutive failures the circuit opens and calls fail fast without touching
//! the dependency. Once `cool_down` has elapsed since the last failure, the
//! next caller runs a single trial call. Its outcome closes the circuit again
//! or restarts the cool-down.
//!
//! ## Half-open concurrency
//!
//! Only one trial is in flight at a time. The slot is claimed with a
//! compare-and-swap on an atomic flag; callers that arrive while a trial runs
//! fail fast with [`CircuitOpen`] (`retry_after` of zero, since the trial's
//! outcome is imminent) instead of waiting for it.

use crate::application::metrics::Metrics;
use crate::application::ports::Clock;
use crate::infrastructure::clock::SystemClock;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Calls pass through to the dependency
    Closed = 0,
    /// Calls fail fast without invoking the dependency
    Open = 1,
    /// A single trial call is testing recovery
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed, // Default to closed for invalid values
        }
    }
}

/// Error returned when a circuit breaker configuration is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CircuitBreakerConfigError {
    /// At least one failure must be tolerated before opening
    #[error("failure threshold must be greater than 0")]
    ZeroFailureThreshold,
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,
    /// Time since the last failure before a trial call is allowed
    pub cool_down: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a validated configuration.
    ///
    /// # Errors
    /// Returns `CircuitBreakerConfigError::ZeroFailureThreshold` if `failure_threshold` is zero.
    pub fn new(failure_threshold: u32, cool_down: Duration) -> Result<Self, CircuitBreakerConfigError> {
        let config = Self {
            failure_threshold,
            cool_down,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration.
    ///
    /// # Errors
    /// Returns `CircuitBreakerConfigError` if a field is out of range.
    pub fn validate(&self) -> Result<(), CircuitBreakerConfigError> {
        if self.failure_threshold == 0 {
            return Err(CircuitBreakerConfigError::ZeroFailureThreshold);
        }
        Ok(())
    }
}

/// The circuit refused a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("circuit is open, retry after {retry_after:?}")]
pub struct CircuitOpen {
    /// Time left in the cool-down; zero while a trial call is in flight
    pub retry_after: Duration,
}

/// Error returned by a protected call.
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// The circuit is open; the operation was not invoked
    #[error(transparent)]
    Open(#[from] CircuitOpen),
    /// The operation did not finish in time; counted as a failure
    #[error("dependency call timed out after {0:?}")]
    Timeout(Duration),
    /// The operation's own error, counted as a failure
    #[error("dependency call failed: {0}")]
    Dependency(E),
}

impl<E> CircuitBreakerError<E> {
    /// Check whether the call was refused without reaching the dependency.
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitBreakerError::Open(_))
    }

    /// Get the dependency's own error, if that is what failed.
    pub fn into_dependency(self) -> Option<E> {
        match self {
            CircuitBreakerError::Dependency(e) => Some(e),
            _ => None,
        }
    }
}

/// Circuit breaker protecting one downstream dependency.
///
/// Share it with `Arc`; every caller of the same dependency must go through
/// the same instance for the failure count to mean anything.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    state: AtomicU8,
    consecutive_failures: AtomicU64,
    last_failure_time_nanos: AtomicU64,
    trial_in_flight: AtomicBool,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
    /// Reference epoch for timestamp calculations
    epoch: Instant,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with default configuration.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, CircuitBreakerConfig::default())
    }

    /// Create a new circuit breaker with custom configuration.
    pub fn with_config(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, Arc::new(SystemClock::new()))
    }

    /// Create a new circuit breaker reading time from `clock`.
    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let epoch = clock.now();
        Self {
            name: name.into(),
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU64::new(0),
            last_failure_time_nanos: AtomicU64::new(0),
            trial_in_flight: AtomicBool::new(false),
            config,
            clock,
            metrics: Metrics::new(),
            epoch,
        }
    }

    /// Report into a shared metrics tracker.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Name of the protected dependency.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current circuit state.
    ///
    /// An open circuit whose cool-down has elapsed still reports `Open` until
    /// the next call moves it to `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Get the number of consecutive failures.
    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Ask permission for one call.
    ///
    /// The returned permit must be settled with [`CallPermit::succeeded`] or
    /// [`CallPermit::failed`]. Dropping an unsettled trial permit counts as a
    /// failed trial.
    ///
    /// # Errors
    /// Returns `CircuitOpen` if the circuit is open or a trial is already running.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CircuitOpen> {
        loop {
            match self.state() {
                CircuitState::Closed => return Ok(CallPermit::new(self, false)),
                CircuitState::Open => {
                    let elapsed = self.since_last_failure();
                    if elapsed < self.config.cool_down {
                        return Err(self.short_circuit(self.config.cool_down - elapsed));
                    }

                    // Only one caller performs the transition; the rest observe HalfOpen
                    if self
                        .state
                        .compare_exchange(
                            CircuitState::Open as u8,
                            CircuitState::HalfOpen as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        debug!(dependency = %self.name, "circuit half-open, probing recovery");
                    }
                }
                CircuitState::HalfOpen => {
                    if self
                        .trial_in_flight
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        return Err(self.short_circuit(Duration::ZERO));
                    }

                    // A trial may have settled between the state load and the claim
                    if self.state() == CircuitState::HalfOpen {
                        return Ok(CallPermit::new(self, true));
                    }
                    self.trial_in_flight.store(false, Ordering::Release);
                }
            }
        }
    }

    /// Run `operation` through the breaker.
    ///
    /// # Errors
    /// - `CircuitBreakerError::Open` without invoking `operation` while the circuit is open
    /// - `CircuitBreakerError::Dependency` with the operation's error after counting it
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire()?;
        match operation().await {
            Ok(value) => {
                permit.succeeded();
                Ok(value)
            }
            Err(e) => {
                permit.failed();
                Err(CircuitBreakerError::Dependency(e))
            }
        }
    }

    /// Run `operation` through the breaker, giving up after `timeout`.
    ///
    /// A timeout counts as a failure. The operation's future is dropped when
    /// the timeout fires.
    ///
    /// # Errors
    /// Same as [`execute`](Self::execute), plus `CircuitBreakerError::Timeout`.
    #[cfg(feature = "async")]
    pub async fn execute_with_timeout<F, Fut, T, E>(
        &self,
        timeout: Duration,
        operation: F,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire()?;
        match tokio::time::timeout(timeout, operation()).await {
            Ok(Ok(value)) => {
                permit.succeeded();
                Ok(value)
            }
            Ok(Err(e)) => {
                permit.failed();
                Err(CircuitBreakerError::Dependency(e))
            }
            Err(_) => {
                warn!(
                    dependency = %self.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "dependency call timed out"
                );
                permit.failed();
                Err(CircuitBreakerError::Timeout(timeout))
            }
        }
    }

    /// Run a blocking `operation` through the breaker.
    ///
    /// # Errors
    /// Same as [`execute`](Self::execute).
    pub fn call<F, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let permit = self.try_acquire()?;
        match operation() {
            Ok(value) => {
                permit.succeeded();
                Ok(value)
            }
            Err(e) => {
                permit.failed();
                Err(CircuitBreakerError::Dependency(e))
            }
        }
    }

    /// Reset the circuit breaker to closed state.
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.state
            .store(CircuitState::Closed as u8, Ordering::Release);
        self.trial_in_flight.store(false, Ordering::Release);
    }

    fn record_success(&self, trial: bool) {
        if trial {
            // Recovery successful, close circuit
            self.consecutive_failures.store(0, Ordering::Release);
            self.state
                .store(CircuitState::Closed as u8, Ordering::Release);
            self.trial_in_flight.store(false, Ordering::Release);
            info!(dependency = %self.name, "circuit closed after successful trial call");
        } else if self.state() == CircuitState::Closed {
            self.consecutive_failures.store(0, Ordering::Release);
        }
        // Late successes from calls admitted before the circuit opened change nothing
    }

    fn record_failure(&self, trial: bool) {
        if trial {
            // Recovery failed, reopen circuit and restart the cool-down
            self.consecutive_failures.fetch_add(1, Ordering::AcqRel);
            self.touch_last_failure();
            self.state
                .store(CircuitState::Open as u8, Ordering::Release);
            self.trial_in_flight.store(false, Ordering::Release);
            self.metrics.record_trip();
            warn!(dependency = %self.name, "trial call failed, circuit re-opened");
            return;
        }

        if self.state() != CircuitState::Closed {
            // Only the trial decides the outcome of a half-open circuit
            return;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        self.touch_last_failure();

        if failures >= u64::from(self.config.failure_threshold)
            && self
                .state
                .compare_exchange(
                    CircuitState::Closed as u8,
                    CircuitState::Open as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            self.metrics.record_trip();
            warn!(
                dependency = %self.name,
                failures,
                cool_down_ms = self.config.cool_down.as_millis() as u64,
                "circuit opened"
            );
        }
    }

    fn short_circuit(&self, retry_after: Duration) -> CircuitOpen {
        self.metrics.record_short_circuit();
        debug!(
            dependency = %self.name,
            retry_after_ms = retry_after.as_millis() as u64,
            "call short-circuited"
        );
        CircuitOpen { retry_after }
    }

    fn touch_last_failure(&self) {
        let nanos = self
            .clock
            .now()
            .saturating_duration_since(self.epoch)
            .as_nanos()
            .try_into()
            .unwrap_or(u64::MAX);
        self.last_failure_time_nanos.store(nanos, Ordering::Release);
    }

    fn since_last_failure(&self) -> Duration {
        let nanos = self.last_failure_time_nanos.load(Ordering::Acquire);
        let last_failure = self.epoch + Duration::from_nanos(nanos);
        self.clock.now().saturating_duration_since(last_failure)
    }
}

/// Shareable circuit breaker reference.
pub type SharedCircuitBreaker = Arc<CircuitBreaker>;

/// Permission to make one call through a [`CircuitBreaker`].
#[derive(Debug)]
#[must_use = "a permit must be settled with succeeded() or failed()"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    /// Check whether this is the half-open trial call.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Report that the call succeeded.
    pub fn succeeded(mut self) {
        self.settled = true;
        self.breaker.record_success(self.trial);
    }

    /// Report that the call failed.
    pub fn failed(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.trial);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        // An abandoned trial (e.g. a cancelled future) must not keep the slot forever
        if !self.settled && self.trial {
            self.breaker.record_failure(true);
        }
    }
}
