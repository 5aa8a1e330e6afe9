//! Facade wiring every component from one configuration.
//!
//! A hosting service builds one [`ServiceGuard`] at startup and shares it. The
//! guard owns the clock, the metrics, the rate limiter, the response cache and
//! one circuit breaker per downstream dependency, and hands out CQRS handlers
//! already connected to its cache.

use crate::application::cache::ResponseCache;
use crate::application::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigError,
};
use crate::application::cqrs::{CommandHandler, QueryHandler};
use crate::application::event_store::EventStore;
use crate::application::limiter::{RateLimitExceeded, RateLimiter};
use crate::application::metrics::Metrics;
use crate::application::ports::{Clock, EventLog, Storage};
use crate::application::sweeper::SweepConfigError;
use crate::domain::aggregate::{Aggregate, Projection, Query};
use crate::domain::event::DomainEvent;
use crate::domain::window::{RateLimit, RateLimitConfigError};
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::storage::ShardedStorage;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[cfg(feature = "async")]
use crate::application::limiter::RateLimiterSweep;
#[cfg(feature = "async")]
use crate::application::sweeper::{ShutdownError, Sweeper, SweeperHandle};
#[cfg(feature = "async")]
use std::sync::{Mutex, PoisonError};

/// Error returned when building a `ServiceGuard` fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    /// Rate limit budget validation failed
    #[error("invalid rate limit: {0}")]
    RateLimit(#[from] RateLimitConfigError),
    /// Circuit breaker configuration validation failed
    #[error("invalid circuit breaker configuration: {0}")]
    CircuitBreaker(#[from] CircuitBreakerConfigError),
    /// Cache entries must live for some time
    #[error("cache ttl must be greater than 0")]
    ZeroCacheTtl,
    /// Sweeper configuration validation failed
    #[error("invalid sweep configuration: {0}")]
    Sweep(#[from] SweepConfigError),
    /// Background sweeping was requested outside a tokio runtime
    #[error("background sweeping requires a running tokio runtime")]
    NoRuntime,
}

/// Serializable settings for a [`ServiceGuard`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Requests admitted per key per window
    pub rate_limit: u32,
    /// Trailing window the rate limit applies to
    pub rate_window: Duration,
    /// Lifetime of cached query answers
    pub cache_ttl: Duration,
    /// Settings shared by every dependency's breaker
    pub circuit_breaker: CircuitBreakerConfig,
    /// Background sweep period; `None` disables sweeping
    pub sweep_interval: Option<Duration>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            rate_limit: 100,
            rate_window: Duration::from_secs(1),
            cache_ttl: Duration::from_secs(30),
            circuit_breaker: CircuitBreakerConfig::default(),
            sweep_interval: None,
        }
    }
}

/// Builder for constructing a [`ServiceGuard`].
pub struct ServiceGuardBuilder<V> {
    config: GuardConfig,
    clock: Option<Arc<dyn Clock>>,
    metrics: Option<Metrics>,
    _value: PhantomData<fn() -> V>,
}

impl<V> ServiceGuardBuilder<V>
where
    V: Clone + Send + Sync + Debug + 'static,
{
    /// Replace every setting at once, e.g. with one loaded from a file.
    pub fn with_config(mut self, config: GuardConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the per-key request budget.
    ///
    /// The values will be validated when `build()` is called.
    pub fn with_rate_limit(mut self, limit: u32, window: Duration) -> Self {
        self.config.rate_limit = limit;
        self.config.rate_window = window;
        self
    }

    /// Set how long cached query answers stay valid.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl = ttl;
        self
    }

    /// Set the configuration used for every dependency's breaker.
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = config;
        self
    }

    /// Prune dead cache entries and rate-limit windows every `interval`.
    ///
    /// Requires the `async` feature and a running tokio runtime at `build()`.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = Some(interval);
        self
    }

    /// Set a custom clock (mainly for testing).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Report into an existing metrics tracker.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the guard.
    ///
    /// # Errors
    /// Returns `BuildError` if any setting is invalid, or if sweeping is
    /// enabled without a tokio runtime.
    pub fn build(self) -> Result<ServiceGuard<V>, BuildError> {
        let config = self.config;

        let rate = RateLimit::new(config.rate_limit as usize, config.rate_window)?;
        config.circuit_breaker.validate()?;
        if config.cache_ttl.is_zero() {
            return Err(BuildError::ZeroCacheTtl);
        }

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()));
        let metrics = self.metrics.unwrap_or_default();

        let limiter = RateLimiter::in_memory(Arc::clone(&clock), metrics.clone());
        let cache = ResponseCache::in_memory(Arc::clone(&clock), metrics.clone());

        #[cfg(feature = "async")]
        let sweeper = match config.sweep_interval {
            Some(interval) => {
                let sweeper = Sweeper::new(interval)?
                    .with_target(Arc::new(cache.clone()))
                    .with_target(Arc::new(RateLimiterSweep::new(
                        limiter.clone(),
                        rate.window(),
                    )));
                if tokio::runtime::Handle::try_current().is_err() {
                    return Err(BuildError::NoRuntime);
                }
                Some(sweeper.start())
            }
            None => None,
        };

        #[cfg(not(feature = "async"))]
        if config.sweep_interval.is_some() {
            return Err(BuildError::NoRuntime);
        }

        debug!(
            rate_limit = config.rate_limit,
            rate_window_ms = config.rate_window.as_millis() as u64,
            cache_ttl_ms = config.cache_ttl.as_millis() as u64,
            failure_threshold = config.circuit_breaker.failure_threshold,
            "service guard built"
        );

        Ok(ServiceGuard {
            rate,
            config,
            clock,
            metrics,
            limiter,
            cache,
            breakers: ShardedStorage::new(),
            #[cfg(feature = "async")]
            sweeper: Mutex::new(sweeper),
        })
    }
}

/// Resilience toolkit for one hosting service.
///
/// `V` is the type of cached query answers.
#[derive(Debug)]
pub struct ServiceGuard<V>
where
    V: Clone + Send + Sync + Debug + 'static,
{
    rate: RateLimit,
    config: GuardConfig,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
    limiter: RateLimiter,
    cache: ResponseCache<V>,
    breakers: ShardedStorage<String, Arc<CircuitBreaker>>,
    #[cfg(feature = "async")]
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl<V> ServiceGuard<V>
where
    V: Clone + Send + Sync + Debug + 'static,
{
    /// Create a builder for configuring the guard.
    ///
    /// Defaults:
    /// - Rate limit: 100 requests per second per key
    /// - Cache TTL: 30 seconds
    /// - Circuit breaker: 5 consecutive failures, 30 second cool-down
    /// - Sweeping: disabled
    pub fn builder() -> ServiceGuardBuilder<V> {
        ServiceGuardBuilder {
            config: GuardConfig::default(),
            clock: None,
            metrics: None,
            _value: PhantomData,
        }
    }

    /// Admit or reject one request from `key` under the configured budget.
    ///
    /// # Errors
    /// Returns `RateLimitExceeded` if `key` used up its budget.
    pub fn admit(&self, key: &str) -> Result<(), RateLimitExceeded> {
        self.limiter.check_with(key, &self.rate)
    }

    /// Store a response under `key` for the configured cache TTL.
    pub fn cache_response(&self, key: impl Into<String>, value: V) {
        self.cache.set(key, value, self.config.cache_ttl);
    }

    /// Serve `key` from the cache, or compute and store it for the configured TTL.
    ///
    /// # Errors
    /// Returns the computation's error; nothing is cached in that case.
    pub fn cached<F, E>(&self, key: &str, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        self.cache.get_or_compute(key, self.config.cache_ttl, compute)
    }

    /// Get the breaker guarding `dependency`, creating it on first use.
    ///
    /// Every call with the same name returns the same breaker.
    pub fn breaker(&self, dependency: &str) -> Arc<CircuitBreaker> {
        self.breakers.with_entry_mut(
            dependency.to_string(),
            || {
                Arc::new(
                    CircuitBreaker::with_clock(
                        dependency,
                        self.config.circuit_breaker,
                        Arc::clone(&self.clock),
                    )
                    .with_metrics(self.metrics.clone()),
                )
            },
            |breaker| Arc::clone(breaker),
        )
    }

    /// Create an in-memory event store sharing this guard's clock and metrics.
    pub fn in_memory_event_store<E>(&self) -> Arc<EventStore<E>>
    where
        E: DomainEvent,
    {
        Arc::new(EventStore::in_memory(
            Arc::clone(&self.clock),
            self.metrics.clone(),
        ))
    }

    /// Create an event store over `log` sharing this guard's clock and metrics.
    pub fn event_store<E, L>(&self, log: L) -> Arc<EventStore<E, L>>
    where
        E: DomainEvent,
        L: EventLog<E>,
    {
        Arc::new(EventStore::new(log, Arc::clone(&self.clock), self.metrics.clone()))
    }

    /// Create a command handler that invalidates this guard's cache.
    pub fn command_handler<A, L>(&self, store: Arc<EventStore<A::Event, L>>) -> CommandHandler<A, L>
    where
        A: Aggregate,
        L: EventLog<A::Event>,
    {
        CommandHandler::new(store).with_invalidator(Arc::new(self.cache.clone()))
    }

    /// Create a query handler that reads through this guard's cache.
    pub fn query_handler<Q, L>(
        &self,
        store: Arc<EventStore<<Q::Projection as Projection>::Event, L>>,
    ) -> QueryHandler<Q, L>
    where
        Q: Query<Output = V>,
        L: EventLog<<Q::Projection as Projection>::Event>,
    {
        QueryHandler::new(store, self.cache.clone())
    }

    /// Get the rate limiter.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Get the response cache.
    pub fn cache(&self) -> &ResponseCache<V> {
        &self.cache
    }

    /// Get the clock every component reads.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Get the metrics shared by every component.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Get the configuration the guard was built from.
    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Stop the background sweeper, if one is running.
    ///
    /// Calling it again is a no-op.
    ///
    /// # Errors
    /// Returns `ShutdownError` if the sweeper task panicked or was cancelled.
    #[cfg(feature = "async")]
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        // Take the handle while holding the lock, then release the lock before awaiting
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            handle.shutdown().await?;
        }
        Ok(())
    }
}
