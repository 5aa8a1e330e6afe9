//! # service-guard
//!
//! Resilience and consistency building blocks for request-handling services.
//!
//! A service that receives requests, reads from and writes to a data store and
//! calls unreliable downstream dependencies needs the same handful of
//! protections over and over. This crate provides them as explicit, shareable
//! components:
//!
//! - [`RateLimiter`]: sliding-window admission per caller key
//! - [`ResponseCache`]: TTL-bounded memo of idempotent read results
//! - [`CircuitBreaker`]: fail-fast isolation of a failing dependency
//! - [`EventStore`]: append-only, versioned log of domain events per aggregate
//! - [`CommandHandler`] / [`QueryHandler`]: the write and read sides of CQRS,
//!   meeting only at the event store
//!
//! [`ServiceGuard`] wires them together from one validated configuration.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use service_guard::{CircuitBreakerConfig, ServiceGuard};
//! use std::time::Duration;
//!
//! # async fn fetch_quote() -> Result<String, std::io::Error> { Ok(String::new()) }
//! # async fn handle() -> Result<(), Box<dyn std::error::Error>> {
//! let guard: ServiceGuard<String> = ServiceGuard::builder()
//!     .with_rate_limit(100, Duration::from_secs(1))
//!     .with_cache_ttl(Duration::from_secs(30))
//!     .with_circuit_breaker(CircuitBreakerConfig::new(5, Duration::from_secs(30))?)
//!     .build()?;
//!
//! // Reject callers over budget
//! guard.admit("client-42")?;
//!
//! // Serve idempotent reads from the cache
//! if let Some(quote) = guard.cache().get("quote/EURUSD/latest") {
//!     println!("{quote}");
//!     return Ok(());
//! }
//!
//! // Protect the downstream call
//! let quote = guard.breaker("quotes-api").execute(fetch_quote).await?;
//! guard.cache_response("quote/EURUSD/latest", quote);
//! # Ok(())
//! # }
//! ```
//!
//! ## Semantics at a glance
//!
//! ### Rate limiting
//! A request is admitted if fewer than `limit` requests from the same key were
//! admitted in the trailing `window`. A timestamp exactly `window` old no
//! longer counts. Rejected requests are not recorded, and a rejection never
//! blocks.
//!
//! ### Caching
//! Expiry is lazy: an entry older than its TTL is never returned. Only
//! side-effect-free reads should populate the cache; commands invalidate the
//! entries derived from the aggregate they changed, synchronously, before
//! returning.
//!
//! ### Circuit breaking
//! `failure_threshold` consecutive failures open the circuit. While open,
//! calls fail with [`CircuitOpen`] without reaching the dependency. Once
//! `cool_down` has elapsed since the last failure, exactly one trial call
//! runs; success closes the circuit, failure restarts the cool-down. Callers
//! arriving during the trial fail fast.
//!
//! ### Event sourcing
//! Each aggregate's events are numbered 1, 2, 3, ... with no gaps and no
//! duplicates, even under concurrent appends. An append based on a stale
//! version fails with [`EventStoreError::ConcurrencyConflict`]; reload and
//! retry with [`CommandHandler::handle_with_retry`].
//!
//! ## Testing
//!
//! Every component reads time through the [`Clock`] port. Enable the
//! `test-helpers` feature to get `MockClock`, `FlakyEventLog` and
//! `MockCaptureLayer` under `infrastructure::mocks`.

// Domain layer - pure business logic
pub mod domain;

// Application layer - orchestration
pub mod application;

// Infrastructure layer - external adapters
pub mod infrastructure;

// Re-export commonly used types for convenience
pub use domain::{
    aggregate::{Aggregate, Command, Projection, Query},
    cache_entry::CacheEntry,
    cache_key::{CacheKey, CacheKeyBuilder},
    event::{DomainEvent, RecordedEvent},
    window::{RateLimit, RateLimitConfigError, SlidingWindow},
};

pub use application::{
    cache::ResponseCache,
    circuit_breaker::{
        CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigError,
        CircuitBreakerError, CircuitOpen, CircuitState, SharedCircuitBreaker,
    },
    cqrs::{CommandError, CommandHandler, QueryError, QueryHandler},
    event_store::{EventStore, EventStoreError},
    limiter::{RateLimitExceeded, RateLimiter, RateLimiterSweep},
    metrics::{Metrics, MetricsSnapshot},
    ports::{CacheInvalidator, Clock, EventLog, Storage, Sweep},
    sweeper::{ShutdownError, SweepConfigError, Sweeper},
};

#[cfg(feature = "async")]
pub use application::sweeper::SweeperHandle;

pub use infrastructure::{
    clock::SystemClock,
    event_log::InMemoryEventLog,
    file_event_log::FileEventLog,
    guard::{BuildError, GuardConfig, ServiceGuard, ServiceGuardBuilder},
    storage::ShardedStorage,
};
