//! Application layer - orchestration of domain logic.
//!
//! This layer coordinates the domain logic and manages the runtime behavior:
//! - Rate limiter (per-key admission decisions)
//! - Response cache (TTL-bounded memo of query answers)
//! - Circuit breaker (failure isolation per dependency)
//! - Event store and CQRS handlers (write and read sides)
//! - Sweeper (background memory bounding)
//!
//! ## Ports
//!
//! The application layer defines ports (traits) that infrastructure
//! adapters must implement. This keeps the application layer independent
//! from infrastructure details.

pub mod cache;
pub mod circuit_breaker;
pub mod cqrs;
pub mod event_store;
pub mod limiter;
pub mod metrics;
pub mod ports;
pub mod sweeper;
