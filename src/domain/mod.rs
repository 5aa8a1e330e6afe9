//! Domain layer - pure logic with no I/O and no shared state.
//!
//! This layer contains the core concepts and invariants of the toolkit:
//! - Sliding-window admission logs and rate limit budgets
//! - Cache entries and cache key computation
//! - Domain events and their recorded form
//! - Aggregates, projections and queries for the CQRS split
//!
//! All types in this layer are pure and easily testable.

pub mod aggregate;
pub mod cache_entry;
pub mod cache_key;
pub mod event;
pub mod window;
