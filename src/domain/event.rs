//! Domain events and their recorded form.
//!
//! Aggregates emit plain event values implementing [`DomainEvent`]. The event
//! store wraps each one in a [`RecordedEvent`] carrying the aggregate identity,
//! the per-aggregate sequence number assigned at append time, the event type
//! tag and the wall-clock timestamp.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// An event emitted by an aggregate.
///
/// The event type is a stable tag used for logging and for readers that do
/// not deserialize the payload.
pub trait DomainEvent: Clone + std::fmt::Debug + Send + Sync + 'static {
    /// Stable name of the event variant (e.g. `"FundsDeposited"`).
    fn event_type(&self) -> &'static str;
}

/// An event as stored in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent<E> {
    /// Aggregate this event belongs to
    pub aggregate_id: String,
    /// Position in the aggregate's stream, starting at 1
    pub sequence: u64,
    /// Tag of the event variant
    pub event_type: String,
    /// The event itself
    pub payload: E,
    /// When the store accepted the event
    pub timestamp: SystemTime,
}

impl<E: DomainEvent> RecordedEvent<E> {
    /// Wrap a payload with its storage metadata.
    pub fn new(
        aggregate_id: impl Into<String>,
        sequence: u64,
        payload: E,
        timestamp: SystemTime,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            sequence,
            event_type: payload.event_type().to_string(),
            payload,
            timestamp,
        }
    }
}
