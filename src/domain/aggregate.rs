//! Aggregates, commands, projections and queries.
//!
//! The write side is an [`Aggregate`]: state folded from its own events, which
//! decides whether a [`Command`] is acceptable and which events it produces.
//! The read side is a [`Projection`] folded from recorded events and shaped
//! into an answer by a [`Query`]. The two sides only meet at the event store.

use crate::domain::cache_key::CacheKey;
use crate::domain::event::{DomainEvent, RecordedEvent};
use std::time::Duration;

/// Intent to change one aggregate.
pub trait Command: Send + Sync {
    /// Aggregate this command targets.
    fn aggregate_id(&self) -> &str;
}

/// Write-side state whose only source of truth is its event stream.
pub trait Aggregate: Default + Send + Sync {
    /// Namespace shared with the read models derived from this aggregate.
    ///
    /// Cache keys of those read models must start with
    /// `CacheKey::aggregate_prefix(SCOPE, aggregate_id)` to be invalidated
    /// by commands.
    const SCOPE: &'static str;

    /// Commands this aggregate accepts
    type Command: Command;
    /// Events this aggregate emits
    type Event: DomainEvent;
    /// Business rule violations
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validate a command against current state and produce the resulting events.
    ///
    /// Must not mutate state; the events are applied after they are stored.
    fn decide(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error>;

    /// Fold one event into the state.
    fn apply(&mut self, event: &Self::Event);

    /// Rebuild state from a stream, returning it with the last applied sequence.
    fn replay(events: &[RecordedEvent<Self::Event>]) -> (Self, u64) {
        let mut state = Self::default();
        let mut version = 0;
        for event in events {
            state.apply(&event.payload);
            version = event.sequence;
        }
        (state, version)
    }
}

/// Disposable read model folded from recorded events.
pub trait Projection: Default + Send + Sync {
    /// Event type the projection consumes
    type Event: DomainEvent;

    /// Fold one recorded event into the view.
    fn apply(&mut self, event: &RecordedEvent<Self::Event>);

    /// Build the view from a full stream, starting at sequence 1.
    fn rebuild(events: &[RecordedEvent<Self::Event>]) -> Self {
        let mut view = Self::default();
        for event in events {
            view.apply(event);
        }
        view
    }
}

/// Read request answered from a projection.
pub trait Query: Send + Sync {
    /// Read model the answer is derived from
    type Projection: Projection;
    /// Answer handed back to the caller and stored in the cache
    type Output: Clone + std::fmt::Debug + Send + Sync + 'static;

    /// Aggregate whose stream feeds the projection.
    fn aggregate_id(&self) -> &str;

    /// Key the answer is cached under.
    fn cache_key(&self) -> CacheKey;

    /// How long a cached answer stays valid.
    fn ttl(&self) -> Duration;

    /// Shape the projection into the answer.
    fn project(&self, view: &Self::Projection) -> Self::Output;
}
