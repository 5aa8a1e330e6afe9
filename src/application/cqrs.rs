//! Command and query handlers.
//!
//! Commands and queries share nothing but the event store. A command rebuilds
//! its aggregate from the stream, lets it decide, appends the resulting events
//! at the version it read and then drops every cached read derived from that
//! aggregate. A query folds the stream into a projection, shapes the answer
//! and memoizes it in a [`ResponseCache`].
//!
//! Invalidation runs synchronously after the append succeeded, so a read that
//! starts after `handle` returned never sees a pre-command answer. A read that
//! overlapped the command may return the older answer but never caches it.

use crate::application::cache::ResponseCache;
use crate::application::event_store::{EventStore, EventStoreError};
use crate::application::ports::{CacheInvalidator, EventLog};
use crate::domain::aggregate::{Aggregate, Command, Projection, Query};
use crate::domain::cache_key::CacheKey;
use crate::domain::event::RecordedEvent;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, trace};

/// Error returned by [`CommandHandler::handle`].
#[derive(Debug, thiserror::Error)]
pub enum CommandError<E> {
    /// The aggregate refused the command
    #[error("command rejected: {0}")]
    Rejected(#[source] E),

    /// The events could not be loaded or stored
    #[error(transparent)]
    Store(#[from] EventStoreError),
}

impl<E> CommandError<E> {
    /// Check whether the command lost an optimistic concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, CommandError::Store(err) if err.is_conflict())
    }
}

/// Error returned by [`QueryHandler::handle`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// The events could not be loaded
    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// The aggregate has no events
    #[error("aggregate '{0}' not found")]
    NotFound(String),
}

/// Write side: validates commands and records their events.
pub struct CommandHandler<A, L>
where
    A: Aggregate,
    L: EventLog<A::Event>,
{
    store: Arc<EventStore<A::Event, L>>,
    invalidators: Vec<Arc<dyn CacheInvalidator>>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A, L> CommandHandler<A, L>
where
    A: Aggregate,
    L: EventLog<A::Event>,
{
    /// Create a handler appending to `store`.
    pub fn new(store: Arc<EventStore<A::Event, L>>) -> Self {
        Self {
            store,
            invalidators: Vec::new(),
            _aggregate: PhantomData,
        }
    }

    /// Register a cache to invalidate after every accepted command.
    pub fn with_invalidator(mut self, invalidator: Arc<dyn CacheInvalidator>) -> Self {
        self.invalidators.push(invalidator);
        self
    }

    /// Register a cache on an existing handler.
    pub fn register_invalidator(&mut self, invalidator: Arc<dyn CacheInvalidator>) {
        self.invalidators.push(invalidator);
    }

    /// Validate and apply one command.
    ///
    /// Returns the events it produced, as stored. A command that produces no
    /// events appends nothing and invalidates nothing.
    ///
    /// # Errors
    /// - `CommandError::Rejected` if the aggregate refuses the command
    /// - `CommandError::Store` if loading or appending fails, including
    ///   `ConcurrencyConflict` when another command changed the aggregate first
    pub fn handle(
        &self,
        command: &A::Command,
    ) -> Result<Vec<RecordedEvent<A::Event>>, CommandError<A::Error>> {
        let aggregate_id = command.aggregate_id();

        let history = self.store.read_all(aggregate_id)?;
        let (state, version) = A::replay(&history);

        let events = state.decide(command).map_err(CommandError::Rejected)?;
        if events.is_empty() {
            trace!(aggregate_id, version, "command produced no events");
            return Ok(Vec::new());
        }

        let recorded = self
            .store
            .append_batch(aggregate_id, Some(version), events)?;

        let prefix = CacheKey::aggregate_prefix(A::SCOPE, aggregate_id);
        let invalidated: usize = self
            .invalidators
            .iter()
            .map(|cache| cache.invalidate_prefix(&prefix))
            .sum();

        debug!(
            aggregate_id,
            scope = A::SCOPE,
            events = recorded.len(),
            invalidated,
            "command handled"
        );

        Ok(recorded)
    }

    /// Like [`handle`](Self::handle), reloading and retrying on a concurrency
    /// conflict up to `attempts` times in total.
    ///
    /// Business rejections and storage failures are never retried.
    ///
    /// # Errors
    /// Same as [`handle`](Self::handle); the last conflict if every attempt lost.
    pub fn handle_with_retry(
        &self,
        command: &A::Command,
        attempts: usize,
    ) -> Result<Vec<RecordedEvent<A::Event>>, CommandError<A::Error>> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.handle(command) {
                Err(err) if err.is_conflict() && attempt < attempts => {
                    debug!(
                        aggregate_id = command.aggregate_id(),
                        attempt,
                        "concurrency conflict, retrying command"
                    );
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Get the event store.
    pub fn store(&self) -> &Arc<EventStore<A::Event, L>> {
        &self.store
    }
}

impl<A, L> fmt::Debug for CommandHandler<A, L>
where
    A: Aggregate,
    L: EventLog<A::Event>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandHandler")
            .field("scope", &A::SCOPE)
            .field("store", &self.store)
            .field("invalidators", &self.invalidators.len())
            .finish()
    }
}

type ProjectionEvent<Q> = <<Q as Query>::Projection as Projection>::Event;

/// Read side: answers queries from projections, through the cache.
pub struct QueryHandler<Q, L>
where
    Q: Query,
    L: EventLog<ProjectionEvent<Q>>,
{
    store: Arc<EventStore<ProjectionEvent<Q>, L>>,
    cache: ResponseCache<Q::Output>,
}

impl<Q, L> QueryHandler<Q, L>
where
    Q: Query,
    L: EventLog<ProjectionEvent<Q>>,
{
    /// Create a handler reading from `store` and memoizing into `cache`.
    ///
    /// Register a clone of the same cache with the command handlers of the
    /// aggregates this query reads, or answers go stale until their TTL.
    pub fn new(store: Arc<EventStore<ProjectionEvent<Q>, L>>, cache: ResponseCache<Q::Output>) -> Self {
        Self { store, cache }
    }

    /// Answer a query, from the cache while the answer is fresh.
    ///
    /// Never appends events. A `NotFound` answer is not cached.
    ///
    /// # Errors
    /// - `QueryError::NotFound` if the aggregate has no events
    /// - `QueryError::Store` if the events cannot be read
    pub fn handle(&self, query: &Q) -> Result<Q::Output, QueryError> {
        let key = query.cache_key();

        self.cache.get_or_compute(key.as_str(), query.ttl(), || {
            let aggregate_id = query.aggregate_id();
            let events = self.store.read_all(aggregate_id)?;
            if events.is_empty() {
                return Err(QueryError::NotFound(aggregate_id.to_string()));
            }

            let view = Q::Projection::rebuild(&events);
            trace!(aggregate_id, key = %key, events = events.len(), "projection rebuilt");
            Ok(query.project(&view))
        })
    }

    /// Get the cache this handler reads through.
    pub fn cache(&self) -> &ResponseCache<Q::Output> {
        &self.cache
    }
}

impl<Q, L> fmt::Debug for QueryHandler<Q, L>
where
    Q: Query,
    L: EventLog<ProjectionEvent<Q>>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryHandler")
            .field("store", &self.store)
            .field("cache", &self.cache)
            .finish()
    }
}
