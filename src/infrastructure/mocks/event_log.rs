//! Event log that fails on demand.

use crate::application::event_store::EventStoreError;
use crate::application::ports::EventLog;
use crate::domain::event::{DomainEvent, RecordedEvent};
use crate::infrastructure::event_log::InMemoryEventLog;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// In-memory log whose next appends can be made to fail.
///
/// Clones share the same streams and failure budget.
#[derive(Debug, Clone)]
pub struct FlakyEventLog<E>
where
    E: DomainEvent,
{
    inner: Arc<InMemoryEventLog<E>>,
    failures_left: Arc<AtomicUsize>,
    appends_attempted: Arc<AtomicUsize>,
}

impl<E> FlakyEventLog<E>
where
    E: DomainEvent,
{
    /// Create a log that succeeds until told otherwise.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(InMemoryEventLog::new()),
            failures_left: Arc::new(AtomicUsize::new(0)),
            appends_attempted: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make the next `count` appends fail with `Unavailable`.
    pub fn fail_next_appends(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Number of append calls received, failed ones included.
    pub fn appends_attempted(&self) -> usize {
        self.appends_attempted.load(Ordering::SeqCst)
    }
}

impl<E> Default for FlakyEventLog<E>
where
    E: DomainEvent,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventLog<E> for FlakyEventLog<E>
where
    E: DomainEvent,
{
    fn append(&self, events: &[RecordedEvent<E>]) -> Result<(), EventStoreError> {
        self.appends_attempted.fetch_add(1, Ordering::SeqCst);

        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(EventStoreError::Unavailable("injected failure".to_string()));
        }

        self.inner.append(events)
    }

    fn read(
        &self,
        aggregate_id: &str,
        from_sequence: u64,
    ) -> Result<Vec<RecordedEvent<E>>, EventStoreError> {
        self.inner.read(aggregate_id, from_sequence)
    }

    fn head(&self, aggregate_id: &str) -> Result<u64, EventStoreError> {
        self.inner.head(aggregate_id)
    }
}
