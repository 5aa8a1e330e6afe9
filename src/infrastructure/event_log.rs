//! In-memory event log.
//!
//! Keeps one vector per aggregate in sharded storage. A batch is appended
//! under the aggregate's shard lock, so readers see all of it or none of it.
//! A batch that does not continue the stream exactly is refused, which keeps
//! sequences unique when several stores share one log.

use crate::application::event_store::EventStoreError;
use crate::application::ports::{EventLog, Storage};
use crate::domain::event::{DomainEvent, RecordedEvent};
use crate::infrastructure::storage::ShardedStorage;
use std::sync::Arc;

/// Event log that lives and dies with the process.
#[derive(Debug)]
pub struct InMemoryEventLog<E>
where
    E: DomainEvent,
{
    streams: ShardedStorage<String, Vec<RecordedEvent<E>>>,
}

impl<E> InMemoryEventLog<E>
where
    E: DomainEvent,
{
    /// Create an empty log.
    pub fn new() -> Self {
        Self {
            streams: ShardedStorage::new(),
        }
    }

    /// Number of aggregates with at least one event.
    pub fn aggregate_count(&self) -> usize {
        self.streams.len()
    }

    /// Total number of stored events.
    pub fn event_count(&self) -> usize {
        let mut total = 0;
        self.streams.for_each(|_, stream| total += stream.len());
        total
    }
}

/// Refuse a batch whose first event is not the one right after `head`.
pub(crate) fn ensure_continues<E>(first: &RecordedEvent<E>, head: u64) -> Result<(), EventStoreError> {
    if first.sequence == head + 1 {
        return Ok(());
    }
    Err(EventStoreError::ConcurrencyConflict {
        aggregate_id: first.aggregate_id.clone(),
        expected: first.sequence.saturating_sub(1),
        actual: head,
    })
}

impl<E> Default for InMemoryEventLog<E>
where
    E: DomainEvent,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventLog<E> for InMemoryEventLog<E>
where
    E: DomainEvent,
{
    fn append(&self, events: &[RecordedEvent<E>]) -> Result<(), EventStoreError> {
        let Some(first) = events.first() else {
            return Ok(());
        };

        let extend = |stream: &mut Vec<RecordedEvent<E>>| -> Result<(), EventStoreError> {
            ensure_continues(first, stream.len() as u64)?;
            stream.extend_from_slice(events);
            Ok(())
        };

        // Only a batch starting a stream may create it
        if first.sequence == 1 {
            self.streams
                .with_entry_mut(first.aggregate_id.clone(), Vec::new, extend)
        } else {
            self.streams
                .with_existing_mut(&first.aggregate_id, extend)
                .unwrap_or_else(|| ensure_continues(first, 0))
        }
    }

    fn read(
        &self,
        aggregate_id: &str,
        from_sequence: u64,
    ) -> Result<Vec<RecordedEvent<E>>, EventStoreError> {
        // Sequences start at 1 and have no gaps, so the index is sequence - 1
        let skip = from_sequence.saturating_sub(1) as usize;
        Ok(self
            .streams
            .with_existing_mut(&aggregate_id.to_string(), |stream| {
                stream.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default())
    }

    fn head(&self, aggregate_id: &str) -> Result<u64, EventStoreError> {
        Ok(self
            .streams
            .with_existing_mut(&aggregate_id.to_string(), |stream| {
                stream.last().map_or(0, |event| event.sequence)
            })
            .unwrap_or(0))
    }
}

// Lets several stores share one log; the log itself keeps their sequences apart
impl<E, L> EventLog<E> for Arc<L>
where
    L: EventLog<E>,
{
    fn append(&self, events: &[RecordedEvent<E>]) -> Result<(), EventStoreError> {
        (**self).append(events)
    }

    fn read(
        &self,
        aggregate_id: &str,
        from_sequence: u64,
    ) -> Result<Vec<RecordedEvent<E>>, EventStoreError> {
        (**self).read(aggregate_id, from_sequence)
    }

    fn head(&self, aggregate_id: &str) -> Result<u64, EventStoreError> {
        (**self).head(aggregate_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    #[derive(Debug, Clone, PartialEq)]
    struct Noted(&'static str);

    impl DomainEvent for Noted {
        fn event_type(&self) -> &'static str {
            "Noted"
        }
    }

    fn batch(aggregate_id: &str, first: u64, notes: &[&'static str]) -> Vec<RecordedEvent<Noted>> {
        notes
            .iter()
            .zip(first..)
            .map(|(note, seq)| RecordedEvent::new(aggregate_id, seq, Noted(*note), SystemTime::now()))
            .collect()
    }

    #[test]
    fn test_append_and_read() {
        let log = InMemoryEventLog::new();
        log.append(&batch("a", 1, &["x", "y"])).unwrap();
        log.append(&batch("a", 3, &["z"])).unwrap();

        let events = log.read("a", 1).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].payload, Noted("z"));
        assert_eq!(log.head("a").unwrap(), 3);
    }

    #[test]
    fn test_read_from_offset() {
        let log = InMemoryEventLog::new();
        log.append(&batch("a", 1, &["x", "y", "z"])).unwrap();

        let tail = log.read("a", 2).unwrap();
        assert_eq!(tail.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![2, 3]);
        assert!(log.read("a", 4).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_aggregate() {
        let log: InMemoryEventLog<Noted> = InMemoryEventLog::new();
        assert!(log.read("missing", 1).unwrap().is_empty());
        assert_eq!(log.head("missing").unwrap(), 0);
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let log: InMemoryEventLog<Noted> = InMemoryEventLog::new();
        log.append(&[]).unwrap();
        assert_eq!(log.aggregate_count(), 0);
    }

    #[test]
    fn test_refuses_batch_that_does_not_continue_stream() {
        let log = InMemoryEventLog::new();
        log.append(&batch("a", 1, &["x", "y"])).unwrap();

        // A writer that still believes the head is 1
        let err = log.append(&batch("a", 2, &["stale"])).unwrap_err();
        assert_eq!(
            err,
            EventStoreError::ConcurrencyConflict {
                aggregate_id: "a".to_string(),
                expected: 1,
                actual: 2,
            }
        );
        assert!(log.append(&batch("a", 5, &["gap"])).unwrap_err().is_conflict());
        assert_eq!(log.event_count(), 2);
        assert_eq!(log.head("a").unwrap(), 2);
    }

    #[test]
    fn test_refused_batch_creates_no_stream() {
        let log = InMemoryEventLog::new();
        assert!(log.append(&batch("b", 3, &["orphan"])).unwrap_err().is_conflict());
        assert_eq!(log.aggregate_count(), 0);
    }

    #[test]
    fn test_counts() {
        let log = InMemoryEventLog::new();
        log.append(&batch("a", 1, &["x", "y"])).unwrap();
        log.append(&batch("b", 1, &["z"])).unwrap();

        assert_eq!(log.aggregate_count(), 2);
        assert_eq!(log.event_count(), 3);
    }
}
