//! Append-only, versioned event store.
//!
//! Each aggregate owns an independent stream whose sequence numbers start at
//! 1 and grow by one per event, with no gaps and no duplicates. Sequence
//! assignment is serialized per aggregate by a small mutex around the
//! aggregate's head; appends to different aggregates never wait on each other.
//!
//! The head only advances after the [`EventLog`] accepted the write, so a
//! failed write leaves the stream exactly as it was. Several stores may share
//! one log: the log refuses a batch that does not start right after its own
//! head, and the losing store reloads its head and tries again.

use crate::application::metrics::Metrics;
use crate::application::ports::{Clock, EventLog, Storage};
use crate::domain::event::{DomainEvent, RecordedEvent};
use crate::infrastructure::event_log::InMemoryEventLog;
use crate::infrastructure::storage::ShardedStorage;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Errors returned by the event store and its logs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventStoreError {
    /// The stream moved past the version the caller based its decision on
    #[error(
        "concurrency conflict on '{aggregate_id}': expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        aggregate_id: String,
        expected: u64,
        actual: u64,
    },

    /// The durable medium could not be read or written
    #[error("event log unavailable: {0}")]
    Unavailable(String),

    /// An event could not be encoded or decoded
    #[error("event serialization failed: {0}")]
    Serialization(String),
}

impl EventStoreError {
    /// Check whether reloading and retrying can resolve the error.
    pub fn is_conflict(&self) -> bool {
        matches!(self, EventStoreError::ConcurrencyConflict { .. })
    }
}

/// Cached head of one aggregate's stream; `None` until read from the log.
type Head = Arc<Mutex<Option<u64>>>;

/// Append-only store of domain events, keyed by aggregate.
pub struct EventStore<E, L = InMemoryEventLog<E>>
where
    E: DomainEvent,
    L: EventLog<E>,
{
    log: L,
    heads: ShardedStorage<String, Head>,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
    _event: PhantomData<fn() -> E>,
}

impl<E> EventStore<E>
where
    E: DomainEvent,
{
    /// Create a store that keeps every stream in memory.
    pub fn in_memory(clock: Arc<dyn Clock>, metrics: Metrics) -> Self {
        Self::new(InMemoryEventLog::new(), clock, metrics)
    }
}

impl<E, L> EventStore<E, L>
where
    E: DomainEvent,
    L: EventLog<E>,
{
    /// Create a store over `log`.
    ///
    /// Streams already present in the log continue from their last sequence.
    pub fn new(log: L, clock: Arc<dyn Clock>, metrics: Metrics) -> Self {
        Self {
            log,
            heads: ShardedStorage::new(),
            clock,
            metrics,
            _event: PhantomData,
        }
    }

    /// Append one event unconditionally and return its sequence number.
    ///
    /// # Errors
    /// Returns `EventStoreError::Unavailable` if the log rejects the write.
    pub fn append(&self, aggregate_id: &str, event: E) -> Result<u64, EventStoreError> {
        let recorded = self.append_batch(aggregate_id, None, vec![event])?;
        Ok(recorded.last().map_or(0, |event| event.sequence))
    }

    /// Append one event if the stream is still at `expected_version`.
    ///
    /// # Errors
    /// Returns `EventStoreError::ConcurrencyConflict` if another writer got there first.
    pub fn append_expected(
        &self,
        aggregate_id: &str,
        expected_version: u64,
        event: E,
    ) -> Result<u64, EventStoreError> {
        let recorded = self.append_batch(aggregate_id, Some(expected_version), vec![event])?;
        Ok(recorded.last().map_or(expected_version, |event| event.sequence))
    }

    /// Append events with consecutive sequence numbers, all or nothing.
    ///
    /// With `Some(expected_version)`, the batch is refused unless the stream's
    /// current version equals it. An empty batch writes nothing but still
    /// checks the version.
    ///
    /// # Errors
    /// - `EventStoreError::ConcurrencyConflict` on a stale expected version
    /// - `EventStoreError::Unavailable` or `Serialization` if the log rejects the write
    pub fn append_batch(
        &self,
        aggregate_id: &str,
        expected_version: Option<u64>,
        events: Vec<E>,
    ) -> Result<Vec<RecordedEvent<E>>, EventStoreError> {
        let head = self.head_of(aggregate_id);
        // Never panics on poison: the head only changes after a successful write
        let mut guard = head.lock().unwrap_or_else(PoisonError::into_inner);

        // A cached head can fall behind when other stores write to the same log
        let mut fresh = false;
        loop {
            let current = match *guard {
                Some(version) => version,
                None => {
                    let version = self.log.head(aggregate_id)?;
                    *guard = Some(version);
                    fresh = true;
                    version
                }
            };

            if let Some(expected) = expected_version {
                if expected != current {
                    if !fresh {
                        *guard = None;
                        continue;
                    }
                    self.metrics.record_conflict();
                    warn!(
                        aggregate_id,
                        expected,
                        actual = current,
                        "append rejected: concurrency conflict"
                    );
                    return Err(EventStoreError::ConcurrencyConflict {
                        aggregate_id: aggregate_id.to_string(),
                        expected,
                        actual: current,
                    });
                }
            }

            if events.is_empty() {
                return Ok(Vec::new());
            }

            let timestamp = self.clock.wall_clock();
            let recorded: Vec<RecordedEvent<E>> = events
                .iter()
                .cloned()
                .zip(current + 1..)
                .map(|(event, sequence)| RecordedEvent::new(aggregate_id, sequence, event, timestamp))
                .collect();

            match self.log.append(&recorded) {
                Ok(()) => {}
                Err(err) if err.is_conflict() => {
                    debug!(aggregate_id, stale_head = current, "log moved past cached head, reloading");
                    *guard = None;
                    continue;
                }
                Err(err) => return Err(err),
            }

            let new_head = current + recorded.len() as u64;
            *guard = Some(new_head);
            drop(guard);

            self.metrics.record_appended(recorded.len());
            debug!(
                aggregate_id,
                first_sequence = current + 1,
                last_sequence = new_head,
                "events appended"
            );

            return Ok(recorded);
        }
    }

    /// Read an aggregate's whole stream, oldest first.
    ///
    /// An unknown aggregate has an empty stream.
    pub fn read_all(&self, aggregate_id: &str) -> Result<Vec<RecordedEvent<E>>, EventStoreError> {
        self.log.read(aggregate_id, 1)
    }

    /// Read events with `sequence >= from_sequence`, oldest first.
    pub fn read_from(
        &self,
        aggregate_id: &str,
        from_sequence: u64,
    ) -> Result<Vec<RecordedEvent<E>>, EventStoreError> {
        self.log.read(aggregate_id, from_sequence.max(1))
    }

    /// Current version of a stream: the sequence of its last event, or 0.
    ///
    /// Always asks the log, so writes made through other stores are visible.
    pub fn version(&self, aggregate_id: &str) -> Result<u64, EventStoreError> {
        self.log.head(aggregate_id)
    }

    /// Get the underlying log.
    pub fn log(&self) -> &L {
        &self.log
    }

    /// Get a reference to the metrics.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    fn head_of(&self, aggregate_id: &str) -> Head {
        // Clone the handle out so the shard lock is released before the head is locked
        self.heads.with_entry_mut(
            aggregate_id.to_string(),
            || Arc::new(Mutex::new(None)),
            |head| Arc::clone(head),
        )
    }
}

impl<E, L> fmt::Debug for EventStore<E, L>
where
    E: DomainEvent,
    L: EventLog<E>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStore")
            .field("log", &self.log)
            .field("tracked_aggregates", &self.heads.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mocks::{FlakyEventLog, MockClock};
    use serde::{Deserialize, Serialize};
    use std::collections::HashSet;
    use std::thread;
    use std::time::{Duration, Instant, SystemTime};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    enum Ledger {
        Credited(u64),
        Debited(u64),
    }

    impl DomainEvent for Ledger {
        fn event_type(&self) -> &'static str {
            match self {
                Ledger::Credited(_) => "Credited",
                Ledger::Debited(_) => "Debited",
            }
        }
    }

    fn store() -> (EventStore<Ledger>, MockClock) {
        let clock = MockClock::new(Instant::now());
        let store = EventStore::in_memory(Arc::new(clock.clone()), Metrics::new());
        (store, clock)
    }

    #[test]
    fn test_sequential_appends_are_numbered_from_one() {
        let (store, _clock) = store();

        for expected in 1..=5 {
            assert_eq!(store.append("acc-1", Ledger::Credited(expected)).unwrap(), expected);
        }

        let sequences: Vec<u64> = store
            .read_all("acc-1")
            .unwrap()
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
        assert_eq!(store.version("acc-1").unwrap(), 5);
    }

    #[test]
    fn test_unknown_aggregate_is_empty() {
        let (store, _clock) = store();
        assert!(store.read_all("nobody").unwrap().is_empty());
        assert_eq!(store.version("nobody").unwrap(), 0);
    }

    #[test]
    fn test_recorded_metadata() {
        let stamp = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let clock = MockClock::with_wall_clock(Instant::now(), stamp);
        let store = EventStore::in_memory(Arc::new(clock), Metrics::new());

        store.append("acc-1", Ledger::Debited(3)).unwrap();

        let event = &store.read_all("acc-1").unwrap()[0];
        assert_eq!(event.aggregate_id, "acc-1");
        assert_eq!(event.event_type, "Debited");
        assert_eq!(event.payload, Ledger::Debited(3));
        assert_eq!(event.timestamp, stamp);
    }

    #[test]
    fn test_stale_expected_version_conflicts() {
        let (store, _clock) = store();
        store.append("acc-1", Ledger::Credited(1)).unwrap();
        store.append("acc-1", Ledger::Credited(2)).unwrap();

        let err = store
            .append_expected("acc-1", 1, Ledger::Debited(1))
            .unwrap_err();
        assert_eq!(
            err,
            EventStoreError::ConcurrencyConflict {
                aggregate_id: "acc-1".to_string(),
                expected: 1,
                actual: 2,
            }
        );
        assert!(err.is_conflict());
        assert_eq!(store.version("acc-1").unwrap(), 2);
        assert_eq!(store.metrics().concurrency_conflicts(), 1);

        assert_eq!(store.append_expected("acc-1", 2, Ledger::Debited(1)).unwrap(), 3);
    }

    #[test]
    fn test_expected_version_zero_creates_stream_once() {
        let (store, _clock) = store();
        assert_eq!(store.append_expected("acc-1", 0, Ledger::Credited(1)).unwrap(), 1);
        assert!(store
            .append_expected("acc-1", 0, Ledger::Credited(1))
            .unwrap_err()
            .is_conflict());
    }

    #[test]
    fn test_batch_gets_consecutive_sequences() {
        let (store, _clock) = store();
        store.append("acc-1", Ledger::Credited(10)).unwrap();

        let recorded = store
            .append_batch(
                "acc-1",
                Some(1),
                vec![Ledger::Debited(1), Ledger::Debited(2), Ledger::Debited(3)],
            )
            .unwrap();

        let sequences: Vec<u64> = recorded.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![2, 3, 4]);
        assert_eq!(store.metrics().events_appended(), 4);
    }

    #[test]
    fn test_empty_batch_checks_version_only() {
        let (store, _clock) = store();
        store.append("acc-1", Ledger::Credited(1)).unwrap();

        assert!(store.append_batch("acc-1", Some(1), vec![]).unwrap().is_empty());
        assert!(store.append_batch("acc-1", Some(0), vec![]).is_err());
        assert_eq!(store.version("acc-1").unwrap(), 1);
    }

    #[test]
    fn test_read_from() {
        let (store, _clock) = store();
        for n in 1..=4 {
            store.append("acc-1", Ledger::Credited(n)).unwrap();
        }

        let tail = store.read_from("acc-1", 3).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].sequence, 3);
        assert_eq!(store.read_from("acc-1", 0).unwrap().len(), 4);
        assert!(store.read_from("acc-1", 9).unwrap().is_empty());
    }

    #[test]
    fn test_failed_write_leaves_no_gap() {
        let clock = MockClock::new(Instant::now());
        let log = FlakyEventLog::new();
        let store = EventStore::new(log.clone(), Arc::new(clock), Metrics::new());

        store.append("acc-1", Ledger::Credited(1)).unwrap();

        log.fail_next_appends(1);
        let err = store.append("acc-1", Ledger::Credited(2)).unwrap_err();
        assert!(matches!(err, EventStoreError::Unavailable(_)));
        assert_eq!(store.version("acc-1").unwrap(), 1);

        assert_eq!(store.append("acc-1", Ledger::Credited(2)).unwrap(), 2);
        let sequences: Vec<u64> = store
            .read_all("acc-1")
            .unwrap()
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[test]
    fn test_resumes_from_existing_log() {
        let clock = Arc::new(MockClock::new(Instant::now()));
        let log = Arc::new(InMemoryEventLog::new());

        let first = EventStore::new(Arc::clone(&log), clock.clone(), Metrics::new());
        first.append("acc-1", Ledger::Credited(1)).unwrap();
        first.append("acc-1", Ledger::Credited(2)).unwrap();

        let second: EventStore<Ledger, _> = EventStore::new(log, clock, Metrics::new());
        assert_eq!(second.version("acc-1").unwrap(), 2);
        assert_eq!(second.append("acc-1", Ledger::Credited(3)).unwrap(), 3);
    }

    #[test]
    fn test_stores_sharing_a_log_never_duplicate() {
        let clock = Arc::new(MockClock::new(Instant::now()));
        let log = Arc::new(InMemoryEventLog::new());
        let a = EventStore::new(Arc::clone(&log), clock.clone(), Metrics::new());
        let b = EventStore::new(Arc::clone(&log), clock, Metrics::new());

        assert_eq!(a.append("acc-1", Ledger::Credited(1)).unwrap(), 1);
        assert_eq!(b.append("acc-1", Ledger::Credited(2)).unwrap(), 2);
        // `a` still caches head 1 and must reload it
        assert_eq!(a.append("acc-1", Ledger::Credited(3)).unwrap(), 3);

        let stored: Vec<u64> = log.read("acc-1", 1).unwrap().iter().map(|e| e.sequence).collect();
        assert_eq!(stored, vec![1, 2, 3]);
        assert_eq!(a.version("acc-1").unwrap(), 3);
        assert_eq!(a.metrics().concurrency_conflicts(), 0);
    }

    #[test]
    fn test_expected_version_sees_writes_from_other_stores() {
        let clock = Arc::new(MockClock::new(Instant::now()));
        let log = Arc::new(InMemoryEventLog::new());
        let a = EventStore::new(Arc::clone(&log), clock.clone(), Metrics::new());
        let b = EventStore::new(Arc::clone(&log), clock, Metrics::new());

        a.append("acc-1", Ledger::Credited(1)).unwrap();
        b.append("acc-1", Ledger::Credited(2)).unwrap();

        let err = a.append_expected("acc-1", 1, Ledger::Debited(1)).unwrap_err();
        assert_eq!(
            err,
            EventStoreError::ConcurrencyConflict {
                aggregate_id: "acc-1".to_string(),
                expected: 1,
                actual: 2,
            }
        );
        assert_eq!(a.append_expected("acc-1", 2, Ledger::Debited(1)).unwrap(), 3);
    }

    #[test]
    fn test_stores_sharing_a_log_under_contention() {
        let clock = Arc::new(MockClock::new(Instant::now()));
        let log = Arc::new(InMemoryEventLog::new());
        let mut handles = vec![];

        for t in 0..4 {
            let store = EventStore::new(Arc::clone(&log), clock.clone(), Metrics::new());
            handles.push(thread::spawn(move || {
                for n in 0..50 {
                    store.append("hot", Ledger::Credited(t * 100 + n)).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let stored: Vec<u64> = log.read("hot", 1).unwrap().iter().map(|e| e.sequence).collect();
        assert_eq!(stored, (1..=200).collect::<Vec<u64>>());
    }

    #[test]
    fn test_concurrent_appends_never_duplicate() {
        let (store, _clock) = store();
        let store = Arc::new(store);
        let mut handles = vec![];

        for t in 0..8 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                (0..50)
                    .map(|n| store.append("hot", Ledger::Credited(t * 100 + n)).unwrap())
                    .collect::<Vec<u64>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for sequence in handle.join().unwrap() {
                assert!(seen.insert(sequence), "duplicate sequence {}", sequence);
            }
        }
        assert_eq!(seen.len(), 400);
        assert_eq!(seen.iter().max(), Some(&400));

        let stored: Vec<u64> = store
            .read_all("hot")
            .unwrap()
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(stored, (1..=400).collect::<Vec<u64>>());
    }

    #[test]
    fn test_concurrent_expected_appends_admit_one_winner() {
        let (store, _clock) = store();
        let store = Arc::new(store);
        store.append("acc-1", Ledger::Credited(1)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.append_expected("acc-1", 1, Ledger::Debited(1)).is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(store.version("acc-1").unwrap(), 2);
    }

    #[test]
    fn test_aggregates_are_independent() {
        let (store, _clock) = store();
        store.append("a", Ledger::Credited(1)).unwrap();
        store.append("a", Ledger::Credited(1)).unwrap();

        assert_eq!(store.append("b", Ledger::Credited(1)).unwrap(), 1);
        assert_eq!(store.version("a").unwrap(), 2);
    }
}
