//! Ports (interfaces) for the application layer.
//!
//! In hexagonal architecture, ports define the interfaces that the application
//! layer needs. Infrastructure adapters implement these ports.

use crate::application::event_store::EventStoreError;
use crate::domain::event::RecordedEvent;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::{Instant, SystemTime};

/// Port for obtaining current time.
///
/// This abstraction allows the application layer to work with time
/// without depending on system clock implementation details.
/// Infrastructure provides concrete implementations (SystemClock, MockClock).
pub trait Clock: Send + Sync + Debug {
    /// Get the current monotonic instant.
    fn now(&self) -> Instant;

    /// Get the current wall-clock time, used to timestamp stored events.
    fn wall_clock(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Port for concurrent key-value storage.
///
/// This abstraction allows the application layer to store and retrieve values
/// without depending on specific concurrent data structure implementations.
/// Infrastructure provides concrete implementations (ShardedStorage).
///
/// Closures passed to these methods run while the entry is locked and must not
/// call back into the same storage.
pub trait Storage<K, V>: Send + Sync + Debug
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Send + Sync,
{
    /// Access an entry with mutable access, creating it if necessary.
    ///
    /// # Arguments
    /// * `key` - The key to look up
    /// * `factory` - Function to create a new value if the key doesn't exist
    /// * `accessor` - Function that gets mutable access to the value
    ///
    /// # Returns
    /// The result from the accessor function
    fn with_entry_mut<F, R>(&self, key: K, factory: impl FnOnce() -> V, accessor: F) -> R
    where
        F: FnOnce(&mut V) -> R;

    /// Access an existing entry with mutable access.
    ///
    /// Returns `None` without calling `accessor` if the key is absent.
    fn with_existing_mut<F, R>(&self, key: &K, accessor: F) -> Option<R>
    where
        F: FnOnce(&mut V) -> R;

    /// Insert a value, returning the one it replaced.
    fn insert(&self, key: K, value: V) -> Option<V>;

    /// Remove a key and return its value.
    fn remove(&self, key: &K) -> Option<V>;

    /// Remove a key only if the predicate holds for its current value.
    fn remove_if<F>(&self, key: &K, predicate: F) -> Option<V>
    where
        F: FnOnce(&V) -> bool;

    /// Get the number of entries in the storage.
    fn len(&self) -> usize;

    /// Check if the storage is empty.
    fn is_empty(&self) -> bool;

    /// Clear all entries from the storage.
    fn clear(&self);

    /// Iterate over all entries, providing access to both key and value.
    fn for_each<F>(&self, f: F)
    where
        F: FnMut(&K, &V);

    /// Remove entries for which the predicate returns false.
    fn retain<F>(&self, f: F)
    where
        F: FnMut(&K, &mut V) -> bool;
}

/// Port for the durable medium behind the event store.
///
/// Sequence assignment and optimistic concurrency live in `EventStore`.
/// Implementations persist what they are given, but must refuse a batch whose
/// first sequence is not the stream's head plus one, since several stores may
/// share one log.
pub trait EventLog<E>: Send + Sync + Debug {
    /// Persist a batch of events for one aggregate, all or nothing.
    ///
    /// # Errors
    /// - `EventStoreError::ConcurrencyConflict` if the batch does not continue the stream
    /// - `EventStoreError::Unavailable` if the medium cannot be written
    fn append(&self, events: &[RecordedEvent<E>]) -> Result<(), EventStoreError>;

    /// Read an aggregate's events with `sequence >= from_sequence`, oldest first.
    fn read(
        &self,
        aggregate_id: &str,
        from_sequence: u64,
    ) -> Result<Vec<RecordedEvent<E>>, EventStoreError>;

    /// Highest stored sequence for an aggregate, or 0 if it has no events.
    fn head(&self, aggregate_id: &str) -> Result<u64, EventStoreError>;
}

/// Port the command side uses to drop stale read-side entries.
///
/// Implemented by `ResponseCache` for every value type, so one command handler
/// can invalidate caches of differently-typed read models.
pub trait CacheInvalidator: Send + Sync + Debug {
    /// Drop a single key. Returns whether it was present.
    fn invalidate(&self, key: &str) -> bool;

    /// Drop every key starting with `prefix`. Returns how many were dropped.
    fn invalidate_prefix(&self, prefix: &str) -> usize;
}

/// Port for state that can shed dead entries in the background.
pub trait Sweep: Send + Sync + Debug {
    /// Short label used in logs.
    fn name(&self) -> &'static str;

    /// Remove entries that no longer affect any decision. Returns how many were removed.
    fn sweep(&self) -> usize;
}
