//! Append-only JSON-lines event log.
//!
//! Every recorded event is written as one JSON object per line. On open the
//! file is replayed into an in-memory index that serves all reads; appends
//! go to the file first and reach the index only once the write succeeded.
//!
//! A trailing line without its newline is a write that never completed. It is
//! dropped with a warning and the file is truncated back to the last complete
//! record. A complete line that fails to parse is corruption and fails `open`.
//!
//! A batch whose write, flush or sync fails is cut off again before the error
//! is returned, so the file never holds records the index does not. If that
//! truncation fails too, the log refuses every further append until reopened.

use crate::application::event_store::EventStoreError;
use crate::application::ports::EventLog;
use crate::domain::event::{DomainEvent, RecordedEvent};
use crate::infrastructure::event_log::{ensure_continues, InMemoryEventLog};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, warn};

/// Durable event log backed by a single file.
#[derive(Debug)]
pub struct FileEventLog<E>
where
    E: DomainEvent,
{
    path: PathBuf,
    writer: Mutex<Writer>,
    index: InMemoryEventLog<E>,
    sync_on_append: bool,
}

/// The file handle plus what is known about its tail.
#[derive(Debug)]
struct Writer {
    file: File,
    /// A failed batch could not be cut off; the tail no longer matches the index
    poisoned: bool,
    #[cfg(test)]
    fault: Option<WriteFault>,
}

impl Writer {
    fn new(file: File) -> Self {
        Self {
            file,
            poisoned: false,
            #[cfg(test)]
            fault: None,
        }
    }

    fn write_batch(&mut self, bytes: &[u8], sync: bool) -> io::Result<()> {
        #[cfg(test)]
        {
            if let Some(fault) = self.fault {
                return fault.inject(&mut self.file, bytes);
            }
        }

        // One write per batch keeps its lines contiguous in the file
        self.file.write_all(bytes)?;
        self.file.flush()?;
        if sync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        #[cfg(test)]
        {
            if let Some(WriteFault::Unrecoverable) = self.fault.take() {
                return Err(io::Error::other("truncate refused"));
            }
        }

        self.file.set_len(len)
    }
}

/// Failure injected into the next append.
#[cfg(test)]
#[derive(Debug, Clone, Copy)]
enum WriteFault {
    /// Only the first bytes reach the file
    Torn(usize),
    /// The whole batch is written but never confirmed durable
    SyncFails,
    /// Like `SyncFails`, and the file cannot be cut back either
    Unrecoverable,
}

#[cfg(test)]
impl WriteFault {
    fn inject(self, file: &mut File, bytes: &[u8]) -> io::Result<()> {
        match self {
            WriteFault::Torn(len) => {
                file.write_all(&bytes[..len.min(bytes.len())])?;
                Err(io::Error::other("short write"))
            }
            WriteFault::SyncFails | WriteFault::Unrecoverable => {
                file.write_all(bytes)?;
                file.flush()?;
                Err(io::Error::other("sync failed"))
            }
        }
    }
}

impl<E> FileEventLog<E>
where
    E: DomainEvent + Serialize + DeserializeOwned,
{
    /// Open or create the log at `path` and replay its contents.
    ///
    /// # Errors
    /// - `EventStoreError::Unavailable` if the file cannot be opened or read
    /// - `EventStoreError::Serialization` if a complete record is corrupt or out of order
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EventStoreError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| unavailable(&path, &err))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|err| unavailable(&path, &err))?;

        let index = InMemoryEventLog::new();
        let replay = replay_into(&file, &index, &path)?;

        if let Some(torn_bytes) = replay.torn_bytes {
            warn!(
                path = %path.display(),
                offset = replay.valid_len,
                torn_bytes,
                "dropping incomplete trailing record"
            );
            file.set_len(replay.valid_len)
                .map_err(|err| unavailable(&path, &err))?;
        }

        debug!(
            path = %path.display(),
            events = replay.events,
            aggregates = index.aggregate_count(),
            "event log replayed"
        );

        Ok(Self {
            path,
            writer: Mutex::new(Writer::new(file)),
            index,
            sync_on_append: false,
        })
    }

    /// Flush every append to stable storage before acknowledging it.
    pub fn sync_on_append(mut self, enabled: bool) -> Self {
        self.sync_on_append = enabled;
        self
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

struct Replay {
    events: usize,
    valid_len: u64,
    torn_bytes: Option<u64>,
}

fn replay_into<E>(
    file: &File,
    index: &InMemoryEventLog<E>,
    path: &Path,
) -> Result<Replay, EventStoreError>
where
    E: DomainEvent + DeserializeOwned,
{
    let mut reader = BufReader::new(file);
    let mut line = String::new();
    let mut replay = Replay {
        events: 0,
        valid_len: 0,
        torn_bytes: None,
    };
    let mut line_number = 0usize;

    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .map_err(|err| unavailable(path, &err))?;
        if read == 0 {
            break;
        }
        line_number += 1;

        if !line.ends_with('\n') {
            replay.torn_bytes = Some(read as u64);
            break;
        }

        let record = line.trim_end();
        if !record.is_empty() {
            let event: RecordedEvent<E> = serde_json::from_str(record).map_err(|err| {
                EventStoreError::Serialization(format!(
                    "{} line {}: {}",
                    path.display(),
                    line_number,
                    err
                ))
            })?;

            let expected = index.head(&event.aggregate_id)? + 1;
            if event.sequence != expected {
                return Err(EventStoreError::Serialization(format!(
                    "{} line {}: sequence {} for '{}', expected {}",
                    path.display(),
                    line_number,
                    event.sequence,
                    event.aggregate_id,
                    expected
                )));
            }

            index.append(std::slice::from_ref(&event))?;
            replay.events += 1;
        }

        replay.valid_len += read as u64;
    }

    Ok(replay)
}

fn unavailable(path: &Path, err: &io::Error) -> EventStoreError {
    EventStoreError::Unavailable(format!("{}: {}", path.display(), err))
}

impl<E> EventLog<E> for FileEventLog<E>
where
    E: DomainEvent + Serialize + DeserializeOwned,
{
    fn append(&self, events: &[RecordedEvent<E>]) -> Result<(), EventStoreError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut buffer = String::new();
        for event in events {
            let line = serde_json::to_string(event)
                .map_err(|err| EventStoreError::Serialization(err.to_string()))?;
            buffer.push_str(&line);
            buffer.push('\n');
        }

        let mut writer = self.writer.lock().map_err(|_| {
            EventStoreError::Unavailable(format!("{}: writer poisoned", self.path.display()))
        })?;
        if writer.poisoned {
            return Err(EventStoreError::Unavailable(format!(
                "{}: unrecovered write failure, reopen the log",
                self.path.display()
            )));
        }

        // Checked under the writer lock, so stores sharing this log cannot interleave
        if let Some(first) = events.first() {
            ensure_continues(first, self.index.head(&first.aggregate_id)?)?;
        }

        let len = writer
            .file
            .metadata()
            .map_err(|err| unavailable(&self.path, &err))?
            .len();

        if let Err(err) = writer.write_batch(buffer.as_bytes(), self.sync_on_append) {
            match writer.truncate(len) {
                Ok(()) => warn!(
                    path = %self.path.display(),
                    offset = len,
                    error = %err,
                    "append failed, batch cut off"
                ),
                Err(truncate_err) => {
                    writer.poisoned = true;
                    error!(
                        path = %self.path.display(),
                        offset = len,
                        error = %err,
                        truncate_error = %truncate_err,
                        "append failed and could not be cut off, refusing further appends"
                    );
                }
            }
            return Err(unavailable(&self.path, &err));
        }

        self.index.append(events)
    }

    fn read(
        &self,
        aggregate_id: &str,
        from_sequence: u64,
    ) -> Result<Vec<RecordedEvent<E>>, EventStoreError> {
        self.index.read(aggregate_id, from_sequence)
    }

    fn head(&self, aggregate_id: &str) -> Result<u64, EventStoreError> {
        self.index.head(aggregate_id)
    }
}
