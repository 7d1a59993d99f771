//! The event log gateway: an append-only, per-thing event store with
//! snapshot support.
//!
//! Workers consume it through the [`EventLog`] trait. Appends are
//! conditioned on the writer's view of the current revision, which is the
//! safety net against a stale worker instance writing over a newer one.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::FailureKind;
use crate::event::StoredEvent;
use crate::thing::{Thing, ThingId};

/// A point-in-time snapshot of a thing's state.
///
/// `revision` records how many events have been folded into `thing`, so
/// recovery resumes with events after `revision`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// `None` if the thing was deleted at snapshot time.
    pub thing: Option<Thing>,
    pub revision: u64,
}

/// Error returned by a conditional append.
#[derive(Debug, thiserror::Error)]
pub enum AppendError {
    /// The log's head is not at the revision the writer expected.
    #[error("revision conflict: expected {expected}, log is at {actual}")]
    RevisionConflict { expected: u64, actual: u64 },

    /// The log could not be reached. Safe to retry.
    #[error("event log unavailable: {0}")]
    Unavailable(String),

    #[error("event log I/O error")]
    Io(#[from] io::Error),
}

impl AppendError {
    pub fn kind(&self) -> FailureKind {
        match self {
            AppendError::RevisionConflict { .. } => FailureKind::Conflict,
            AppendError::Unavailable(_) => FailureKind::Unavailable,
            AppendError::Io(_) => FailureKind::Internal,
        }
    }

    /// Conflicts are never retried by the writer: its state is stale.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppendError::Unavailable(_) | AppendError::Io(_))
    }
}

/// Error returned when reading from the log or writing a snapshot.
#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("event log unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt event stream for thing '{thing_id}': {message}")]
    Corrupt { thing_id: ThingId, message: String },

    #[error("event log I/O error")]
    Io(#[from] io::Error),
}

impl EventLogError {
    pub fn kind(&self) -> FailureKind {
        match self {
            EventLogError::Unavailable(_) => FailureKind::Unavailable,
            EventLogError::Corrupt { .. } | EventLogError::Io(_) => FailureKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EventLogError::Unavailable(_) | EventLogError::Io(_))
    }
}

/// Append-only per-thing event store.
#[async_trait]
pub trait EventLog: Send + Sync + 'static {
    /// The latest snapshot for `thing_id`, if one was saved.
    async fn load_snapshot(&self, thing_id: &ThingId) -> Result<Option<Snapshot>, EventLogError>;

    /// Events with a revision greater than `after_revision`, in append order.
    async fn load_events(
        &self,
        thing_id: &ThingId,
        after_revision: u64,
    ) -> Result<Vec<StoredEvent>, EventLogError>;

    /// Append `event` if the stream head is still at `expected_revision`.
    ///
    /// `event.revision` must be `expected_revision + 1`.
    ///
    /// # Errors
    ///
    /// [`AppendError::RevisionConflict`] if another writer already took the
    /// revision.
    async fn append(
        &self,
        thing_id: &ThingId,
        expected_revision: u64,
        event: &StoredEvent,
    ) -> Result<(), AppendError>;

    async fn save_snapshot(
        &self,
        thing_id: &ThingId,
        snapshot: &Snapshot,
    ) -> Result<(), EventLogError>;
}

#[derive(Debug, Default)]
struct MemoryStream {
    events: Vec<StoredEvent>,
    snapshot: Option<Snapshot>,
}

/// Process-local event log backed by a shared map.
///
/// Cheap to clone; clones share the same streams.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventLog {
    streams: Arc<Mutex<HashMap<ThingId, MemoryStream>>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events of `thing_id`, in append order.
    pub fn events(&self, thing_id: &ThingId) -> Vec<StoredEvent> {
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        streams
            .get(thing_id)
            .map(|s| s.events.clone())
            .unwrap_or_default()
    }

    /// Revision of the last event appended for `thing_id`.
    pub fn head(&self, thing_id: &ThingId) -> u64 {
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        streams
            .get(thing_id)
            .and_then(|s| s.events.last())
            .map_or(0, |e| e.revision)
    }

    pub fn snapshot(&self, thing_id: &ThingId) -> Option<Snapshot> {
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        streams.get(thing_id).and_then(|s| s.snapshot.clone())
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn load_snapshot(&self, thing_id: &ThingId) -> Result<Option<Snapshot>, EventLogError> {
        Ok(self.snapshot(thing_id))
    }

    async fn load_events(
        &self,
        thing_id: &ThingId,
        after_revision: u64,
    ) -> Result<Vec<StoredEvent>, EventLogError> {
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(streams
            .get(thing_id)
            .map(|s| {
                s.events
                    .iter()
                    .filter(|e| e.revision > after_revision)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn append(
        &self,
        thing_id: &ThingId,
        expected_revision: u64,
        event: &StoredEvent,
    ) -> Result<(), AppendError> {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        let stream = streams.entry(thing_id.clone()).or_default();
        let actual = stream.events.last().map_or(0, |e| e.revision);
        if actual != expected_revision || event.revision != expected_revision + 1 {
            return Err(AppendError::RevisionConflict {
                expected: expected_revision,
                actual,
            });
        }
        stream.events.push(event.clone());
        Ok(())
    }

    async fn save_snapshot(
        &self,
        thing_id: &ThingId,
        snapshot: &Snapshot,
    ) -> Result<(), EventLogError> {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        streams.entry(thing_id.clone()).or_default().snapshot = Some(snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_doubles {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    /// Wraps an [`InMemoryEventLog`] and fails the first `failures` appends
    /// with [`AppendError::Unavailable`], and the first `load_failures`
    /// event loads with [`EventLogError::Unavailable`].
    #[derive(Debug, Clone, Default)]
    pub(crate) struct FlakyEventLog {
        pub(crate) inner: InMemoryEventLog,
        failures: Arc<AtomicU32>,
        load_failures: Arc<AtomicU32>,
    }

    impl FlakyEventLog {
        pub(crate) fn failing(failures: u32) -> Self {
            Self {
                failures: Arc::new(AtomicU32::new(failures)),
                ..Self::default()
            }
        }

        pub(crate) fn unreadable(load_failures: u32) -> Self {
            Self {
                load_failures: Arc::new(AtomicU32::new(load_failures)),
                ..Self::default()
            }
        }

        /// Make the next `n` event loads fail.
        pub(crate) fn fail_loads(&self, n: u32) {
            self.load_failures.store(n, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl EventLog for FlakyEventLog {
        async fn load_snapshot(
            &self,
            thing_id: &ThingId,
        ) -> Result<Option<Snapshot>, EventLogError> {
            self.inner.load_snapshot(thing_id).await
        }

        async fn load_events(
            &self,
            thing_id: &ThingId,
            after_revision: u64,
        ) -> Result<Vec<StoredEvent>, EventLogError> {
            let remaining = self.load_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.load_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(EventLogError::Unavailable("injected failure".into()));
            }
            self.inner.load_events(thing_id, after_revision).await
        }

        async fn append(
            &self,
            thing_id: &ThingId,
            expected_revision: u64,
            event: &StoredEvent,
        ) -> Result<(), AppendError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(AppendError::Unavailable("injected failure".into()));
            }
            self.inner.append(thing_id, expected_revision, event).await
        }

        async fn save_snapshot(
            &self,
            thing_id: &ThingId,
            snapshot: &Snapshot,
        ) -> Result<(), EventLogError> {
            self.inner.save_snapshot(thing_id, snapshot).await
        }
    }
}
