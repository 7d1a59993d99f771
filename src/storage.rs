//! File-backed event log.
//!
//! Each thing gets one JSON-lines event file and one snapshot file.
//! Snapshot writes are atomic via a temp-rename so readers never see a
//! partially written snapshot.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::event::StoredEvent;
use crate::event_log::{AppendError, EventLog, EventLogError, Snapshot};
use crate::thing::ThingId;

const EVENTS_FILE: &str = "events.jsonl";
const SNAPSHOT_FILE: &str = "snapshot.json";
const DEFAULT_NAMESPACE_DIR: &str = "_";

/// Manages the on-disk directory layout for thing event streams.
///
/// ```text
/// <base_dir>/
///     streams/
///         <namespace>/
///             <name>/
///                 events.jsonl
///                 snapshot.json
/// ```
///
/// The empty namespace maps to the `_` directory. Path separators and `%`
/// inside a segment are percent-encoded.
#[derive(Debug, Clone)]
pub struct StreamLayout {
    base_dir: PathBuf,
}

impl StreamLayout {
    /// Create a layout rooted at `base_dir`. The directory is created
    /// lazily on first append.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        let segment = if namespace.is_empty() {
            DEFAULT_NAMESPACE_DIR.to_owned()
        } else {
            encode_segment(namespace)
        };
        self.base_dir.join("streams").join(segment)
    }

    /// `<base_dir>/streams/<namespace>/<name>`
    pub fn stream_dir(&self, thing_id: &ThingId) -> PathBuf {
        self.namespace_dir(thing_id.namespace())
            .join(encode_segment(thing_id.name()))
    }

    pub fn events_path(&self, thing_id: &ThingId) -> PathBuf {
        self.stream_dir(thing_id).join(EVENTS_FILE)
    }

    pub fn snapshot_path(&self, thing_id: &ThingId) -> PathBuf {
        self.stream_dir(thing_id).join(SNAPSHOT_FILE)
    }

    /// Lists the thing names stored under `namespace`, sorted.
    ///
    /// Returns an empty vector if the namespace has no streams yet.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if reading the directory fails for a reason
    /// other than it not existing.
    pub fn list_things(&self, namespace: &str) -> io::Result<Vec<String>> {
        let entries = match fs::read_dir(self.namespace_dir(namespace)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| {
                let entry = entry.ok()?;
                entry
                    .file_type()
                    .ok()?
                    .is_dir()
                    .then(|| decode_segment(&entry.file_name().to_string_lossy()))
            })
            .collect();

        names.sort();
        Ok(names)
    }
}

fn encode_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            '\\' => out.push_str("%5C"),
            c => out.push(c),
        }
    }
    if out == "." || out == ".." {
        out = out.replace('.', "%2E");
    }
    out
}

fn decode_segment(encoded: &str) -> String {
    encoded
        .replace("%2F", "/")
        .replace("%5C", "\\")
        .replace("%2E", ".")
        .replace("%25", "%")
}

/// [`EventLog`] storing one JSON-lines file per thing.
///
/// The expected-revision check and the write happen under a per-stream
/// lock, so concurrent appends to one stream from the same process are
/// serialized. The stream head is cached after the first read.
#[derive(Debug, Clone)]
pub struct FileEventLog {
    layout: StreamLayout,
    heads: Arc<Mutex<HashMap<ThingId, Arc<tokio::sync::Mutex<Option<u64>>>>>>,
}

impl FileEventLog {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            layout: StreamLayout::new(base_dir),
            heads: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn layout(&self) -> &StreamLayout {
        &self.layout
    }

    fn head_lock(&self, thing_id: &ThingId) -> Arc<tokio::sync::Mutex<Option<u64>>> {
        let mut heads = self.heads.lock().unwrap_or_else(PoisonError::into_inner);
        heads.entry(thing_id.clone()).or_default().clone()
    }

    async fn read_events(&self, thing_id: &ThingId) -> Result<Vec<StoredEvent>, EventLogError> {
        let path = self.layout.events_path(thing_id);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EventLogError::Io(e)),
        };

        contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str::<StoredEvent>(line).map_err(|e| EventLogError::Corrupt {
                    thing_id: thing_id.clone(),
                    message: format!("line {}: {e}", i + 1),
                })
            })
            .collect()
    }
}

#[async_trait]
impl EventLog for FileEventLog {
    async fn load_snapshot(&self, thing_id: &ThingId) -> Result<Option<Snapshot>, EventLogError> {
        let path = self.layout.snapshot_path(thing_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EventLogError::Io(e)),
        };

        match serde_json::from_slice::<Snapshot>(&bytes) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to deserialize snapshot; treating as cache miss"
                );
                Ok(None)
            }
        }
    }

    async fn load_events(
        &self,
        thing_id: &ThingId,
        after_revision: u64,
    ) -> Result<Vec<StoredEvent>, EventLogError> {
        let mut events = self.read_events(thing_id).await?;
        events.retain(|e| e.revision > after_revision);
        Ok(events)
    }

    async fn append(
        &self,
        thing_id: &ThingId,
        expected_revision: u64,
        event: &StoredEvent,
    ) -> Result<(), AppendError> {
        let lock = self.head_lock(thing_id);
        let mut head = lock.lock().await;

        let actual = match *head {
            Some(revision) => revision,
            None => self
                .read_events(thing_id)
                .await
                .map_err(|e| AppendError::Unavailable(e.to_string()))?
                .last()
                .map_or(0, |e| e.revision),
        };
        *head = Some(actual);

        if actual != expected_revision || event.revision != expected_revision + 1 {
            return Err(AppendError::RevisionConflict {
                expected: expected_revision,
                actual,
            });
        }

        tokio::fs::create_dir_all(self.layout.stream_dir(thing_id)).await?;
        let mut line = serde_json::to_string(event)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.layout.events_path(thing_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;

        *head = Some(event.revision);
        Ok(())
    }

    async fn save_snapshot(
        &self,
        thing_id: &ThingId,
        snapshot: &Snapshot,
    ) -> Result<(), EventLogError> {
        let path = self.layout.snapshot_path(thing_id);
        tokio::fs::create_dir_all(self.layout.stream_dir(thing_id)).await?;

        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(&tmp_path, &json).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }
}
