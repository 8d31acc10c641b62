//! Activity log sink
//!
//! Operations report their outcomes as activity-log entries: a JSON state
//! snapshot keyed by entry id, updated in place as the operation advances,
//! plus a one-shot binary payload attached on terminal success (the
//! uploaded file, a recorded waveform). The store itself lives with the
//! embedding application; [`MemoryActivityLog`] is an explicit registry
//! object for tests and headless embedders — never process-wide static
//! state.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

/// Entry type for list get/send operations.
pub const LOG_TYPE_LIST: &str = "instrument/list";
/// Entry type for file uploads.
pub const LOG_TYPE_FILE_UPLOAD: &str = "instrument/file-upload";

/// Identifier of a stored log entry.
pub type LogEntryId = Uuid;

/// A new entry handed to the sink.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Id of the instrument the operation ran against.
    pub oid: String,
    /// Entry type, e.g. [`LOG_TYPE_LIST`].
    pub kind: String,
    /// JSON state snapshot.
    pub message: String,
    /// Binary payload, attached at most once per entry.
    pub data: Option<Bytes>,
}

impl LogEntry {
    /// Entry with a JSON message and no payload.
    pub fn new(oid: &str, kind: &str, message: String) -> Self {
        Self {
            oid: oid.to_string(),
            kind: kind.to_string(),
            message,
            data: None,
        }
    }
}

/// In-place changes to an existing entry.
#[derive(Debug, Clone, Default)]
pub struct LogEntryUpdate {
    /// Replacement JSON snapshot.
    pub message: Option<String>,
    /// Binary payload attachment.
    pub data: Option<Bytes>,
}

/// Where operations persist their progress and outcomes.
pub trait ActivityLog: Send + Sync {
    /// Store a new entry and return its id.
    fn log(&self, entry: LogEntry) -> LogEntryId;
    /// Update an entry in place. Unknown ids are ignored.
    fn update(&self, id: LogEntryId, update: LogEntryUpdate);
    /// Remove an entry. Unknown ids are ignored.
    fn delete(&self, id: LogEntryId);
}

/// An entry as stored by [`MemoryActivityLog`].
#[derive(Debug, Clone)]
pub struct StoredEntry {
    /// Entry id.
    pub id: LogEntryId,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// The entry content.
    pub entry: LogEntry,
}

/// Thread-safe in-memory log registry.
#[derive(Default, Clone)]
pub struct MemoryActivityLog {
    inner: Arc<Mutex<MemoryLogInner>>,
}

#[derive(Default)]
struct MemoryLogInner {
    order: Vec<LogEntryId>,
    entries: HashMap<LogEntryId, StoredEntry>,
}

impl MemoryActivityLog {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all entries in insertion order.
    pub fn entries(&self) -> Vec<StoredEntry> {
        let inner = self.inner.lock();
        inner
            .order
            .iter()
            .filter_map(|id| inner.entries.get(id).cloned())
            .collect()
    }

    /// Look up a single entry.
    pub fn get(&self, id: LogEntryId) -> Option<StoredEntry> {
        self.inner.lock().entries.get(&id).cloned()
    }
}

impl ActivityLog for MemoryActivityLog {
    fn log(&self, entry: LogEntry) -> LogEntryId {
        let id = Uuid::new_v4();
        let mut inner = self.inner.lock();
        inner.order.push(id);
        inner.entries.insert(
            id,
            StoredEntry {
                id,
                created_at: Utc::now(),
                entry,
            },
        );
        id
    }

    fn update(&self, id: LogEntryId, update: LogEntryUpdate) {
        let mut inner = self.inner.lock();
        if let Some(stored) = inner.entries.get_mut(&id) {
            if let Some(message) = update.message {
                stored.entry.message = message;
            }
            if let Some(data) = update.data {
                stored.entry.data = Some(data);
            }
        }
    }

    fn delete(&self, id: LogEntryId) {
        let mut inner = self.inner.lock();
        inner.entries.remove(&id);
        inner.order.retain(|entry_id| *entry_id != id);
    }
}
