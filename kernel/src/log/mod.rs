// Versioned Table Metadata
//
// The snapshot chain, snapshot log and tag map of a table, plus the
// storage backends that commit new metadata with compare-and-swap on
// the metadata version.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::adapters::files::{DataFile, DeleteFile};
use crate::invariants::InvariantViolation;
use crate::retry::{Classify, ErrorKind};

mod file;
mod memory;
pub mod store;

pub use file::FileStore;
pub use memory::InMemoryStore;
pub use store::MetadataStore;

/// Version of a table's metadata document. Commits are accepted only
/// against the current version.
pub type Version = u64;

/// Identifier of a snapshot, unique within a table.
pub type SnapshotId = i64;

/// Table-wide capability flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum FormatVersion {
    V1,
    /// Required for row-level delete files.
    V2,
}

impl From<FormatVersion> for u8 {
    fn from(version: FormatVersion) -> Self {
        match version {
            FormatVersion::V1 => 1,
            FormatVersion::V2 => 2,
        }
    }
}

impl TryFrom<u8> for FormatVersion {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            other => Err(format!("unsupported format version {other}")),
        }
    }
}

impl std::fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", u8::from(*self))
    }
}

/// Summary kind recorded on each snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotOperation {
    Append,
    Replace,
    Overwrite,
    Delete,
}

/// File-level changes applied by one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChanges {
    #[serde(default)]
    pub added_data_files: Vec<DataFile>,

    #[serde(default)]
    pub removed_data_files: Vec<String>,

    #[serde(default)]
    pub added_delete_files: Vec<DeleteFile>,
}

impl FileChanges {
    pub fn is_empty(&self) -> bool {
        self.added_data_files.is_empty()
            && self.removed_data_files.is_empty()
            && self.added_delete_files.is_empty()
    }
}

/// Immutable state of the table at one point of its history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: SnapshotId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_snapshot_id: Option<SnapshotId>,

    pub sequence_number: u64,
    pub timestamp_ms: i64,
    pub operation: SnapshotOperation,

    #[serde(default)]
    pub summary: BTreeMap<String, String>,

    pub changes: FileChanges,

    /// Live data files as of this snapshot.
    pub data_files: Vec<DataFile>,

    /// Live delete files as of this snapshot.
    #[serde(default)]
    pub delete_files: Vec<DeleteFile>,
}

impl Snapshot {
    pub fn total_records(&self) -> u64 {
        self.data_files.iter().map(|f| f.record_count).sum()
    }

    pub fn contains_data_file(&self, path: &str) -> bool {
        self.data_files.iter().any(|f| f.file_path == path)
    }
}

/// One move of the current snapshot pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp_ms: i64,
    pub snapshot_id: SnapshotId,
}

/// The single live metadata document of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    pub table_uuid: Uuid,
    pub location: String,
    pub format_version: FormatVersion,
    pub version: Version,
    pub last_snapshot_id: SnapshotId,
    pub last_sequence_number: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_snapshot_id: Option<SnapshotId>,

    #[serde(default)]
    pub schema: serde_json::Value,

    #[serde(default)]
    pub partition_spec: serde_json::Value,

    #[serde(default)]
    pub snapshots: Vec<Snapshot>,

    #[serde(default)]
    pub snapshot_log: Vec<HistoryEntry>,

    #[serde(default)]
    pub tags: BTreeMap<String, SnapshotId>,

    #[serde(default)]
    pub properties: BTreeMap<String, String>,

    pub last_updated_ms: i64,
}

impl TableMetadata {
    /// Metadata for a freshly created table with no snapshots.
    pub fn new(location: impl Into<String>, schema: serde_json::Value) -> Self {
        Self {
            table_uuid: Uuid::new_v4(),
            location: location.into(),
            format_version: FormatVersion::V1,
            version: 0,
            last_snapshot_id: 0,
            last_sequence_number: 0,
            current_snapshot_id: None,
            schema,
            partition_spec: serde_json::json!({ "fields": [] }),
            snapshots: Vec::new(),
            snapshot_log: Vec::new(),
            tags: BTreeMap::new(),
            properties: BTreeMap::new(),
            last_updated_ms: now_ms(),
        }
    }

    pub fn with_format_version(mut self, format_version: FormatVersion) -> Self {
        self.format_version = format_version;
        self
    }

    pub fn snapshot(&self, snapshot_id: SnapshotId) -> Option<&Snapshot> {
        self.snapshots.iter().find(|s| s.snapshot_id == snapshot_id)
    }

    pub fn current_snapshot(&self) -> Option<&Snapshot> {
        self.current_snapshot_id.and_then(|id| self.snapshot(id))
    }

    /// Snapshot ids in commit order, oldest first.
    ///
    /// Pointer moves are recorded in `snapshot_log`, not here, so a
    /// rollback never lengthens the history.
    pub fn history(&self) -> Vec<SnapshotId> {
        self.snapshots.iter().map(|s| s.snapshot_id).collect()
    }

    /// Snapshot ids from the current snapshot back to the root.
    pub fn ancestors(&self) -> Vec<SnapshotId> {
        let mut lineage = Vec::new();
        let mut cursor = self.current_snapshot_id;
        while let Some(id) = cursor {
            lineage.push(id);
            cursor = self.snapshot(id).and_then(|s| s.parent_snapshot_id);
        }
        lineage
    }

    /// Paths of the data files visible at the current snapshot.
    pub fn live_data_files(&self) -> Vec<&str> {
        self.current_snapshot()
            .map(|s| s.data_files.iter().map(|f| f.file_path.as_str()).collect())
            .unwrap_or_default()
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("base metadata version {expected} is not same as the current table metadata version {actual}")]
    Conflict { expected: Version, actual: Version },

    #[error("cannot write delete files in a {0} table")]
    NeedsUpgrade(FormatVersion),

    #[error("cannot downgrade format version from {from} to {to}")]
    Downgrade {
        from: FormatVersion,
        to: FormatVersion,
    },

    #[error("snapshot {0} does not exist")]
    SnapshotNotFound(SnapshotId),

    #[error("table has no current snapshot")]
    NoCurrentSnapshot,

    #[error("missing required files to delete: {}", .0.join(", "))]
    MissingFiles(Vec<String>),

    #[error("tag `{0}` already exists")]
    TagAlreadyExists(String),

    #[error("tag `{0}` does not exist")]
    TagNotFound(String),

    #[error("table not found at {0}")]
    TableNotFound(String),

    #[error("table already exists at {0}")]
    TableAlreadyExists(String),

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    #[error("metadata io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Conflict { .. } => ErrorKind::Conflict,
            StoreError::NeedsUpgrade(_) => ErrorKind::NeedsUpgrade,
            _ => ErrorKind::Other,
        }
    }
}
