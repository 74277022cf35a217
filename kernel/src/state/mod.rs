// Table Metadata Builder
//
// Derives the next metadata document from a base document and a series
// of changes. This module is pure, deterministic, and side-effect free:
// nothing becomes visible until the built document is swapped in by a
// store.

use std::collections::{BTreeMap, HashSet};

use crate::log::{
    now_ms, FileChanges, FormatVersion, HistoryEntry, Snapshot, SnapshotId, SnapshotOperation,
    StoreError, TableMetadata, Version,
};

/// Checks applied to removed files when a snapshot is added.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// Removing a path that is not live is a no-op.
    None,

    /// Every removed path must be live in the current snapshot.
    RequireRemovedFiles,
}

/// Accumulates changes against one base metadata version.
#[derive(Debug, Clone)]
pub struct MetadataBuilder {
    base_version: Version,
    metadata: TableMetadata,
    changed: bool,
}

impl MetadataBuilder {
    pub fn new(base: &TableMetadata) -> Self {
        Self {
            base_version: base.version,
            metadata: base.clone(),
            changed: false,
        }
    }

    pub fn base_version(&self) -> Version {
        self.base_version
    }

    /// The pending document, including changes staged so far.
    pub fn metadata(&self) -> &TableMetadata {
        &self.metadata
    }

    pub fn current_snapshot_id(&self) -> Option<SnapshotId> {
        self.metadata.current_snapshot_id
    }

    pub fn has_changes(&self) -> bool {
        self.changed
    }

    /// Add a snapshot on top of the current one and make it current.
    pub fn add_snapshot(
        &mut self,
        operation: SnapshotOperation,
        changes: FileChanges,
        validation: Validation,
    ) -> Result<SnapshotId, StoreError> {
        self.add_snapshot_with(operation, changes, validation, &[])
    }

    /// Like `add_snapshot`, recording extra summary properties.
    pub fn add_snapshot_with(
        &mut self,
        operation: SnapshotOperation,
        changes: FileChanges,
        validation: Validation,
        extra_summary: &[(&str, String)],
    ) -> Result<SnapshotId, StoreError> {
        if !changes.added_delete_files.is_empty()
            && self.metadata.format_version < FormatVersion::V2
        {
            return Err(StoreError::NeedsUpgrade(self.metadata.format_version));
        }

        let (mut data_files, mut delete_files) = self
            .metadata
            .current_snapshot()
            .map(|s| (s.data_files.clone(), s.delete_files.clone()))
            .unwrap_or_default();

        let removed: HashSet<&str> = changes
            .removed_data_files
            .iter()
            .map(String::as_str)
            .collect();

        if validation == Validation::RequireRemovedFiles {
            let live: HashSet<&str> = data_files.iter().map(|f| f.file_path.as_str()).collect();
            let missing: Vec<String> = changes
                .removed_data_files
                .iter()
                .filter(|path| !live.contains(path.as_str()))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(StoreError::MissingFiles(missing));
            }
        }

        let before = data_files.len();
        data_files.retain(|f| !removed.contains(f.file_path.as_str()));
        let deleted = before - data_files.len();

        for file in &changes.added_data_files {
            data_files.retain(|f| f.file_path != file.file_path);
            data_files.push(file.clone());
        }
        delete_files.extend(changes.added_delete_files.iter().cloned());

        let snapshot_id = self.metadata.last_snapshot_id + 1;
        let sequence_number = self.metadata.last_sequence_number + 1;
        let timestamp_ms = now_ms();

        let mut summary = BTreeMap::new();
        summary.insert(
            "added-data-files".to_string(),
            changes.added_data_files.len().to_string(),
        );
        summary.insert("deleted-data-files".to_string(), deleted.to_string());
        summary.insert(
            "added-delete-files".to_string(),
            changes.added_delete_files.len().to_string(),
        );
        summary.insert("total-data-files".to_string(), data_files.len().to_string());
        summary.insert(
            "total-records".to_string(),
            data_files
                .iter()
                .map(|f| f.record_count)
                .sum::<u64>()
                .to_string(),
        );
        for (key, value) in extra_summary {
            summary.insert((*key).to_string(), value.clone());
        }

        self.metadata.snapshots.push(Snapshot {
            snapshot_id,
            parent_snapshot_id: self.metadata.current_snapshot_id,
            sequence_number,
            timestamp_ms,
            operation,
            summary,
            changes,
            data_files,
            delete_files,
        });
        self.metadata.last_snapshot_id = snapshot_id;
        self.metadata.last_sequence_number = sequence_number;
        self.move_current(snapshot_id, timestamp_ms);

        Ok(snapshot_id)
    }

    /// Re-apply the changes of an existing snapshot on top of the current
    /// snapshot. The replayed content gets a new snapshot id.
    pub fn cherry_pick(&mut self, snapshot_id: SnapshotId) -> Result<SnapshotId, StoreError> {
        let source = self
            .metadata
            .snapshot(snapshot_id)
            .cloned()
            .ok_or(StoreError::SnapshotNotFound(snapshot_id))?;

        let validation = match source.operation {
            SnapshotOperation::Replace => Validation::RequireRemovedFiles,
            _ => Validation::None,
        };

        let mut extra = vec![("source-snapshot-id", snapshot_id.to_string())];
        if let Some(merge) = source.summary.get("manifest-merge") {
            extra.push(("manifest-merge", merge.clone()));
        }

        let replayed =
            self.add_snapshot_with(source.operation, source.changes, validation, &extra)?;
        tracing::debug!(source = snapshot_id, replayed, "cherry-picked snapshot");
        Ok(replayed)
    }

    /// Move the current pointer to an existing snapshot.
    pub fn set_current_snapshot(&mut self, snapshot_id: SnapshotId) -> Result<(), StoreError> {
        if self.metadata.snapshot(snapshot_id).is_none() {
            return Err(StoreError::SnapshotNotFound(snapshot_id));
        }
        self.move_current(snapshot_id, now_ms());
        Ok(())
    }

    fn move_current(&mut self, snapshot_id: SnapshotId, timestamp_ms: i64) {
        self.metadata.current_snapshot_id = Some(snapshot_id);
        self.metadata.snapshot_log.push(HistoryEntry {
            timestamp_ms,
            snapshot_id,
        });
        self.metadata.last_updated_ms = timestamp_ms;
        self.changed = true;
    }

    fn ensure_snapshot(&self, snapshot_id: SnapshotId) -> Result<(), StoreError> {
        match self.metadata.snapshot(snapshot_id) {
            Some(_) => Ok(()),
            None => Err(StoreError::SnapshotNotFound(snapshot_id)),
        }
    }

    /// Create a tag; fails if the name is taken.
    pub fn create_tag(&mut self, name: &str, snapshot_id: SnapshotId) -> Result<(), StoreError> {
        if self.metadata.tags.contains_key(name) {
            return Err(StoreError::TagAlreadyExists(name.into()));
        }
        self.set_tag(name, snapshot_id)
    }

    /// Repoint an existing tag.
    pub fn replace_tag(&mut self, name: &str, snapshot_id: SnapshotId) -> Result<(), StoreError> {
        if !self.metadata.tags.contains_key(name) {
            return Err(StoreError::TagNotFound(name.into()));
        }
        self.set_tag(name, snapshot_id)
    }

    /// Create or repoint a tag.
    pub fn set_tag(&mut self, name: &str, snapshot_id: SnapshotId) -> Result<(), StoreError> {
        self.ensure_snapshot(snapshot_id)?;
        self.metadata.tags.insert(name.into(), snapshot_id);
        self.changed = true;
        Ok(())
    }

    pub fn remove_tag(&mut self, name: &str) -> Result<SnapshotId, StoreError> {
        let snapshot_id = self
            .metadata
            .tags
            .remove(name)
            .ok_or_else(|| StoreError::TagNotFound(name.into()))?;
        self.changed = true;
        Ok(snapshot_id)
    }

    /// Raise the format version. Returns `false` when the table is
    /// already at `target`.
    pub fn upgrade_format_version(&mut self, target: FormatVersion) -> Result<bool, StoreError> {
        let current = self.metadata.format_version;
        if target < current {
            return Err(StoreError::Downgrade {
                from: current,
                to: target,
            });
        }
        if target == current {
            return Ok(false);
        }

        self.metadata.format_version = target;
        self.metadata.last_updated_ms = now_ms();
        self.changed = true;
        Ok(true)
    }

    /// Finish the update. The flag reports whether anything changed.
    pub fn build(self) -> (TableMetadata, bool) {
        (self.metadata, self.changed)
    }
}
