// Table Handle
//
// Explicit handle over one table's metadata store. Components receive a
// `Table` instead of reaching for shared catalog state, so every request
// owns its view of the metadata and its own commits.

use crate::invariants::InvariantEngine;
use crate::log::{FormatVersion, MetadataStore, Snapshot, SnapshotId, StoreError, TableMetadata};
use crate::state::MetadataBuilder;

pub struct Table<S: MetadataStore> {
    store: S,
    invariants: InvariantEngine,
    metadata: TableMetadata,
}

impl<S: MetadataStore> Table<S> {
    /// Load the table with the default metadata invariants.
    pub fn load(store: S) -> Result<Self, StoreError> {
        Self::load_with(store, InvariantEngine::with_defaults())
    }

    pub fn load_with(store: S, invariants: InvariantEngine) -> Result<Self, StoreError> {
        let metadata = store.load()?;
        Ok(Self {
            store,
            invariants,
            metadata,
        })
    }

    /// Re-read the current metadata from the store.
    pub fn refresh(&mut self) -> Result<&TableMetadata, StoreError> {
        self.metadata = self.store.load()?;
        Ok(&self.metadata)
    }

    pub fn metadata(&self) -> &TableMetadata {
        &self.metadata
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn current_snapshot_id(&self) -> Option<SnapshotId> {
        self.metadata.current_snapshot_id
    }

    pub fn snapshot(&self, snapshot_id: SnapshotId) -> Option<&Snapshot> {
        self.metadata.snapshot(snapshot_id)
    }

    pub fn history(&self) -> Vec<SnapshotId> {
        self.metadata.history()
    }

    pub fn tags(&self) -> &std::collections::BTreeMap<String, SnapshotId> {
        &self.metadata.tags
    }

    /// Start an update against the metadata this handle last read.
    pub fn new_update(&self) -> MetadataBuilder {
        MetadataBuilder::new(&self.metadata)
    }

    /// Validate and atomically swap in the built update, then refresh.
    ///
    /// An update with no changes is a no-op. A stale base fails with
    /// `StoreError::Conflict` and leaves the store untouched.
    pub fn commit(&mut self, update: MetadataBuilder) -> Result<(), StoreError> {
        let base_version = update.base_version();
        let (next, changed) = update.build();
        if !changed {
            return Ok(());
        }

        self.invariants.evaluate(&self.metadata, &next)?;
        self.store.swap(base_version, &next)?;
        self.refresh()?;
        Ok(())
    }

    /// Raise the table to format version 2. Idempotent.
    pub fn upgrade_format_version(&mut self) -> Result<bool, StoreError> {
        self.refresh()?;
        let mut update = self.new_update();
        let upgraded = update.upgrade_format_version(FormatVersion::V2)?;
        if upgraded {
            self.commit(update)?;
            tracing::info!(location = %self.metadata.location, "upgraded table to format v2");
        }
        Ok(upgraded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{FileChanges, InMemoryStore, SnapshotOperation};
    use crate::state::Validation;
    use std::sync::Arc;

    fn store() -> Arc<InMemoryStore> {
        Arc::new(InMemoryStore::new(TableMetadata::new(
            "memory://t",
            serde_json::json!({}),
        )))
    }

    #[test]
    fn upgrade_twice_is_idempotent() {
        let mut table = Table::load(store()).unwrap();

        assert!(table.upgrade_format_version().unwrap());
        assert!(!table.upgrade_format_version().unwrap());
        assert_eq!(table.metadata().format_version, FormatVersion::V2);
        assert_eq!(table.metadata().version, 1);
    }

    #[test]
    fn stale_handle_commit_conflicts() {
        let shared = store();
        let mut first = Table::load(Arc::clone(&shared)).unwrap();
        let mut second = Table::load(Arc::clone(&shared)).unwrap();

        let mut update = first.new_update();
        update
            .add_snapshot(SnapshotOperation::Append, FileChanges::default(), Validation::None)
            .unwrap();
        first.commit(update).unwrap();

        let mut update = second.new_update();
        update
            .add_snapshot(SnapshotOperation::Append, FileChanges::default(), Validation::None)
            .unwrap();
        let err = second.commit(update).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert_eq!(shared.load().unwrap().snapshots.len(), 1);
    }

    #[test]
    fn empty_update_does_not_bump_version() {
        let mut table = Table::load(store()).unwrap();
        let update = table.new_update();
        table.commit(update).unwrap();
        assert_eq!(table.metadata().version, 0);
    }
}
