// Commit Coordinator
//
// Drives a transaction through the table's metadata store as a single
// atomic swap. When the table format cannot hold a staged operation the
// table is upgraded once and the transaction is rebuilt from a fresh
// read.

use crate::log::{MetadataStore, SnapshotId, StoreError};
use crate::retry::{Classify, ErrorKind};
use crate::table::Table;
use crate::transaction::Transaction;

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("format upgrade did not take effect: {0}")]
    UpgradeDidNotTakeEffect(StoreError),
}

impl Classify for CommitError {
    fn kind(&self) -> ErrorKind {
        match self {
            CommitError::Store(err) => err.kind(),
            CommitError::UpgradeDidNotTakeEffect(_) => ErrorKind::Other,
        }
    }
}

/// What a successful transaction produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    /// One snapshot per operation, in operation order.
    pub snapshot_ids: Vec<SnapshotId>,

    /// Tags staged for the snapshots, in operation order.
    pub tags: Vec<String>,

    /// Whether the table format was upgraded on the way.
    pub upgraded: bool,
}

pub struct CommitCoordinator<'a, S: MetadataStore> {
    table: &'a mut Table<S>,
}

impl<'a, S: MetadataStore> CommitCoordinator<'a, S> {
    pub fn new(table: &'a mut Table<S>) -> Self {
        Self { table }
    }

    /// Commit every operation of `transaction` atomically.
    ///
    /// Stale-base conflicts are returned to the caller; only the format
    /// upgrade is recovered here, at most once.
    pub fn execute(&mut self, transaction: &Transaction) -> Result<CommitOutcome, CommitError> {
        let mut upgraded = false;

        loop {
            match self.attempt(transaction) {
                Ok((snapshot_ids, tags)) => {
                    tracing::info!(
                        snapshots = ?snapshot_ids,
                        tags = ?tags,
                        version = self.table.metadata().version,
                        "transaction committed"
                    );
                    return Ok(CommitOutcome {
                        snapshot_ids,
                        tags,
                        upgraded,
                    });
                }
                Err(err) if err.kind() == ErrorKind::NeedsUpgrade => {
                    if upgraded {
                        return Err(CommitError::UpgradeDidNotTakeEffect(err));
                    }
                    tracing::info!(error = %err, "upgrading table format before retrying");
                    self.table.upgrade_format_version()?;
                    upgraded = true;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn attempt(
        &mut self,
        transaction: &Transaction,
    ) -> Result<(Vec<SnapshotId>, Vec<String>), StoreError> {
        self.table.refresh()?;
        let mut update = self.table.new_update();
        let mut snapshot_ids = Vec::with_capacity(transaction.operations.len());
        let mut tags = Vec::new();

        for (index, operation) in transaction.operations.iter().enumerate() {
            let snapshot_id = operation.stage(&mut update)?;
            tracing::debug!(index, kind = operation.kind().as_str(), snapshot_id, "staged operation");

            if let Some(prefix) = &transaction.tag_prefix {
                let tag = Transaction::tag_name(prefix, index);
                update.set_tag(&tag, snapshot_id)?;
                tags.push(tag);
            }
            snapshot_ids.push(snapshot_id);
        }

        self.table.commit(update)?;
        Ok((snapshot_ids, tags))
    }
}
