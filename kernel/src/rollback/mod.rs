// Rollback Engine
//
// Rolls the table back to the checkpoint preceding a named tag. Unless
// the caller forces a plain pointer move or discards every later
// checkpoint, the lineage committed after the rolled-back tag is replayed
// on top of the target so later tags keep their names. Checkpoints are
// tagged snapshots on the current lineage, oldest first.

use std::collections::{BTreeMap, HashMap};

use crate::log::{MetadataStore, SnapshotId, StoreError};
use crate::replay::{HistoryReplay, ReplayAction};
use crate::retry::{Classify, ErrorKind};
use crate::table::Table;

#[derive(Debug, thiserror::Error)]
pub enum RollbackError {
    #[error("tag `{0}` not found in the table")]
    TagNotFound(String),

    #[error("cannot rollback `{0}`: it is the first checkpoint")]
    CannotRollbackFirstCheckpoint(String),

    #[error("table has no history")]
    EmptyHistory,

    #[error("cannot rollback `{0}`: its snapshot is not an ancestor of the current snapshot")]
    NotOnCurrentLineage(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classify for RollbackError {
    fn kind(&self) -> ErrorKind {
        match self {
            RollbackError::Store(err) => err.kind(),
            _ => ErrorKind::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollbackMode {
    /// Drop every checkpoint from the rolled-back one onward.
    pub all: bool,

    /// Only move the current pointer to the tagged snapshot.
    pub force: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackOutcome {
    /// Snapshot the current pointer was moved to.
    pub target: SnapshotId,

    pub removed_tags: Vec<String>,

    /// Tags moved to replayed snapshots, with their new snapshot ids.
    pub retagged: Vec<(String, SnapshotId)>,

    /// `(source, replayed)` pairs, in replay order.
    pub replayed: Vec<(SnapshotId, SnapshotId)>,
}

pub fn rollback<S: MetadataStore>(
    table: &mut Table<S>,
    name: &str,
    mode: RollbackMode,
) -> Result<RollbackOutcome, RollbackError> {
    table.refresh()?;
    let rollback_id = table
        .tags()
        .get(name)
        .copied()
        .ok_or_else(|| RollbackError::TagNotFound(name.into()))?;

    if mode.force {
        let mut update = table.new_update();
        update.set_current_snapshot(rollback_id)?;
        table.commit(update)?;
        tracing::info!(tag = name, snapshot_id = rollback_id, "forced rollback");
        return Ok(RollbackOutcome {
            target: rollback_id,
            ..Default::default()
        });
    }

    // Only the current lineage is replayed; snapshots abandoned by an
    // earlier rollback stay abandoned.
    let mut lineage = table.metadata().ancestors();
    if lineage.is_empty() {
        return Err(RollbackError::EmptyHistory);
    }
    lineage.reverse();
    let position = lineage
        .iter()
        .position(|id| *id == rollback_id)
        .ok_or_else(|| RollbackError::NotOnCurrentLineage(name.into()))?;
    let trailing = lineage[position + 1..].to_vec();

    let mut tags_by_snapshot: BTreeMap<SnapshotId, Vec<String>> = BTreeMap::new();
    for (tag, id) in table.tags() {
        tags_by_snapshot.entry(*id).or_default().push(tag.clone());
    }

    let mut checkpoints: Vec<SnapshotId> = lineage
        .iter()
        .copied()
        .filter(|id| tags_by_snapshot.contains_key(id))
        .collect();

    let index = checkpoints
        .iter()
        .position(|id| *id == rollback_id)
        .ok_or(StoreError::SnapshotNotFound(rollback_id))?;
    if index == 0 {
        return Err(RollbackError::CannotRollbackFirstCheckpoint(name.into()));
    }
    let target = checkpoints[index - 1];
    checkpoints.remove(index);
    let later = &checkpoints[index..];

    let mut outcome = RollbackOutcome {
        target,
        removed_tags: vec![name.to_string()],
        ..Default::default()
    };

    let mut update = table.new_update();
    update.set_current_snapshot(target)?;
    update.remove_tag(name)?;

    if mode.all {
        for id in later {
            for tag in &tags_by_snapshot[id] {
                update.remove_tag(tag)?;
                outcome.removed_tags.push(tag.clone());
            }
        }
        table.commit(update)?;
        tracing::info!(
            tag = name,
            target,
            removed = ?outcome.removed_tags,
            "rolled back and dropped later checkpoints"
        );
        return Ok(outcome);
    }

    table.commit(update)?;

    let boundaries: HashMap<SnapshotId, Vec<String>> = later
        .iter()
        .map(|id| (*id, tags_by_snapshot[id].clone()))
        .collect();
    let mut replay = HistoryReplay::new(trailing, boundaries);
    let mut update = table.new_update();

    loop {
        match replay.next_action() {
            ReplayAction::CherryPick(source) => {
                let replayed = update.cherry_pick(source)?;
                outcome.replayed.push((source, replayed));
                replay.cherry_picked(source, replayed);
            }
            ReplayAction::CommitAndRetag { replayed, tags, .. } => {
                table.commit(update)?;
                update = table.new_update();
                for tag in tags {
                    update.replace_tag(&tag, replayed)?;
                    outcome.retagged.push((tag, replayed));
                }
                replay.retagged();
            }
            ReplayAction::Finish => {
                table.commit(update)?;
                replay.finish();
                break;
            }
        }
    }

    tracing::info!(
        tag = name,
        target,
        replayed = outcome.replayed.len(),
        retagged = ?outcome.retagged,
        "rolled back and replayed later history"
    );
    Ok(outcome)
}
