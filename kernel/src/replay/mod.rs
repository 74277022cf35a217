// History Replay State Machine
//
// Replays the snapshots that followed a rollback point on top of the new
// current snapshot. Cherry-picks accumulate into one pending update until
// a snapshot that carried tags has been replayed; at that boundary the
// pending update is committed and the tags are moved to the replayed copy.
//
// The machine is pure: it decides the next action, the caller performs it
// against the table and reports back.

use std::collections::HashMap;

use crate::log::SnapshotId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayState {
    /// Cherry-picking snapshots into the pending update.
    Replaying,

    /// A tagged snapshot was just replayed; its tags must follow it.
    AtTagBoundary {
        source: SnapshotId,
        replayed: SnapshotId,
        tags: Vec<String>,
    },

    Done,
}

/// What the caller must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayAction {
    /// Cherry-pick `source` into the pending update.
    CherryPick(SnapshotId),

    /// Commit the pending update, then repoint `tags` to `replayed` in a
    /// fresh pending update.
    CommitAndRetag {
        source: SnapshotId,
        replayed: SnapshotId,
        tags: Vec<String>,
    },

    /// Commit whatever is pending; replay is complete.
    Finish,
}

#[derive(Debug, Clone)]
pub struct HistoryReplay {
    queue: Vec<SnapshotId>,
    cursor: usize,
    boundaries: HashMap<SnapshotId, Vec<String>>,
    state: ReplayState,
}

impl HistoryReplay {
    /// `queue` is the history after the rollback point, oldest first.
    /// `boundaries` maps each tagged snapshot in it to its tag names.
    pub fn new(queue: Vec<SnapshotId>, boundaries: HashMap<SnapshotId, Vec<String>>) -> Self {
        Self {
            queue,
            cursor: 0,
            boundaries,
            state: ReplayState::Replaying,
        }
    }

    pub fn state(&self) -> &ReplayState {
        &self.state
    }

    pub fn next_action(&self) -> ReplayAction {
        match &self.state {
            ReplayState::Replaying => match self.queue.get(self.cursor) {
                Some(source) => ReplayAction::CherryPick(*source),
                None => ReplayAction::Finish,
            },
            ReplayState::AtTagBoundary {
                source,
                replayed,
                tags,
            } => ReplayAction::CommitAndRetag {
                source: *source,
                replayed: *replayed,
                tags: tags.clone(),
            },
            ReplayState::Done => ReplayAction::Finish,
        }
    }

    /// Record that `source` was cherry-picked as `replayed`.
    ///
    /// A snapshot id that occurs again later in the queue is replayed only
    /// once; the cursor moves past its last occurrence.
    pub fn cherry_picked(&mut self, source: SnapshotId, replayed: SnapshotId) {
        let last = self
            .queue
            .iter()
            .rposition(|id| *id == source)
            .unwrap_or(self.cursor);
        self.cursor = last + 1;

        self.state = match self.boundaries.get(&source) {
            Some(tags) if !tags.is_empty() => ReplayState::AtTagBoundary {
                source,
                replayed,
                tags: tags.clone(),
            },
            _ => ReplayState::Replaying,
        };
    }

    /// Record that the boundary commit and retag were staged.
    pub fn retagged(&mut self) {
        if matches!(self.state, ReplayState::AtTagBoundary { .. }) {
            self.state = ReplayState::Replaying;
        }
    }

    pub fn finish(&mut self) {
        self.state = ReplayState::Done;
    }

    pub fn is_done(&self) -> bool {
        self.state == ReplayState::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boundaries(entries: &[(SnapshotId, &str)]) -> HashMap<SnapshotId, Vec<String>> {
        let mut map: HashMap<SnapshotId, Vec<String>> = HashMap::new();
        for (id, tag) in entries {
            map.entry(*id).or_default().push((*tag).to_string());
        }
        map
    }

    /// Drive the machine with a fake cherry-pick that maps id -> id + 100.
    fn drive(mut replay: HistoryReplay) -> Vec<ReplayAction> {
        let mut actions = Vec::new();
        loop {
            let action = replay.next_action();
            actions.push(action.clone());
            match action {
                ReplayAction::CherryPick(source) => replay.cherry_picked(source, source + 100),
                ReplayAction::CommitAndRetag { .. } => replay.retagged(),
                ReplayAction::Finish => {
                    replay.finish();
                    break;
                }
            }
        }
        assert!(replay.is_done());
        actions
    }

    #[test]
    fn empty_queue_finishes_immediately() {
        let actions = drive(HistoryReplay::new(vec![], HashMap::new()));
        assert_eq!(actions, vec![ReplayAction::Finish]);
    }

    #[test]
    fn untagged_snapshots_batch_until_boundary() {
        let replay = HistoryReplay::new(vec![4, 5, 6, 7], boundaries(&[(5, "ckpt-2")]));
        let actions = drive(replay);

        assert_eq!(
            actions,
            vec![
                ReplayAction::CherryPick(4),
                ReplayAction::CherryPick(5),
                ReplayAction::CommitAndRetag {
                    source: 5,
                    replayed: 105,
                    tags: vec!["ckpt-2".into()],
                },
                ReplayAction::CherryPick(6),
                ReplayAction::CherryPick(7),
                ReplayAction::Finish,
            ]
        );
    }

    #[test]
    fn every_tag_on_a_boundary_moves() {
        let replay = HistoryReplay::new(vec![3], boundaries(&[(3, "a"), (3, "b")]));
        let actions = drive(replay);

        assert_eq!(
            actions[1],
            ReplayAction::CommitAndRetag {
                source: 3,
                replayed: 103,
                tags: vec!["a".into(), "b".into()],
            }
        );
    }

    #[test]
    fn repeated_ids_are_replayed_once() {
        let replay = HistoryReplay::new(vec![4, 5, 4, 6], HashMap::new());
        let actions = drive(replay);

        assert_eq!(
            actions,
            vec![
                ReplayAction::CherryPick(4),
                ReplayAction::CherryPick(6),
                ReplayAction::Finish,
            ]
        );
    }

    #[test]
    fn boundary_state_is_observable() {
        let mut replay = HistoryReplay::new(vec![9], boundaries(&[(9, "t")]));
        replay.cherry_picked(9, 10);
        assert!(matches!(
            replay.state(),
            ReplayState::AtTagBoundary { replayed: 10, .. }
        ));
        replay.retagged();
        assert_eq!(replay.state(), &ReplayState::Replaying);
        assert_eq!(replay.next_action(), ReplayAction::Finish);
    }
}
