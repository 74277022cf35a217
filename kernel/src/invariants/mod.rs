// Invariant Framework
//
// Invariants are pure rules that must always hold true between the
// base metadata of a commit and the candidate that replaces it.
// Violations are detected *before* the candidate is swapped in.

use std::collections::HashSet;

use crate::log::TableMetadata;

/// Result of invariant evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantResult {
    Pass,
    Fail(String),
}

/// Trait implemented by all invariants.
///
/// Invariants must be:
/// - Pure
/// - Deterministic
/// - Side-effect free
pub trait Invariant: Send + Sync {
    fn name(&self) -> &'static str;

    fn validate(&self, base: &TableMetadata, next: &TableMetadata) -> InvariantResult;
}

/// Invariant engine that evaluates a set of invariants.
#[derive(Default)]
pub struct InvariantEngine {
    invariants: Vec<Box<dyn Invariant>>,
}

impl InvariantEngine {
    /// Create an engine with no invariants.
    pub fn new() -> Self {
        Self {
            invariants: Vec::new(),
        }
    }

    /// Create an engine with the built-in metadata invariants.
    pub fn with_defaults() -> Self {
        let mut engine = Self::new();
        engine.register(TagsResolve);
        engine.register(CurrentSnapshotResolves);
        engine.register(LinearLineage);
        engine.register(FormatVersionNeverDecreases);
        engine
    }

    /// Register an invariant.
    pub fn register<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Evaluate all invariants.
    ///
    /// Stops at the first failure.
    pub fn evaluate(
        &self,
        base: &TableMetadata,
        next: &TableMetadata,
    ) -> Result<(), InvariantViolation> {
        for invariant in &self.invariants {
            match invariant.validate(base, next) {
                InvariantResult::Pass => continue,
                InvariantResult::Fail(reason) => {
                    return Err(InvariantViolation {
                        invariant: invariant.name(),
                        reason,
                    })
                }
            }
        }
        Ok(())
    }
}

/// Returned when an invariant is violated.
#[derive(Debug, thiserror::Error)]
#[error("invariant `{invariant}` violated: {reason}")]
pub struct InvariantViolation {
    pub invariant: &'static str,
    pub reason: String,
}

/// Every tag resolves to exactly one existing snapshot.
pub struct TagsResolve;

impl Invariant for TagsResolve {
    fn name(&self) -> &'static str {
        "tags-resolve"
    }

    fn validate(&self, _base: &TableMetadata, next: &TableMetadata) -> InvariantResult {
        match next
            .tags
            .iter()
            .find(|(_, id)| next.snapshot(**id).is_none())
        {
            Some((name, id)) => {
                InvariantResult::Fail(format!("tag `{name}` points at unknown snapshot {id}"))
            }
            None => InvariantResult::Pass,
        }
    }
}

pub struct CurrentSnapshotResolves;

impl Invariant for CurrentSnapshotResolves {
    fn name(&self) -> &'static str {
        "current-snapshot-resolves"
    }

    fn validate(&self, _base: &TableMetadata, next: &TableMetadata) -> InvariantResult {
        match next.current_snapshot_id {
            Some(id) if next.snapshot(id).is_none() => {
                InvariantResult::Fail(format!("current snapshot {id} does not exist"))
            }
            _ => InvariantResult::Pass,
        }
    }
}

/// Snapshot ids are unique and every parent exists, so the snapshots form
/// a tree without merges and the current lineage is a straight line.
pub struct LinearLineage;

impl Invariant for LinearLineage {
    fn name(&self) -> &'static str {
        "linear-lineage"
    }

    fn validate(&self, _base: &TableMetadata, next: &TableMetadata) -> InvariantResult {
        let mut seen = HashSet::new();
        for snapshot in &next.snapshots {
            if !seen.insert(snapshot.snapshot_id) {
                return InvariantResult::Fail(format!(
                    "duplicate snapshot id {}",
                    snapshot.snapshot_id
                ));
            }
            if let Some(parent) = snapshot.parent_snapshot_id {
                if !seen.contains(&parent) {
                    return InvariantResult::Fail(format!(
                        "snapshot {} has unknown parent {parent}",
                        snapshot.snapshot_id
                    ));
                }
            }
        }
        InvariantResult::Pass
    }
}

pub struct FormatVersionNeverDecreases;

impl Invariant for FormatVersionNeverDecreases {
    fn name(&self) -> &'static str {
        "format-version-never-decreases"
    }

    fn validate(&self, base: &TableMetadata, next: &TableMetadata) -> InvariantResult {
        if next.format_version < base.format_version {
            InvariantResult::Fail(format!(
                "format version moved from {} to {}",
                base.format_version, next.format_version
            ))
        } else {
            InvariantResult::Pass
        }
    }
}
