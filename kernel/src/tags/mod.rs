// Tag Manager
//
// Named checkpoints along the table's history. Every mutation is a
// single metadata commit.

use crate::log::{MetadataStore, SnapshotId, StoreError};
use crate::retry::{Classify, ErrorKind};
use crate::table::Table;

#[derive(Debug, thiserror::Error)]
pub enum TagError {
    #[error("tag `{0}` not found in the table")]
    TagNotFound(String),

    #[error("no tag matches prefix `{0}`")]
    NoMatchingTag(String),

    #[error("table has no current snapshot to tag")]
    NoSnapshot,

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for TagError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TagNotFound(name) => TagError::TagNotFound(name),
            other => TagError::Store(other),
        }
    }
}

impl Classify for TagError {
    fn kind(&self) -> ErrorKind {
        match self {
            TagError::Store(err) => err.kind(),
            _ => ErrorKind::Other,
        }
    }
}

/// How `query` picks the most recent of several matching tags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TagOrder {
    /// Greatest name by string comparison. `run-9` sorts after `run-10`.
    #[default]
    Lexicographic,

    /// Greatest trailing integer, falling back to string comparison for
    /// names without one.
    NumericSuffix,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagQuery {
    Latest(String),
    All(Vec<String>),
}

fn numeric_suffix(name: &str) -> Option<u64> {
    let digits = name.len() - name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    name[name.len() - digits..].parse().ok()
}

pub struct TagManager<'a, S: MetadataStore> {
    table: &'a mut Table<S>,
}

impl<'a, S: MetadataStore> TagManager<'a, S> {
    pub fn new(table: &'a mut Table<S>) -> Self {
        Self { table }
    }

    pub fn create(&mut self, name: &str, snapshot_id: SnapshotId) -> Result<(), TagError> {
        self.table.refresh()?;
        let mut update = self.table.new_update();
        update.create_tag(name, snapshot_id)?;
        self.table.commit(update)?;
        tracing::info!(tag = name, snapshot_id, "tag added");
        Ok(())
    }

    /// Tag the current snapshot.
    pub fn create_at_current(&mut self, name: &str) -> Result<SnapshotId, TagError> {
        let snapshot_id = self
            .table
            .refresh()?
            .current_snapshot_id
            .ok_or(TagError::NoSnapshot)?;
        self.create(name, snapshot_id)?;
        Ok(snapshot_id)
    }

    pub fn replace(&mut self, name: &str, snapshot_id: SnapshotId) -> Result<(), TagError> {
        self.table.refresh()?;
        let mut update = self.table.new_update();
        update.replace_tag(name, snapshot_id)?;
        self.table.commit(update)?;
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<(), TagError> {
        self.table.refresh()?;
        let mut update = self.table.new_update();
        update.remove_tag(name)?;
        self.table.commit(update)?;
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<SnapshotId, TagError> {
        self.table
            .tags()
            .get(name)
            .copied()
            .ok_or_else(|| TagError::TagNotFound(name.into()))
    }

    /// Find tags starting with `prefix`: every match when `all`, otherwise
    /// the most recent one according to `order`.
    pub fn query(&mut self, prefix: &str, all: bool, order: TagOrder) -> Result<TagQuery, TagError> {
        self.table.refresh()?;
        // BTreeMap keys are already in lexicographic order.
        let matches: Vec<String> = self
            .table
            .tags()
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();

        if matches.is_empty() {
            return Err(TagError::NoMatchingTag(prefix.into()));
        }
        if all {
            return Ok(TagQuery::All(matches));
        }

        let latest = match order {
            TagOrder::Lexicographic => matches.into_iter().max(),
            TagOrder::NumericSuffix => matches
                .into_iter()
                .max_by(|a, b| (numeric_suffix(a), a).cmp(&(numeric_suffix(b), b))),
        };
        latest
            .map(TagQuery::Latest)
            .ok_or_else(|| TagError::NoMatchingTag(prefix.into()))
    }
}
