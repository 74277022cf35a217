// Transaction Builder
//
// Parses the textual description of one or more file-level operations
// into a `Transaction`. Building touches no table metadata; the only I/O
// is resolving file descriptors through the file inspector.

use serde::Deserialize;

use crate::adapters::files::{
    resolve_data_file, resolve_delete_file, DataFile, DataFileRef, DeleteFile, FileInferenceError,
    FileInspector,
};
use crate::log::{FileChanges, SnapshotId, SnapshotOperation, StoreError};
use crate::retry::{Classify, ErrorKind};
use crate::state::{MetadataBuilder, Validation};

/// Kind of a single operation, as named in request JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Append,
    FastAppend,
    Delete,
    Overwrite,
    Rewrite,
    RowDelta,
}

impl OperationKind {
    pub fn parse(name: &str) -> Result<Self, TransactionError> {
        match name.to_ascii_lowercase().as_str() {
            "append" => Ok(Self::Append),
            "fastappend" => Ok(Self::FastAppend),
            "delete" => Ok(Self::Delete),
            "overwrite" => Ok(Self::Overwrite),
            "rewrite" => Ok(Self::Rewrite),
            "rowdelta" => Ok(Self::RowDelta),
            _ => Err(TransactionError::InvalidOperationKind(name.into())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Append => "append",
            Self::FastAppend => "fastappend",
            Self::Delete => "delete",
            Self::Overwrite => "overwrite",
            Self::Rewrite => "rewrite",
            Self::RowDelta => "rowdelta",
        }
    }
}

/// One typed file-level operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Append { files: Vec<DataFile> },
    FastAppend { files: Vec<DataFile> },
    Delete { paths: Vec<String> },
    /// Replace files without asserting equivalence.
    Overwrite { remove: Vec<String>, add: Vec<DataFile> },
    /// Replace files with logically equivalent ones.
    Rewrite { remove: Vec<String>, add: Vec<DataFile> },
    RowDelta { deletes: Vec<DeleteFile>, add: Vec<DataFile> },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Append { .. } => OperationKind::Append,
            Operation::FastAppend { .. } => OperationKind::FastAppend,
            Operation::Delete { .. } => OperationKind::Delete,
            Operation::Overwrite { .. } => OperationKind::Overwrite,
            Operation::Rewrite { .. } => OperationKind::Rewrite,
            Operation::RowDelta { .. } => OperationKind::RowDelta,
        }
    }

    /// Apply this operation to a pending update, returning the id of the
    /// snapshot it produces.
    pub fn stage(&self, update: &mut MetadataBuilder) -> Result<SnapshotId, StoreError> {
        match self {
            Operation::Append { files } => update.add_snapshot(
                SnapshotOperation::Append,
                FileChanges {
                    added_data_files: files.clone(),
                    ..Default::default()
                },
                Validation::None,
            ),
            Operation::FastAppend { files } => update.add_snapshot_with(
                SnapshotOperation::Append,
                FileChanges {
                    added_data_files: files.clone(),
                    ..Default::default()
                },
                Validation::None,
                &[("manifest-merge", "false".to_string())],
            ),
            Operation::Delete { paths } => update.add_snapshot(
                SnapshotOperation::Delete,
                FileChanges {
                    removed_data_files: paths.clone(),
                    ..Default::default()
                },
                Validation::None,
            ),
            Operation::Overwrite { remove, add } => update.add_snapshot(
                SnapshotOperation::Overwrite,
                FileChanges {
                    added_data_files: add.clone(),
                    removed_data_files: remove.clone(),
                    ..Default::default()
                },
                Validation::None,
            ),
            Operation::Rewrite { remove, add } => update.add_snapshot(
                SnapshotOperation::Replace,
                FileChanges {
                    added_data_files: add.clone(),
                    removed_data_files: remove.clone(),
                    ..Default::default()
                },
                Validation::RequireRemovedFiles,
            ),
            Operation::RowDelta { deletes, add } => update.add_snapshot(
                SnapshotOperation::Overwrite,
                FileChanges {
                    added_data_files: add.clone(),
                    added_delete_files: deletes.clone(),
                    ..Default::default()
                },
                Validation::None,
            ),
        }
    }
}

/// Ordered operations committed as one all-or-nothing unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub operations: Vec<Operation>,

    /// When set, the snapshot of operation `i` is tagged `<prefix>-<i>`.
    pub tag_prefix: Option<String>,
}

impl Transaction {
    pub fn new(operations: Vec<Operation>) -> Self {
        Self {
            operations,
            tag_prefix: None,
        }
    }

    pub fn with_tag_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.tag_prefix = Some(prefix.into());
        self
    }

    pub fn tag_name(prefix: &str, index: usize) -> String {
        format!("{prefix}-{index}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("invalid operation: {0}")]
    InvalidOperationKind(String),

    #[error("operation {index} ({kind}) is missing `{field}`")]
    MissingField {
        index: usize,
        kind: &'static str,
        field: &'static str,
    },

    #[error("transaction has no operations")]
    Empty,

    #[error("malformed transaction data: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    FileInference(#[from] FileInferenceError),
}

impl Classify for TransactionError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

#[derive(Debug, Deserialize)]
struct RawOperation {
    op: String,

    #[serde(default)]
    files_to_add: Option<Vec<DataFileRef>>,

    #[serde(default)]
    files_to_del: Option<Vec<DataFileRef>>,
}

#[derive(Debug, Deserialize)]
struct RawFileSet {
    files: Vec<DataFileRef>,
}

#[derive(Debug, Deserialize)]
struct RawRewrite {
    files_to_del: Vec<DataFileRef>,
    files_to_add: Vec<DataFileRef>,
}

/// Builds transactions, resolving file descriptors through an inspector.
pub struct TransactionBuilder<'a> {
    inspector: &'a dyn FileInspector,
}

impl<'a> TransactionBuilder<'a> {
    pub fn new(inspector: &'a dyn FileInspector) -> Self {
        Self { inspector }
    }

    /// Parse a JSON array of `{"op", "files_to_add", "files_to_del"}`.
    pub fn parse(
        &self,
        transaction_data: &str,
        tag_prefix: Option<&str>,
    ) -> Result<Transaction, TransactionError> {
        let raw: Vec<RawOperation> = serde_json::from_str(transaction_data)?;
        if raw.is_empty() {
            return Err(TransactionError::Empty);
        }

        let operations = raw
            .into_iter()
            .enumerate()
            .map(|(index, op)| self.operation(index, op))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Transaction {
            operations,
            tag_prefix: tag_prefix.map(str::to_string),
        })
    }

    /// Parse `{"files": [...]}` into a single append.
    pub fn commit_files(&self, data_files: &str) -> Result<Transaction, TransactionError> {
        let raw: RawFileSet = serde_json::from_str(data_files)?;
        Ok(Transaction::new(vec![Operation::Append {
            files: self.data_files(&raw.files)?,
        }]))
    }

    /// Parse `{"files_to_del": [...], "files_to_add": [...]}` into a
    /// single rewrite.
    pub fn rewrite_files(&self, data_files: &str) -> Result<Transaction, TransactionError> {
        let raw: RawRewrite = serde_json::from_str(data_files)?;
        Ok(Transaction::new(vec![Operation::Rewrite {
            remove: paths(&raw.files_to_del),
            add: self.data_files(&raw.files_to_add)?,
        }]))
    }

    fn operation(&self, index: usize, raw: RawOperation) -> Result<Operation, TransactionError> {
        let kind = OperationKind::parse(&raw.op)?;
        let required = |files: Option<Vec<DataFileRef>>, field: &'static str| {
            files.ok_or(TransactionError::MissingField {
                index,
                kind: kind.as_str(),
                field,
            })
        };

        let operation = match kind {
            OperationKind::Append => Operation::Append {
                files: self.data_files(&required(raw.files_to_add, "files_to_add")?)?,
            },
            OperationKind::FastAppend => Operation::FastAppend {
                files: self.data_files(&required(raw.files_to_add, "files_to_add")?)?,
            },
            OperationKind::Delete => Operation::Delete {
                paths: paths(&required(raw.files_to_del, "files_to_del")?),
            },
            OperationKind::Overwrite => Operation::Overwrite {
                remove: paths(&required(raw.files_to_del, "files_to_del")?),
                add: self.data_files(&required(raw.files_to_add, "files_to_add")?)?,
            },
            OperationKind::Rewrite => Operation::Rewrite {
                remove: paths(&required(raw.files_to_del, "files_to_del")?),
                add: self.data_files(&required(raw.files_to_add, "files_to_add")?)?,
            },
            OperationKind::RowDelta => Operation::RowDelta {
                deletes: self.delete_files(&required(raw.files_to_del, "files_to_del")?)?,
                add: self.data_files(&raw.files_to_add.unwrap_or_default())?,
            },
        };

        tracing::debug!(index, kind = kind.as_str(), "parsed operation");
        Ok(operation)
    }

    fn data_files(&self, hints: &[DataFileRef]) -> Result<Vec<DataFile>, TransactionError> {
        hints
            .iter()
            .map(|hint| resolve_data_file(self.inspector, hint).map_err(Into::into))
            .collect()
    }

    fn delete_files(&self, hints: &[DataFileRef]) -> Result<Vec<DeleteFile>, TransactionError> {
        hints
            .iter()
            .map(|hint| resolve_delete_file(self.inspector, hint).map_err(Into::into))
            .collect()
    }
}

fn paths(hints: &[DataFileRef]) -> Vec<String> {
    hints.iter().map(|h| h.file_path.clone()).collect()
}
