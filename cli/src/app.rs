// Request Processing
//
// Parses one tokenized command and runs it against a table under the
// warehouse. Every request opens its own table handle; nothing is shared
// between requests except the configuration and the file inspector.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;

use tidemark_kernel::adapters::files::{FileInspector, LocalFileInspector};
use tidemark_kernel::commit::{CommitCoordinator, CommitError};
use tidemark_kernel::log::{
    FileStore, FormatVersion, SnapshotId, SnapshotOperation, StoreError, TableMetadata,
};
use tidemark_kernel::retry::{Classify, ErrorKind};
use tidemark_kernel::rollback::{rollback, RollbackError, RollbackMode};
use tidemark_kernel::table::Table;
use tidemark_kernel::tags::{TagError, TagManager, TagOrder, TagQuery};
use tidemark_kernel::transaction::{Operation, Transaction, TransactionBuilder, TransactionError};

use crate::config::TidemarkConfig;

const SUCCESS: &str = "Operation successful? true";

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Usage(#[from] clap::Error),

    #[error("invalid table identifier `{0}`; expected <namespace>.<table>")]
    InvalidTableName(String),

    #[error("invalid format version: {0}")]
    InvalidFormatVersion(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error(transparent)]
    Tag(#[from] TagError),

    #[error(transparent)]
    Rollback(#[from] RollbackError),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Classify for AppError {
    fn kind(&self) -> ErrorKind {
        match self {
            AppError::Store(err) => err.kind(),
            AppError::Commit(err) => err.kind(),
            AppError::Tag(err) => err.kind(),
            AppError::Rollback(err) => err.kind(),
            _ => ErrorKind::Other,
        }
    }
}

/// One request, as sent by a client or given on the command line.
#[derive(Parser, Debug)]
#[command(name = "tidemark", no_binary_name = true, disable_help_subcommand = true)]
pub struct Request {
    /// Warehouse directory, overriding the configured one.
    #[arg(long, global = true)]
    pub warehouse: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create an empty table.
    Create {
        table: String,
        /// Table schema as JSON.
        #[arg(long)]
        schema: Option<String>,
        #[arg(long, default_value_t = 1)]
        format_version: u8,
    },

    /// Append data files: {"files": [...]}.
    Commit { table: String, data_files: String },

    /// Replace data files: {"files_to_del": [...], "files_to_add": [...]}.
    Rewrite { table: String, data_files: String },

    /// Commit several operations atomically, optionally tagging each one
    /// `<tag_prefix>-<i>`.
    Transaction {
        table: String,
        transaction_data: String,
        tag_prefix: Option<String>,
    },

    /// Roll back to the checkpoint before a tag.
    Rollback {
        table: String,
        tag: String,
        /// Drop every later checkpoint instead of replaying it.
        #[arg(long)]
        all: bool,
        /// Only move the current snapshot to the tag.
        #[arg(long)]
        force: bool,
    },

    /// Add or look up tags.
    #[command(subcommand)]
    Tag(TagCommand),

    /// Show the current snapshot, or every snapshot.
    Snapshot {
        table: String,
        #[arg(long)]
        all: bool,
    },

    /// List snapshots in commit order.
    History { table: String },

    /// List the data files visible at the current snapshot.
    Files { table: String },

    /// Print the table location.
    Location { table: String },

    /// Print the table uuid.
    Uuid { table: String },

    /// Print the full table metadata.
    Metadata { table: String },

    /// Delete every live data file.
    Truncate { table: String },
}

#[derive(Subcommand, Debug, Clone)]
pub enum TagCommand {
    /// Tag the current snapshot.
    Add { table: String, name: String },

    /// Find the latest tag starting with a prefix.
    Get {
        table: String,
        prefix: String,
        /// List every matching tag.
        #[arg(long)]
        all: bool,
        /// Order by trailing number instead of by name.
        #[arg(long)]
        numeric: bool,
    },
}

#[derive(Debug, Serialize)]
struct HistoryRow<'a> {
    snapshot_id: SnapshotId,
    parent_snapshot_id: Option<SnapshotId>,
    timestamp_ms: i64,
    operation: SnapshotOperation,
    is_current: bool,
    tags: Vec<&'a str>,
}

pub struct Application {
    config: TidemarkConfig,
    inspector: Arc<dyn FileInspector>,
}

impl Application {
    pub fn new(config: TidemarkConfig) -> Self {
        Self::with_inspector(config, Arc::new(LocalFileInspector))
    }

    pub fn with_inspector(config: TidemarkConfig, inspector: Arc<dyn FileInspector>) -> Self {
        Self { config, inspector }
    }

    pub fn config(&self) -> &TidemarkConfig {
        &self.config
    }

    /// Parse and run one tokenized request.
    pub fn process(&self, args: &[String]) -> Result<String, AppError> {
        let request = Request::try_parse_from(args)?;
        self.execute(&request)
    }

    pub fn execute(&self, request: &Request) -> Result<String, AppError> {
        let warehouse = request
            .warehouse
            .as_deref()
            .unwrap_or(self.config.warehouse.as_path());
        let builder = TransactionBuilder::new(self.inspector.as_ref());

        match &request.command {
            Command::Create {
                table,
                schema,
                format_version,
            } => {
                let root = table_root(warehouse, table)?;
                let schema = match schema {
                    Some(schema) => serde_json::from_str(schema)?,
                    None => serde_json::json!({}),
                };
                let format_version = FormatVersion::try_from(*format_version)
                    .map_err(AppError::InvalidFormatVersion)?;
                let metadata = TableMetadata::new(root.display().to_string(), schema)
                    .with_format_version(format_version);
                FileStore::create(&root, &metadata)?;
                Ok(SUCCESS.into())
            }
            Command::Commit { table, data_files } => {
                let mut table = open(warehouse, table)?;
                let txn = builder.commit_files(data_files)?;
                CommitCoordinator::new(&mut table).execute(&txn)?;
                Ok(SUCCESS.into())
            }
            Command::Rewrite { table, data_files } => {
                let mut table = open(warehouse, table)?;
                let txn = builder.rewrite_files(data_files)?;
                CommitCoordinator::new(&mut table).execute(&txn)?;
                Ok(SUCCESS.into())
            }
            Command::Transaction {
                table,
                transaction_data,
                tag_prefix,
            } => {
                let mut table = open(warehouse, table)?;
                let txn = builder.parse(transaction_data, tag_prefix.as_deref())?;
                let outcome = CommitCoordinator::new(&mut table).execute(&txn)?;
                if outcome.tags.is_empty() {
                    Ok(SUCCESS.into())
                } else {
                    Ok(format!("{SUCCESS}; Tags: {}", outcome.tags.join(", ")))
                }
            }
            Command::Rollback {
                table,
                tag,
                all,
                force,
            } => {
                let mut table = open(warehouse, table)?;
                rollback(
                    &mut table,
                    tag,
                    RollbackMode {
                        all: *all,
                        force: *force,
                    },
                )?;
                Ok(SUCCESS.into())
            }
            Command::Tag(TagCommand::Add { table, name }) => {
                let mut table = open(warehouse, table)?;
                TagManager::new(&mut table).create_at_current(name)?;
                Ok(SUCCESS.into())
            }
            Command::Tag(TagCommand::Get {
                table,
                prefix,
                all,
                numeric,
            }) => {
                let mut table = open(warehouse, table)?;
                let order = if *numeric {
                    TagOrder::NumericSuffix
                } else {
                    TagOrder::Lexicographic
                };
                match TagManager::new(&mut table).query(prefix, *all, order)? {
                    TagQuery::Latest(name) => Ok(name),
                    TagQuery::All(names) => Ok(names.join("\n")),
                }
            }
            Command::Snapshot { table, all } => {
                let table = open(warehouse, table)?;
                let metadata = table.metadata();
                if *all {
                    return Ok(serde_json::to_string_pretty(&metadata.snapshots)?);
                }
                let current = metadata
                    .current_snapshot()
                    .ok_or(StoreError::NoCurrentSnapshot)?;
                Ok(serde_json::to_string_pretty(current)?)
            }
            Command::History { table } => {
                let table = open(warehouse, table)?;
                let metadata = table.metadata();
                let rows: Vec<HistoryRow<'_>> = metadata
                    .snapshots
                    .iter()
                    .map(|s| HistoryRow {
                        snapshot_id: s.snapshot_id,
                        parent_snapshot_id: s.parent_snapshot_id,
                        timestamp_ms: s.timestamp_ms,
                        operation: s.operation,
                        is_current: metadata.current_snapshot_id == Some(s.snapshot_id),
                        tags: metadata
                            .tags
                            .iter()
                            .filter(|(_, id)| **id == s.snapshot_id)
                            .map(|(name, _)| name.as_str())
                            .collect(),
                    })
                    .collect();
                Ok(serde_json::to_string_pretty(&rows)?)
            }
            Command::Files { table } => {
                let table = open(warehouse, table)?;
                Ok(table.metadata().live_data_files().join("\n"))
            }
            Command::Location { table } => {
                let table = open(warehouse, table)?;
                Ok(table.metadata().location.clone())
            }
            Command::Uuid { table } => {
                let table = open(warehouse, table)?;
                Ok(table.metadata().table_uuid.to_string())
            }
            Command::Metadata { table } => {
                let table = open(warehouse, table)?;
                Ok(serde_json::to_string_pretty(table.metadata())?)
            }
            Command::Truncate { table } => {
                let mut table = open(warehouse, table)?;
                let paths = table
                    .metadata()
                    .live_data_files()
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                let txn = Transaction::new(vec![Operation::Delete { paths }]);
                CommitCoordinator::new(&mut table).execute(&txn)?;
                Ok(SUCCESS.into())
            }
        }
    }
}

/// Resolve `<namespace>.<table>` to its directory under the warehouse.
fn table_root(warehouse: &Path, identifier: &str) -> Result<PathBuf, AppError> {
    let valid = |part: &str| {
        !part.is_empty()
            && part != "."
            && part != ".."
            && !part.contains(['/', '\\'])
    };
    match identifier.split_once('.') {
        Some((namespace, table)) if valid(namespace) && valid(table) => {
            Ok(warehouse.join(namespace).join(table))
        }
        _ => Err(AppError::InvalidTableName(identifier.into())),
    }
}

fn open(warehouse: &Path, identifier: &str) -> Result<Table<FileStore>, AppError> {
    let store = FileStore::open(table_root(warehouse, identifier)?)?;
    Ok(Table::load(store)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tokenize;

    fn app() -> (tempfile::TempDir, Application) {
        let dir = tempfile::tempdir().unwrap();
        let config = TidemarkConfig {
            warehouse: dir.path().to_path_buf(),
            ..TidemarkConfig::default_config()
        };
        (dir, Application::new(config))
    }

    fn run(app: &Application, line: &str) -> Result<String, AppError> {
        app.process(&tokenize(line).unwrap())
    }

    const FILE: &str =
        r#"{"file_path": "a.parquet", "file_format": "parquet", "file_size_in_bytes": 8, "record_count": 2}"#;

    #[test]
    fn create_commit_and_inspect() {
        let (_dir, app) = app();
        assert_eq!(run(&app, "create db.t").unwrap(), SUCCESS);

        let commit = format!("commit db.t '{{\"files\": [{FILE}]}}'");
        assert_eq!(run(&app, &commit).unwrap(), SUCCESS);

        let snapshot: serde_json::Value =
            serde_json::from_str(&run(&app, "snapshot db.t").unwrap()).unwrap();
        assert_eq!(snapshot["operation"], "append");

        let history: Vec<serde_json::Value> =
            serde_json::from_str(&run(&app, "history db.t").unwrap()).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["is_current"], true);
    }

    #[test]
    fn transaction_tags_and_query() {
        let (_dir, app) = app();
        run(&app, "create db.t").unwrap();

        let ops = format!(
            r#"[{{"op": "append", "files_to_add": [{FILE}]}}, {{"op": "fastappend", "files_to_add": [{FILE}]}}]"#
        );
        let out = run(&app, &format!("transaction db.t '{ops}' ckpt")).unwrap();
        assert_eq!(out, format!("{SUCCESS}; Tags: ckpt-0, ckpt-1"));

        assert_eq!(run(&app, "tag get db.t ckpt").unwrap(), "ckpt-1");
        assert_eq!(run(&app, "tag get db.t ckpt --all").unwrap(), "ckpt-0\nckpt-1");
    }

    #[test]
    fn truncate_removes_live_files() {
        let (dir, app) = app();
        run(&app, "create db.t").unwrap();
        run(&app, &format!("commit db.t '{{\"files\": [{FILE}]}}'")).unwrap();
        assert_eq!(run(&app, "truncate db.t").unwrap(), SUCCESS);

        let table = open(dir.path(), "db.t").unwrap();
        assert!(table.metadata().live_data_files().is_empty());
        assert_eq!(table.metadata().snapshots.len(), 2);
    }

    #[test]
    fn inspect_files_location_and_metadata() {
        let (dir, app) = app();
        run(&app, "create db.t").unwrap();
        assert_eq!(run(&app, "files db.t").unwrap(), "");

        let second = FILE.replace("a.parquet", "b.parquet");
        run(&app, &format!("commit db.t '{{\"files\": [{FILE}, {second}]}}'")).unwrap();
        assert_eq!(run(&app, "files db.t").unwrap(), "a.parquet\nb.parquet");

        let root = dir.path().join("db").join("t");
        assert_eq!(run(&app, "location db.t").unwrap(), root.display().to_string());

        let uuid = run(&app, "uuid db.t").unwrap();
        assert_eq!(uuid.len(), 36);
        assert_eq!(uuid.matches('-').count(), 4);

        let metadata: TableMetadata =
            serde_json::from_str(&run(&app, "metadata db.t").unwrap()).unwrap();
        assert_eq!(metadata.table_uuid.to_string(), uuid);
        assert_eq!(metadata.snapshots.len(), 1);
        assert_eq!(metadata.live_data_files(), vec!["a.parquet", "b.parquet"]);

        assert!(matches!(
            run(&app, "files db.missing"),
            Err(AppError::Store(StoreError::TableNotFound(_)))
        ));
    }

    #[test]
    fn bad_requests() {
        let (_dir, app) = app();
        assert!(matches!(run(&app, "frobnicate db.t"), Err(AppError::Usage(_))));
        assert!(matches!(run(&app, "history nodot"), Err(AppError::InvalidTableName(_))));
        assert!(matches!(run(&app, "history ../x"), Err(AppError::InvalidTableName(_))));
        assert!(matches!(
            run(&app, "history db.missing"),
            Err(AppError::Store(StoreError::TableNotFound(_)))
        ));
        assert!(matches!(
            run(&app, "create db.t --format-version 3"),
            Err(AppError::InvalidFormatVersion(_))
        ));

        run(&app, "create db.t").unwrap();
        assert!(matches!(
            run(&app, "create db.t"),
            Err(AppError::Store(StoreError::TableAlreadyExists(_)))
        ));
    }

    #[test]
    fn store_conflicts_classify_for_retry() {
        let err = AppError::Commit(CommitError::Store(StoreError::Conflict {
            expected: 1,
            actual: 2,
        }));
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(AppError::InvalidTableName("x".into()).kind(), ErrorKind::Other);
    }
}
