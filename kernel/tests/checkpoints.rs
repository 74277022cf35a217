use tidemark_kernel::adapters::files::LocalFileInspector;
use tidemark_kernel::commit::CommitCoordinator;
use tidemark_kernel::log::{FileStore, MetadataStore, TableMetadata};
use tidemark_kernel::rollback::{rollback, RollbackError, RollbackMode};
use tidemark_kernel::table::Table;
use tidemark_kernel::tags::{TagManager, TagOrder, TagQuery};
use tidemark_kernel::transaction::TransactionBuilder;

fn file(path: &str) -> String {
    format!(
        r#"{{"file_path": "{path}", "file_format": "parquet", "file_size_in_bytes": 128, "record_count": 4}}"#
    )
}

#[test]
fn checkpointed_transaction_survives_rollback() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("db").join("events");
    let store = FileStore::create(
        &root,
        &TableMetadata::new(root.display().to_string(), serde_json::json!({"type": "struct"})),
    )
    .unwrap();
    let mut table = Table::load(store).unwrap();
    let inspector = LocalFileInspector;
    let builder = TransactionBuilder::new(&inspector);

    // Base commit and its checkpoint.
    let base = builder
        .commit_files(&format!(
            r#"{{"files": [{}, {}]}}"#,
            file("base-1.parquet"),
            file("base-2.parquet")
        ))
        .unwrap();
    CommitCoordinator::new(&mut table).execute(&base).unwrap();
    let base_id = TagManager::new(&mut table).create_at_current("base").unwrap();

    // Two operations, two checkpoints, one commit.
    let txn = builder
        .parse(
            &format!(
                r#"[{{"op": "append", "files_to_add": [{}]}},
                    {{"op": "delete", "files_to_del": [{}]}}]"#,
                file("c0.parquet"),
                file("base-2.parquet")
            ),
            Some("ckpt"),
        )
        .unwrap();
    let outcome = CommitCoordinator::new(&mut table).execute(&txn).unwrap();
    assert_eq!(outcome.tags, vec!["ckpt-0", "ckpt-1"]);
    let old_ckpt1 = outcome.snapshot_ids[1];
    assert_eq!(table.metadata().live_data_files(), vec!["base-1.parquet", "c0.parquet"]);

    let latest = TagManager::new(&mut table)
        .query("ckpt", false, TagOrder::default())
        .unwrap();
    assert_eq!(latest, TagQuery::Latest("ckpt-1".into()));

    // Undo the append of ckpt-0; the delete of ckpt-1 is replayed.
    let undone = rollback(&mut table, "ckpt-0", RollbackMode::default()).unwrap();
    assert_eq!(undone.target, base_id);

    let reopened = FileStore::open(&root).unwrap().load().unwrap();
    let new_ckpt1 = reopened.tags["ckpt-1"];
    assert_ne!(new_ckpt1, old_ckpt1);
    assert!(!reopened.tags.contains_key("ckpt-0"));
    assert_eq!(reopened.tags["base"], base_id);
    assert_eq!(reopened.current_snapshot_id, Some(new_ckpt1));
    assert_eq!(reopened.live_data_files(), vec!["base-1.parquet"]);
    assert!(reopened.tags.values().all(|id| reopened.ancestors().contains(id)));

    // A second rollback sees only the rewritten lineage: the undone append
    // does not come back.
    let second = rollback(&mut table, "ckpt-1", RollbackMode::default()).unwrap();
    assert_eq!(second.target, base_id);
    assert!(second.replayed.is_empty());

    let reopened = FileStore::open(&root).unwrap().load().unwrap();
    assert_eq!(reopened.tags.keys().collect::<Vec<_>>(), vec!["base"]);
    assert_eq!(reopened.current_snapshot_id, Some(base_id));
    assert_eq!(
        reopened.live_data_files(),
        vec!["base-1.parquet", "base-2.parquet"]
    );
}

#[test]
fn first_checkpoint_is_kept() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("t");
    let store = FileStore::create(&root, &TableMetadata::new("t", serde_json::json!({}))).unwrap();
    let mut table = Table::load(store).unwrap();
    let inspector = LocalFileInspector;

    let txn = TransactionBuilder::new(&inspector)
        .parse(
            &format!(r#"[{{"op": "append", "files_to_add": [{}]}}]"#, file("a.parquet")),
            Some("run"),
        )
        .unwrap();
    CommitCoordinator::new(&mut table).execute(&txn).unwrap();
    let before = table.store().load().unwrap();

    let err = rollback(&mut table, "run-0", RollbackMode::default()).unwrap_err();
    assert!(matches!(err, RollbackError::CannotRollbackFirstCheckpoint(_)));
    assert_eq!(table.store().load().unwrap().version, before.version);
}
