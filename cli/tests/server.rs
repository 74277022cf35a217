use std::time::Duration;

use tokio::sync::oneshot;

use tidemark::app::Application;
use tidemark::config::TidemarkConfig;
use tidemark::protocol::{self, Response};
use tidemark::server::Server;

const FILE: &str =
    r#"{"file_path": "a.parquet", "file_format": "parquet", "file_size_in_bytes": 8, "record_count": 2}"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = TidemarkConfig::default_config();
    config.warehouse = dir.path().to_path_buf();
    config.server.bind = "127.0.0.1:0".into();
    config.server.shutdown_timeout_secs = 5;

    let server = Server::bind(Application::new(config)).await.unwrap();
    let address = server.local_addr().unwrap().to_string();
    let (stop, stopped) = oneshot::channel::<()>();
    let running = tokio::spawn(server.run(async {
        let _ = stopped.await;
    }));

    let ok = |payload: &str| Response::ok(payload);
    assert_eq!(
        protocol::send(&address, "create db.events").await.unwrap(),
        ok("Operation successful? true")
    );

    let commit = format!("commit db.events '{{\"files\": [{FILE}]}}'");
    assert!(!protocol::send(&address, &commit).await.unwrap().is_error);

    // Concurrent writers on the same table all succeed through retries.
    let writers: Vec<_> = (0..4)
        .map(|i| {
            let address = address.clone();
            let ops = format!(r#"[{{"op": "append", "files_to_add": [{FILE}]}}]"#);
            tokio::spawn(async move {
                protocol::send(&address, &format!("transaction db.events '{ops}' w{i}")).await
            })
        })
        .collect();
    for writer in writers {
        let response = writer.await.unwrap().unwrap();
        assert!(!response.is_error, "{}", response.payload);
    }

    let history = protocol::send(&address, "history db.events").await.unwrap();
    let rows: Vec<serde_json::Value> = serde_json::from_str(&history.payload).unwrap();
    assert_eq!(rows.len(), 5);

    let missing = protocol::send(&address, "rollback db.events nope").await.unwrap();
    assert!(missing.is_error);

    stop.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
