//! Concurrent upsert/delete against one on-disk database.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tempfile::TempDir;

use flowrun::id::Id;
use flowrun::storage::{DurableWriter, ExecutionStore, NodeExecution, SqliteStorage};
use flowrun::workflow::NodeState;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_upsert_survives_concurrent_delete() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(SqliteStorage::open(&dir.path().join("race.db")).unwrap());
    let store: Arc<dyn ExecutionStore> = storage.clone();
    let writer = DurableWriter::new(store.clone());
    let node_id = Id::new();

    let stop = Arc::new(AtomicBool::new(false));
    let deleter = {
        let store = store.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            while !stop.load(Ordering::SeqCst) {
                let _ = store.delete_by_node_id(node_id).await;
                tokio::task::yield_now().await;
            }
        })
    };

    let mut handles = Vec::with_capacity(1000);
    for i in 0..1000 {
        let writer = writer.clone();
        handles.push(tokio::spawn(async move {
            let mut record = NodeExecution::running(Id::new(), node_id, format!("n{}", i));
            record.close(NodeState::Success, None);
            writer.upsert(&record).await
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => succeeded += 1,
            Err(e) => {
                let message = e.to_string().to_lowercase();
                assert!(
                    !message.contains("no rows"),
                    "upsert must never report a missing row: {}",
                    message
                );
            }
        }
    }
    stop.store(true, Ordering::SeqCst);
    deleter.await.unwrap();

    assert!(succeeded >= 700, "only {} of 1000 upserts succeeded", succeeded);

    // A row deleted underneath a later upsert is simply written again.
    let mut record = NodeExecution::running(Id::new(), node_id, "late");
    writer.upsert(&record).await.unwrap();
    store.delete_by_node_id(node_id).await.unwrap();
    record.close(NodeState::Failure, Some("boom".into()));
    writer.upsert(&record).await.unwrap();
    let stored = store.get(record.id).await.unwrap();
    assert_eq!(stored.state, NodeState::Failure);
    assert_eq!(stored.error.as_deref(), Some("boom"));
}
