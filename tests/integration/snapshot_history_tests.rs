//! Integration tests for snapshot capture, indexing, and trimming.

use std::sync::Arc;

use forkbench::orchestrator::snapshot_manager::{SnapshotManager, SnapshotRequest};
use forkbench::persistence::{MemStore, StateStore};
use forkbench::rpc::RpcClient;

use super::test_helpers::spawn_mock_node;

fn mem_store() -> Arc<dyn StateStore> {
    Arc::new(MemStore::new())
}

fn request(task_id: Option<&str>) -> SnapshotRequest {
    SnapshotRequest {
        fork_id: "f1".into(),
        task_id: task_id.map(ToOwned::to_owned),
        description: None,
    }
}

#[tokio::test]
async fn create_assigns_monotone_sequence_numbers() {
    let node = spawn_mock_node(100).await;
    let rpc = RpcClient::new(&node.url);
    let mut snapshots = SnapshotManager::new("s1".into(), mem_store());

    let first = snapshots.create(request(None), &rpc).await.expect("first");
    let second = snapshots
        .create(request(Some("task-a")), &rpc)
        .await
        .expect("second");

    assert_eq!(first.seq, 1);
    assert_eq!(second.seq, 2);
    assert_eq!(first.block_number, 100);
    assert_eq!(snapshots.latest().expect("latest").seq, 2);
    assert_eq!(snapshots.for_task("task-a").expect("indexed").seq, 2);
    assert_eq!(snapshots.seq_of(&second.id), Some(2));
}

#[tokio::test]
async fn history_reloads_with_sequence_continuation() {
    let node = spawn_mock_node(7).await;
    let rpc = RpcClient::new(&node.url);
    let store = mem_store();

    let mut snapshots = SnapshotManager::new("s1".into(), Arc::clone(&store));
    snapshots.create(request(None), &rpc).await.expect("one");
    snapshots
        .create(request(Some("task-b")), &rpc)
        .await
        .expect("two");

    let mut reloaded = SnapshotManager::load("s1".into(), store);
    assert_eq!(reloaded.list().len(), 2);
    assert_eq!(reloaded.for_task("task-b").expect("indexed").seq, 2);

    let third = reloaded.create(request(None), &rpc).await.expect("three");
    assert_eq!(third.seq, 3, "sequence resumes past persisted history");
}

#[tokio::test]
async fn cleanup_keeps_only_most_recent() {
    let node = spawn_mock_node(7).await;
    let rpc = RpcClient::new(&node.url);
    let store = mem_store();
    let mut snapshots = SnapshotManager::new("s1".into(), Arc::clone(&store));

    for _ in 0..5 {
        snapshots.create(request(None), &rpc).await.expect("create");
    }
    let removed = snapshots.cleanup(2).expect("cleanup");
    assert_eq!(removed, 3);

    let seqs: Vec<u64> = snapshots.list().iter().map(|snapshot| snapshot.seq).collect();
    assert_eq!(seqs, vec![4, 5]);

    // On-disk records follow the in-memory trim.
    assert_eq!(
        store.list("snapshots/s1"),
        vec!["0000000004".to_owned(), "0000000005".to_owned()]
    );
}

#[tokio::test]
async fn cleanup_below_threshold_is_a_no_op() {
    let node = spawn_mock_node(7).await;
    let rpc = RpcClient::new(&node.url);
    let mut snapshots = SnapshotManager::new("s1".into(), mem_store());

    snapshots.create(request(None), &rpc).await.expect("create");
    assert_eq!(snapshots.cleanup(10).expect("cleanup"), 0);
    assert_eq!(snapshots.list().len(), 1);
}

#[tokio::test]
async fn revert_passes_token_through() {
    let node = spawn_mock_node(7).await;
    let rpc = RpcClient::new(&node.url);
    let mut snapshots = SnapshotManager::new("s1".into(), mem_store());

    let snapshot = snapshots.create(request(None), &rpc).await.expect("create");
    assert!(snapshots.revert(&rpc, &snapshot.id).await.expect("revert"));
    assert_eq!(
        node.state.lock().expect("state").reverted,
        vec![snapshot.id]
    );
}
