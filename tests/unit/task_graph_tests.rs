//! Unit tests for the task dependency graph: cycle rejection, runnability,
//! blocking propagation, and recovery-point search.

use std::sync::Arc;

use forkbench::models::task::{Task, TaskKind, TaskStatus};
use forkbench::orchestrator::task_graph::TaskGraph;
use forkbench::persistence::{MemStore, StateStore};
use forkbench::AppError;
use serde_json::json;

fn mem_store() -> Arc<dyn StateStore> {
    Arc::new(MemStore::new())
}

fn task(id: &str, deps: &[&str]) -> Task {
    Task::with_id(
        id.into(),
        TaskKind::Generate,
        deps.iter().map(|&d| d.to_owned()).collect(),
        json!({}),
    )
}

// ── Cycle rejection ──────────────────────────────────────────

#[test]
fn self_dependency_is_rejected() {
    let store = mem_store();
    let mut graph = TaskGraph::new("s1".into(), store, true);
    let result = graph.add_task(task("a", &["a"]));
    assert!(matches!(result, Err(AppError::Validation(_))));
    assert!(graph.is_empty());
}

#[test]
fn closing_a_cycle_is_rejected_and_graph_unchanged() {
    let store = mem_store();
    let mut graph = TaskGraph::new("s1".into(), Arc::clone(&store), true);

    // "a" may depend on a not-yet-inserted "b"; inserting "b" depending
    // on "a" would close the loop.
    graph.add_task(task("a", &["b"])).expect("add a");
    let persisted_before = store.load("graphs/s1").expect("doc");

    let result = graph.add_task(task("b", &["a"]));
    assert!(matches!(result, Err(AppError::Validation(_))));

    assert_eq!(graph.len(), 1);
    assert!(graph.get("b").is_none());
    let persisted_after = store.load("graphs/s1").expect("doc");
    assert_eq!(persisted_before, persisted_after);
}

#[test]
fn transitive_cycle_is_rejected() {
    let store = mem_store();
    let mut graph = TaskGraph::new("s1".into(), store, false);
    graph.add_task(task("a", &[])).expect("add a");
    graph.add_task(task("b", &["a"])).expect("add b");
    graph.add_task(task("c", &["b", "d"])).expect("add c");

    // d -> c -> b -> a, and c already depends on d: inserting d closes it.
    let result = graph.add_task(task("d", &["c"]));
    assert!(matches!(result, Err(AppError::Validation(_))));
}

#[test]
fn duplicate_id_is_rejected() {
    let store = mem_store();
    let mut graph = TaskGraph::new("s1".into(), store, false);
    graph.add_task(task("a", &[])).expect("add a");
    let result = graph.add_task(task("a", &[]));
    assert!(matches!(result, Err(AppError::Validation(_))));
}

// ── Runnability ──────────────────────────────────────────────

#[test]
fn can_run_requires_pending_and_complete_deps() {
    let store = mem_store();
    let mut graph = TaskGraph::new("s1".into(), store, false);
    graph.add_task(task("a", &[])).expect("add a");
    graph.add_task(task("b", &["a"])).expect("add b");

    assert!(graph.can_run("a"));
    assert!(!graph.can_run("b"), "dependency not complete yet");

    graph
        .update_status("a", TaskStatus::Complete)
        .expect("complete a");
    assert!(!graph.can_run("a"), "no longer pending");
    assert!(graph.can_run("b"));

    graph
        .update_status("b", TaskStatus::Running)
        .expect("run b");
    assert!(!graph.can_run("b"), "running is not pending");
}

#[test]
fn can_run_is_false_for_unknown_or_dangling() {
    let store = mem_store();
    let mut graph = TaskGraph::new("s1".into(), store, false);
    graph.add_task(task("a", &["ghost"])).expect("add a");
    assert!(!graph.can_run("a"), "dangling dependency never completes");
    assert!(!graph.can_run("nope"));
}

#[test]
fn next_runnable_follows_insertion_order() {
    let store = mem_store();
    let mut graph = TaskGraph::new("s1".into(), store, false);
    graph.add_task(task("late", &[])).expect("add");
    graph.add_task(task("early", &[])).expect("add");

    // Both runnable; insertion order decides.
    assert_eq!(graph.next_runnable().expect("runnable").id, "late");

    graph
        .update_status("late", TaskStatus::Running)
        .expect("run");
    assert_eq!(graph.next_runnable().expect("runnable").id, "early");

    graph
        .update_status("early", TaskStatus::Running)
        .expect("run");
    assert!(graph.next_runnable().is_none());
}

// ── Setters ──────────────────────────────────────────────────

#[test]
fn setters_fail_for_unknown_task() {
    let store = mem_store();
    let mut graph = TaskGraph::new("s1".into(), store, false);
    assert!(matches!(
        graph.update_status("ghost", TaskStatus::Running),
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        graph.set_snapshot("ghost", "0x1".into()),
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        graph.set_output("ghost", json!(1)),
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        graph.set_error("ghost", "boom".into()),
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        graph.propagate_blocked("ghost"),
        Err(AppError::NotFound(_))
    ));
}

#[test]
fn set_error_forces_failed_status() {
    let store = mem_store();
    let mut graph = TaskGraph::new("s1".into(), store, false);
    graph.add_task(task("a", &[])).expect("add");
    graph
        .update_status("a", TaskStatus::Running)
        .expect("run");
    graph.set_error("a", "rpc timed out".into()).expect("error");

    let a = graph.get("a").expect("a");
    assert_eq!(a.status, TaskStatus::Failed);
    assert_eq!(a.error.as_deref(), Some("rpc timed out"));
}

#[test]
fn completing_stamps_completed_at() {
    let store = mem_store();
    let mut graph = TaskGraph::new("s1".into(), store, false);
    graph.add_task(task("a", &[])).expect("add");
    graph
        .update_status("a", TaskStatus::Complete)
        .expect("complete");
    assert!(graph.get("a").expect("a").completed_at.is_some());
}

// ── Blocking propagation ─────────────────────────────────────

#[test]
fn propagate_blocked_marks_exactly_transitive_pending_dependents() {
    let store = mem_store();
    let mut graph = TaskGraph::new("s1".into(), store, false);
    graph.add_task(task("a", &[])).expect("add");
    graph.add_task(task("b", &["a"])).expect("add");
    graph.add_task(task("c", &["b"])).expect("add");
    graph.add_task(task("d", &["b"])).expect("add");
    graph.add_task(task("unrelated", &[])).expect("add");

    // One dependent is already running; it must be left alone.
    graph
        .update_status("d", TaskStatus::Running)
        .expect("run d");

    graph.propagate_blocked("a").expect("propagate");

    assert_eq!(graph.get("a").expect("a").status, TaskStatus::Pending);
    assert_eq!(graph.get("b").expect("b").status, TaskStatus::Blocked);
    assert_eq!(graph.get("c").expect("c").status, TaskStatus::Blocked);
    assert_eq!(graph.get("d").expect("d").status, TaskStatus::Running);
    assert_eq!(
        graph.get("unrelated").expect("unrelated").status,
        TaskStatus::Pending
    );
    assert!(graph.has_blocked());
}

#[test]
fn propagate_blocked_is_idempotent() {
    let store = mem_store();
    let mut graph = TaskGraph::new("s1".into(), store, false);
    graph.add_task(task("a", &[])).expect("add");
    graph.add_task(task("b", &["a"])).expect("add");

    graph.propagate_blocked("a").expect("first");
    graph.propagate_blocked("a").expect("second");
    assert_eq!(graph.get("b").expect("b").status, TaskStatus::Blocked);
}

// ── Recovery point ───────────────────────────────────────────

#[test]
fn find_recovery_point_prefers_most_recent_snapshot_bearing_ancestor() {
    let store = mem_store();
    let mut graph = TaskGraph::new("s1".into(), store, false);
    graph.add_task(task("a", &[])).expect("add");
    graph.add_task(task("b", &["a"])).expect("add");
    graph.add_task(task("c", &["a", "b"])).expect("add");

    graph
        .update_status("a", TaskStatus::Complete)
        .expect("complete a");
    graph.set_snapshot("a", "0x1".into()).expect("snap a");
    graph
        .update_status("b", TaskStatus::Complete)
        .expect("complete b");
    graph.set_snapshot("b", "0x2".into()).expect("snap b");

    // "b" was created after "a", so it is the nearest anchor.
    let anchor = graph.find_recovery_point("c").expect("anchor");
    assert_eq!(anchor.id, "b");
}

#[test]
fn find_recovery_point_skips_complete_tasks_without_snapshots() {
    let store = mem_store();
    let mut graph = TaskGraph::new("s1".into(), store, false);
    graph.add_task(task("a", &[])).expect("add");
    graph.add_task(task("b", &["a"])).expect("add");
    graph.add_task(task("c", &["b"])).expect("add");

    graph
        .update_status("a", TaskStatus::Complete)
        .expect("complete a");
    graph.set_snapshot("a", "0x1".into()).expect("snap a");
    graph
        .update_status("b", TaskStatus::Complete)
        .expect("complete b, no snapshot");

    let anchor = graph.find_recovery_point("c").expect("anchor");
    assert_eq!(anchor.id, "a", "b is newer but carries no snapshot");
}

#[test]
fn find_recovery_point_ignores_non_ancestors() {
    let store = mem_store();
    let mut graph = TaskGraph::new("s1".into(), store, false);
    graph.add_task(task("a", &[])).expect("add");
    graph.add_task(task("loner", &[])).expect("add");
    graph.add_task(task("b", &["a"])).expect("add");

    graph
        .update_status("loner", TaskStatus::Complete)
        .expect("complete loner");
    graph.set_snapshot("loner", "0x9".into()).expect("snap");

    assert!(
        graph.find_recovery_point("b").is_none(),
        "loner is complete with a snapshot but not an ancestor of b"
    );
}

// ── Aggregates and retry reset ───────────────────────────────

#[test]
fn is_complete_over_all_tasks() {
    let store = mem_store();
    let mut graph = TaskGraph::new("s1".into(), store, false);
    assert!(graph.is_complete(), "vacuously true when empty");

    graph.add_task(task("a", &[])).expect("add");
    assert!(!graph.is_complete());
    graph
        .update_status("a", TaskStatus::Complete)
        .expect("complete");
    assert!(graph.is_complete());
}

#[test]
fn reset_for_retry_reopens_blocked_and_failed() {
    let store = mem_store();
    let mut graph = TaskGraph::new("s1".into(), store, false);
    graph.add_task(task("a", &[])).expect("add");
    graph.add_task(task("b", &["a"])).expect("add");
    graph.add_task(task("c", &[])).expect("add");

    graph.set_error("a", "boom".into()).expect("fail a");
    graph.propagate_blocked("a").expect("propagate");
    graph
        .update_status("c", TaskStatus::Complete)
        .expect("complete c");

    let reset = graph.reset_for_retry().expect("reset");
    assert_eq!(reset, vec!["a".to_owned(), "b".to_owned()]);
    assert_eq!(graph.get("a").expect("a").status, TaskStatus::Pending);
    assert!(graph.get("a").expect("a").error.is_none());
    assert_eq!(graph.get("c").expect("c").status, TaskStatus::Complete);
}

#[test]
fn first_halted_follows_insertion_order() {
    let store = mem_store();
    let mut graph = TaskGraph::new("s1".into(), store, false);
    graph.add_task(task("a", &[])).expect("add");
    graph.add_task(task("b", &[])).expect("add");
    graph.set_error("b", "late failure".into()).expect("fail b");
    graph.set_error("a", "early failure".into()).expect("fail a");

    assert_eq!(graph.first_halted().expect("halted").id, "a");
}

// ── Spec end-to-end at graph level ───────────────────────────

#[test]
fn failed_leaf_recovers_from_completed_dependency() {
    let store = mem_store();
    let mut graph = TaskGraph::new("s1".into(), store, true);
    graph.add_task(task("a", &[])).expect("add a");
    graph.add_task(task("b", &["a"])).expect("add b");

    graph
        .update_status("a", TaskStatus::Complete)
        .expect("complete a");
    graph.set_snapshot("a", "s1".into()).expect("bind snapshot");
    assert!(graph.can_run("b"));

    graph
        .update_status("b", TaskStatus::Failed)
        .expect("fail b");
    graph.propagate_blocked("b").expect("no dependents");
    assert!(!graph.has_blocked(), "b has no dependents to block");

    let anchor = graph.find_recovery_point("b").expect("anchor");
    assert_eq!(anchor.id, "a");
    assert_eq!(anchor.snapshot_id.as_deref(), Some("s1"));
}
