//! Task model: one unit of work in a session's dependency graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of work a task performs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Spawn or rebind the session's fork; the synthetic root task.
    Fork,
    /// Establish on-chain ground state (balances, approvals).
    Ground,
    /// Guard-rail checks over the current fork state.
    Warden,
    /// Generate a candidate workload or transaction batch.
    Generate,
    /// Validate a generated workload against the fork.
    Validate,
    /// Write results back out of the session.
    Write,
}

/// Lifecycle status for a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on dependencies or a free runner.
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Complete,
    /// A transitive dependency failed; will not run as-is.
    Blocked,
    /// Finished with an error.
    Failed,
}

/// A unit of work bound into the session's dependency graph.
///
/// Tasks are owned exclusively by the graph: they are created on insert,
/// mutated only through graph setters, and never deleted — only
/// transitioned between statuses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Task {
    /// Unique record identifier.
    pub id: String,
    /// What kind of work this task performs.
    pub kind: TaskKind,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Snapshot bound when the task completed, if any.
    pub snapshot_id: Option<String>,
    /// Checkpoint cut at this task's completion, if any.
    pub checkpoint_id: Option<String>,
    /// Ids of tasks that must complete before this one can run.
    pub dependencies: Vec<String>,
    /// Opaque input payload for the runner.
    pub input: serde_json::Value,
    /// Opaque output payload recorded on completion.
    pub output: Option<serde_json::Value>,
    /// Failure message recorded by `set_error`.
    pub error: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Completion timestamp, stamped on transition to `Complete`.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Construct a pending task with a generated identifier.
    #[must_use]
    pub fn new(kind: TaskKind, dependencies: Vec<String>, input: serde_json::Value) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), kind, dependencies, input)
    }

    /// Construct a pending task with a caller-supplied identifier.
    #[must_use]
    pub fn with_id(
        id: String,
        kind: TaskKind,
        dependencies: Vec<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            id,
            kind,
            status: TaskStatus::Pending,
            snapshot_id: None,
            checkpoint_id: None,
            dependencies,
            input,
            output: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}
