//! Persisted dependency graph of a session's work items.
//!
//! The graph is acyclic at all times: cycles are rejected before insertion
//! and never re-validated after. Iteration-order-sensitive operations
//! (`next_runnable`, `first_halted`) use insertion order, which is part of
//! the documented contract and is preserved across persistence round-trips.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::models::task::{Task, TaskStatus};
use crate::persistence::{load_doc, save_doc, StateStore};
use crate::{AppError, Result};

/// Serialized form: tasks in insertion order, one document per session.
#[derive(Debug, Serialize, Deserialize)]
struct GraphDoc {
    session_id: String,
    tasks: Vec<Task>,
}

/// Dependency graph of one session's tasks, bound to snapshot/checkpoint
/// history and persisted as a single document.
pub struct TaskGraph {
    session_id: String,
    store: Arc<dyn StateStore>,
    auto_save: bool,
    tasks: HashMap<String, Task>,
    order: Vec<String>,
    dependents: HashMap<String, Vec<String>>,
}

impl TaskGraph {
    /// Create an empty graph for a session.
    #[must_use]
    pub fn new(session_id: String, store: Arc<dyn StateStore>, auto_save: bool) -> Self {
        Self {
            session_id,
            store,
            auto_save,
            tasks: HashMap::new(),
            order: Vec::new(),
            dependents: HashMap::new(),
        }
    }

    /// Load a session's graph from the store.
    ///
    /// A missing or corrupt document yields an empty graph, never an error.
    #[must_use]
    pub fn load(session_id: String, store: Arc<dyn StateStore>, auto_save: bool) -> Self {
        let mut graph = Self::new(session_id, store, auto_save);
        let key = graph.doc_key();
        if let Some(doc) = load_doc::<GraphDoc>(graph.store.as_ref(), &key) {
            for task in doc.tasks {
                graph.index(&task);
                graph.order.push(task.id.clone());
                graph.tasks.insert(task.id.clone(), task);
            }
            debug!(
                session_id = graph.session_id,
                task_count = graph.order.len(),
                "task graph loaded"
            );
        }
        graph
    }

    fn doc_key(&self) -> String {
        format!("graphs/{}", self.session_id)
    }

    fn index(&mut self, task: &Task) {
        for dep in &task.dependencies {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .push(task.id.clone());
        }
    }

    /// Whether inserting `candidate_id` with the given dependencies would
    /// close a cycle. Walks dependency edges depth-first; dangling
    /// references are skipped.
    fn creates_cycle(&self, candidate_id: &str, dependencies: &[String]) -> bool {
        let mut stack: Vec<&str> = dependencies.iter().map(String::as_str).collect();
        let mut visited: HashSet<&str> = HashSet::new();
        while let Some(node) = stack.pop() {
            if node == candidate_id {
                return true;
            }
            if !visited.insert(node) {
                continue;
            }
            if let Some(task) = self.tasks.get(node) {
                stack.extend(task.dependencies.iter().map(String::as_str));
            }
        }
        false
    }

    /// Insert a task into the graph.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if the id is already present or the
    /// task's dependency relation would introduce a cycle; the graph and
    /// its persisted document are left unchanged.
    pub fn add_task(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(AppError::Validation(format!(
                "task {} already exists",
                task.id
            )));
        }
        if self.creates_cycle(&task.id, &task.dependencies) {
            return Err(AppError::Validation(format!(
                "task {} would introduce a dependency cycle",
                task.id
            )));
        }

        self.index(&task);
        self.order.push(task.id.clone());
        info!(
            session_id = self.session_id,
            task_id = task.id,
            dependency_count = task.dependencies.len(),
            "task added"
        );
        self.tasks.insert(task.id.clone(), task);
        self.persist_if_auto()
    }

    fn task_mut(&mut self, id: &str) -> Result<&mut Task> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("task {id} not found")))
    }

    /// Transition a task's status; `Complete` stamps `completed_at`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the task does not exist.
    pub fn update_status(&mut self, id: &str, status: TaskStatus) -> Result<()> {
        let task = self.task_mut(id)?;
        task.status = status;
        if status == TaskStatus::Complete {
            task.completed_at = Some(Utc::now());
        }
        self.persist_if_auto()
    }

    /// Bind a snapshot to a task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the task does not exist.
    pub fn set_snapshot(&mut self, id: &str, snapshot_id: String) -> Result<()> {
        self.task_mut(id)?.snapshot_id = Some(snapshot_id);
        self.persist_if_auto()
    }

    /// Bind a checkpoint to a task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the task does not exist.
    pub fn set_checkpoint(&mut self, id: &str, checkpoint_id: String) -> Result<()> {
        self.task_mut(id)?.checkpoint_id = Some(checkpoint_id);
        self.persist_if_auto()
    }

    /// Record a task's output payload.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the task does not exist.
    pub fn set_output(&mut self, id: &str, output: serde_json::Value) -> Result<()> {
        self.task_mut(id)?.output = Some(output);
        self.persist_if_auto()
    }

    /// Record a failure message and force the task to `Failed`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the task does not exist.
    pub fn set_error(&mut self, id: &str, error: String) -> Result<()> {
        let task = self.task_mut(id)?;
        task.error = Some(error);
        task.status = TaskStatus::Failed;
        self.persist_if_auto()
    }

    /// Whether a task is pending with every dependency complete.
    #[must_use]
    pub fn can_run(&self, id: &str) -> bool {
        let Some(task) = self.tasks.get(id) else {
            return false;
        };
        task.status == TaskStatus::Pending
            && task.dependencies.iter().all(|dep| {
                self.tasks
                    .get(dep)
                    .is_some_and(|d| d.status == TaskStatus::Complete)
            })
    }

    /// First runnable task in insertion order.
    #[must_use]
    pub fn next_runnable(&self) -> Option<&Task> {
        self.order
            .iter()
            .find(|id| self.can_run(id))
            .and_then(|id| self.tasks.get(id))
    }

    /// Mark every transitive dependent of `id` that is currently pending
    /// as blocked. Tasks in other states are untouched; calling this twice
    /// is a no-op the second time.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the task does not exist.
    pub fn propagate_blocked(&mut self, id: &str) -> Result<()> {
        if !self.tasks.contains_key(id) {
            return Err(AppError::NotFound(format!("task {id} not found")));
        }

        let mut stack = vec![id.to_owned()];
        let mut visited: HashSet<String> = HashSet::new();
        let mut newly_blocked = 0u32;
        while let Some(node) = stack.pop() {
            if !visited.insert(node.clone()) {
                continue;
            }
            let Some(dependents) = self.dependents.get(&node) else {
                continue;
            };
            for dependent in dependents.clone() {
                if let Some(task) = self.tasks.get_mut(&dependent) {
                    if task.status == TaskStatus::Pending {
                        task.status = TaskStatus::Blocked;
                        newly_blocked += 1;
                    }
                }
                stack.push(dependent);
            }
        }

        if newly_blocked > 0 {
            info!(
                session_id = self.session_id,
                task_id = id,
                newly_blocked,
                "blocked dependents of failed task"
            );
        }
        self.persist_if_auto()
    }

    /// Nearest recovery anchor for a task: among all tasks reachable
    /// through its dependency edges (transitively), the complete one with
    /// a bound snapshot and the most recent `created_at`.
    #[must_use]
    pub fn find_recovery_point(&self, id: &str) -> Option<&Task> {
        let mut stack: Vec<&str> = self
            .tasks
            .get(id)
            .map(|task| task.dependencies.iter().map(String::as_str).collect())?;
        let mut visited: HashSet<&str> = HashSet::new();
        let mut best: Option<&Task> = None;

        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            let Some(task) = self.tasks.get(node) else {
                continue;
            };
            if task.status == TaskStatus::Complete && task.snapshot_id.is_some() {
                let newer = best.is_none_or(|b| task.created_at > b.created_at);
                if newer {
                    best = Some(task);
                }
            }
            stack.extend(task.dependencies.iter().map(String::as_str));
        }
        best
    }

    /// Whether every task in the graph is complete.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.tasks
            .values()
            .all(|task| task.status == TaskStatus::Complete)
    }

    /// Whether any task is currently blocked.
    #[must_use]
    pub fn has_blocked(&self) -> bool {
        self.tasks
            .values()
            .any(|task| task.status == TaskStatus::Blocked)
    }

    /// First blocked or failed task in insertion order.
    #[must_use]
    pub fn first_halted(&self) -> Option<&Task> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id))
            .find(|task| matches!(task.status, TaskStatus::Blocked | TaskStatus::Failed))
    }

    /// Reset every blocked or failed task to pending, clearing recorded
    /// errors, so recovery can retry them. Returns the reset task ids in
    /// insertion order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if persisting the graph fails.
    pub fn reset_for_retry(&mut self) -> Result<Vec<String>> {
        let mut reset = Vec::new();
        for id in &self.order {
            if let Some(task) = self.tasks.get_mut(id) {
                if matches!(task.status, TaskStatus::Blocked | TaskStatus::Failed) {
                    task.status = TaskStatus::Pending;
                    task.error = None;
                    reset.push(id.clone());
                }
            }
        }
        self.persist_if_auto()?;
        Ok(reset)
    }

    /// Look up a task by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// All tasks in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }

    /// Number of tasks in the graph.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the graph holds no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn persist_if_auto(&self) -> Result<()> {
        if self.auto_save {
            self.save()?;
        }
        Ok(())
    }

    /// Persist the graph as one document, insertion order preserved.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if the write fails.
    pub fn save(&self) -> Result<()> {
        let doc = GraphDoc {
            session_id: self.session_id.clone(),
            tasks: self.tasks().cloned().collect(),
        };
        save_doc(self.store.as_ref(), &self.doc_key(), &doc)
    }
}
