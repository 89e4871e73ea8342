//! Top-level session coordinator and recovery state machine.
//!
//! One `SessionManager` is the explicit context object the host
//! constructs and passes around; there are no process-global accessors,
//! so independent managers can coexist in one process. Each manager holds
//! at most one current session: a session record plus its scoped task
//! graph, snapshot history, and checkpoint history, all persisted so the
//! session survives a host restart.
//!
//! The managers take no internal locks; callers must not issue two
//! mutating calls against the same session concurrently.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, info_span, warn};
use uuid::Uuid;

use crate::config::GlobalConfig;
use crate::models::fork::Fork;
use crate::models::session::{Session, SessionStatus};
use crate::models::snapshot::Snapshot;
use crate::models::task::{Task, TaskKind, TaskStatus};
use crate::orchestrator::checkpoint_manager::CheckpointManager;
use crate::orchestrator::fork_manager::{ForkManager, ForkSpec, NodeLauncher};
use crate::orchestrator::snapshot_manager::{SnapshotManager, SnapshotRequest};
use crate::orchestrator::task_graph::TaskGraph;
use crate::persistence::{load_doc, save_doc, FsStore, StateStore};
use crate::rpc::RpcClient;
use crate::{AppError, Result};

/// Options for [`SessionManager::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Pin block for the initial fork; defaults to the network's
    /// `default_block`, else the upstream head.
    pub block_number: Option<u64>,
    /// Description recorded on the initial snapshot.
    pub description: Option<String>,
}

/// One resumed or freshly created session with its scoped managers.
pub struct ActiveSession {
    session: Session,
    graph: TaskGraph,
    snapshots: SnapshotManager,
    checkpoints: CheckpointManager,
}

impl ActiveSession {
    /// The session record.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The session's task graph.
    #[must_use]
    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Mutable access to the task graph for `add_task` and the setters.
    pub fn graph_mut(&mut self) -> &mut TaskGraph {
        &mut self.graph
    }

    /// The session's snapshot history.
    #[must_use]
    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    /// The session's checkpoint history.
    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.checkpoints
    }
}

/// Coordinates forks, task graphs, snapshots, and checkpoints for one
/// current session, with crash/restart recovery.
pub struct SessionManager {
    config: GlobalConfig,
    store: Arc<dyn StateStore>,
    forks: ForkManager,
    current: Option<ActiveSession>,
}

impl SessionManager {
    /// Create a manager persisting under the configured `data_dir`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if the data directory cannot be
    /// created.
    pub fn new(config: GlobalConfig) -> Result<Self> {
        let store: Arc<dyn StateStore> = Arc::new(FsStore::new(config.data_dir.clone())?);
        Ok(Self::with_store(config, store))
    }

    /// Create a manager over an explicit store (tests use `MemStore`).
    #[must_use]
    pub fn with_store(config: GlobalConfig, store: Arc<dyn StateStore>) -> Self {
        let forks = ForkManager::new(config.fork.clone(), Arc::clone(&store));
        Self {
            config,
            store,
            forks,
            current: None,
        }
    }

    /// Replace the fork launcher (tests inject an inert one).
    #[must_use]
    pub fn with_launcher(mut self, launcher: Box<dyn NodeLauncher>) -> Self {
        self.forks = self.forks.with_launcher(launcher);
        self
    }

    /// Reconcile the fork registry against live OS processes. Call once
    /// after construction, before creating or resuming sessions.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if rewriting the registry fails.
    pub async fn init(&mut self) -> Result<()> {
        self.forks.init().await
    }

    fn session_key(id: &str) -> String {
        format!("sessions/{id}")
    }

    fn fork_spec(&self, session_id: &str, network: &str, block_number: Option<u64>) -> Result<ForkSpec> {
        let net = self.config.network(network)?;
        Ok(ForkSpec {
            session_id: session_id.to_owned(),
            network: network.to_owned(),
            chain_id: net.chain_id,
            upstream_url: net.upstream_url.clone(),
            block_number: block_number.or(net.default_block),
        })
    }

    /// Create a new session on a named network: spawn its fork, take the
    /// initial snapshot, seed the graph with a completed root task bound
    /// to it, and persist everything. The new session becomes current.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for an unknown network,
    /// `AppError::Spawn` if the fork never becomes ready, and
    /// `AppError::Rpc`/`AppError::Storage` from the snapshot and persist
    /// steps.
    pub async fn create(&mut self, network: &str, options: CreateOptions) -> Result<Session> {
        let session_id = Uuid::new_v4().to_string();
        let span = info_span!("session_create", session_id, network);
        let _guard = span.enter();

        let spec = self.fork_spec(&session_id, network, options.block_number)?;
        let chain_id = spec.chain_id;
        let fork = self.forks.fork(spec).await?;
        let rpc = RpcClient::new(&fork.rpc_url);

        let mut graph = TaskGraph::new(session_id.clone(), Arc::clone(&self.store), true);
        let mut snapshots = SnapshotManager::new(session_id.clone(), Arc::clone(&self.store));
        let mut checkpoints = CheckpointManager::new(
            session_id.clone(),
            self.config.checkpoints,
            Arc::clone(&self.store),
        );

        // Root task id is needed before the snapshot so the two bind.
        let mut root = Task::new(
            TaskKind::Fork,
            Vec::new(),
            json!({ "network": network, "block_number": fork.block_number }),
        );
        let snapshot = snapshots
            .create(
                SnapshotRequest {
                    fork_id: fork.id.clone(),
                    task_id: Some(root.id.clone()),
                    description: options.description.or_else(|| Some("session start".into())),
                },
                &rpc,
            )
            .await?;
        checkpoints.on_snapshot(&snapshot, &rpc, &fork).await?;

        root.status = TaskStatus::Complete;
        root.completed_at = Some(chrono::Utc::now());
        root.snapshot_id = Some(snapshot.id.clone());
        graph.add_task(root)?;

        let session = Session::new(
            session_id.clone(),
            network.to_owned(),
            chain_id,
            fork.id.clone(),
            fork.block_number,
        );
        save_doc(self.store.as_ref(), &Self::session_key(&session_id), &session)?;
        info!(fork_id = fork.id, block_number = fork.block_number, "session created");

        self.current = Some(ActiveSession {
            session: session.clone(),
            graph,
            snapshots,
            checkpoints,
        });
        Ok(session)
    }

    /// Resume a persisted session, recovering first when its fork is gone
    /// or its graph holds blocked tasks. The session becomes current and
    /// active.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown session id,
    /// `AppError::Validation` for a terminal session, and the recovery
    /// errors documented on [`SessionManager::create`].
    pub async fn resume(&mut self, id: &str) -> Result<Session> {
        let span = info_span!("session_resume", session_id = id);
        let _guard = span.enter();

        let session: Session = load_doc(self.store.as_ref(), &Self::session_key(id))
            .ok_or_else(|| AppError::NotFound(format!("session {id} not found")))?;
        if matches!(
            session.status,
            SessionStatus::Complete | SessionStatus::Failed
        ) {
            return Err(AppError::Validation(format!(
                "session {id} is terminal and cannot be resumed"
            )));
        }

        let graph = TaskGraph::load(id.to_owned(), Arc::clone(&self.store), true);
        let snapshots = SnapshotManager::load(id.to_owned(), Arc::clone(&self.store));
        let checkpoints = CheckpointManager::load(
            id.to_owned(),
            self.config.checkpoints,
            Arc::clone(&self.store),
        );

        let mut active = ActiveSession {
            session,
            graph,
            snapshots,
            checkpoints,
        };

        let fork_alive = self.forks.get(&active.session.fork_id).is_some();
        if fork_alive && !active.graph.has_blocked() {
            info!(fork_id = active.session.fork_id, "resumed onto live fork");
        } else {
            self.recover(&mut active).await?;
        }

        active.session.status = SessionStatus::Active;
        active.session.touch();
        save_doc(
            self.store.as_ref(),
            &Self::session_key(&active.session.id),
            &active.session,
        )?;

        let session = active.session.clone();
        self.current = Some(active);
        Ok(session)
    }

    /// Reconstruct a consistent execution point, trying strategies in
    /// strict priority order: latest checkpoint, then nearest
    /// snapshot-bearing complete ancestor of the first halted task, then
    /// a bare fresh fork at the session's original block.
    async fn recover(&mut self, active: &mut ActiveSession) -> Result<()> {
        let span = info_span!("session_recover", session_id = active.session.id);
        let _guard = span.enter();

        // Strategy 1: newest checkpoint wins when one exists.
        if let Some(checkpoint_id) = active.checkpoints.latest().map(|cp| cp.id.clone()) {
            let spec = self.fork_spec(&active.session.id, &active.session.network, None)?;
            let fork = active
                .checkpoints
                .restore(&checkpoint_id, &mut self.forks, spec)
                .await?;
            active.session.fork_id = fork.id;
            info!(checkpoint_id, "recovered from checkpoint");
            return Ok(());
        }

        // Strategy 2: revert a fresh fork to the nearest complete
        // ancestor with a bound snapshot, then retry the halted tasks.
        let anchor = active.graph.first_halted().map(|task| task.id.clone()).and_then(|halted| {
            active
                .graph
                .find_recovery_point(&halted)
                .and_then(|task| task.snapshot_id.clone())
        });
        if let Some(snapshot_id) = anchor {
            let fork = self.respawn(active).await?;
            let rpc = RpcClient::new(&fork.rpc_url);
            if !active.snapshots.revert(&rpc, &snapshot_id).await? {
                warn!(snapshot_id, "node rejected revert to recovery snapshot");
            }
            let reset = active.graph.reset_for_retry()?;
            active.session.fork_id = fork.id;
            info!(
                snapshot_id,
                reset_count = reset.len(),
                "recovered from ancestor snapshot"
            );
            return Ok(());
        }

        // Strategy 3: nothing to restore from. Not an error, but worth a
        // warning — the session replays from scratch.
        let fork = self.respawn(active).await?;
        active.session.fork_id = fork.id;
        warn!(
            fork_id = active.session.fork_id,
            "no checkpoint or snapshot anchor found; session replays from scratch"
        );
        Ok(())
    }

    /// Kill whatever forks the session still has and spawn a fresh one at
    /// its original block, preserving the one-live-fork invariant.
    async fn respawn(&mut self, active: &ActiveSession) -> Result<Fork> {
        self.forks.kill_session(&active.session.id).await?;
        let spec = self.fork_spec(
            &active.session.id,
            &active.session.network,
            Some(active.session.initial_block),
        )?;
        self.forks.fork(spec).await
    }

    /// Mark a task complete: record its output, bind a fresh snapshot to
    /// it, and feed the checkpoint cadence; when a checkpoint is cut its
    /// id is bound to the task as well. Returns the bound snapshot.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown task or a missing
    /// current session/fork, plus `AppError::Rpc`/`AppError::Storage`
    /// from the capture steps.
    pub async fn complete_task(
        &mut self,
        task_id: &str,
        output: serde_json::Value,
    ) -> Result<Snapshot> {
        let active = self
            .current
            .as_mut()
            .ok_or_else(|| AppError::NotFound("no current session".into()))?;
        let fork = self
            .forks
            .get(&active.session.fork_id)
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "fork {} not found; resume the session first",
                    active.session.fork_id
                ))
            })?
            .clone();
        let rpc = RpcClient::new(&fork.rpc_url);

        active.graph.set_output(task_id, output)?;
        active.graph.update_status(task_id, TaskStatus::Complete)?;

        let snapshot = active
            .snapshots
            .create(
                SnapshotRequest {
                    fork_id: fork.id.clone(),
                    task_id: Some(task_id.to_owned()),
                    description: None,
                },
                &rpc,
            )
            .await?;
        active.graph.set_snapshot(task_id, snapshot.id.clone())?;

        let cut = active
            .checkpoints
            .on_snapshot(&snapshot, &rpc, &fork)
            .await?;
        if cut {
            if let Some(checkpoint) = active.checkpoints.latest() {
                let checkpoint_id = checkpoint.id.clone();
                active.graph.set_checkpoint(task_id, checkpoint_id)?;
            }
        }
        active.snapshots.cleanup(self.config.snapshots.keep_last)?;

        active.session.touch();
        save_doc(
            self.store.as_ref(),
            &Self::session_key(&active.session.id),
            &active.session,
        )?;
        Ok(snapshot)
    }

    /// Mark a task failed and block its transitive pending dependents.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown task or a missing
    /// current session.
    pub fn fail_task(&mut self, task_id: &str, error: String) -> Result<()> {
        let active = self
            .current
            .as_mut()
            .ok_or_else(|| AppError::NotFound("no current session".into()))?;
        active.graph.set_error(task_id, error)?;
        active.graph.propagate_blocked(task_id)?;
        active.session.touch();
        save_doc(
            self.store.as_ref(),
            &Self::session_key(&active.session.id),
            &active.session,
        )
    }

    /// Transition the current session's lifecycle status. Terminal
    /// transitions kill the session's fork.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` with no current session, or
    /// `AppError::Validation` for a transition the lifecycle forbids.
    pub async fn update_status(&mut self, status: SessionStatus) -> Result<Session> {
        let active = self
            .current
            .as_mut()
            .ok_or_else(|| AppError::NotFound("no current session".into()))?;
        if !active.session.can_transition_to(status) {
            return Err(AppError::Validation(format!(
                "session {} cannot transition {:?} -> {:?}",
                active.session.id, active.session.status, status
            )));
        }

        active.session.status = status;
        active.session.touch();
        save_doc(
            self.store.as_ref(),
            &Self::session_key(&active.session.id),
            &active.session,
        )?;

        let session = active.session.clone();
        if matches!(status, SessionStatus::Complete | SessionStatus::Failed) {
            self.forks.kill_session(&session.id).await?;
            info!(session_id = session.id, ?status, "session closed");
        }
        Ok(session)
    }

    /// Suspend the current session; `resume` reactivates it.
    ///
    /// # Errors
    ///
    /// Same contract as [`SessionManager::update_status`].
    pub async fn suspend(&mut self) -> Result<Session> {
        self.update_status(SessionStatus::Suspended).await
    }

    /// The current session, if any.
    #[must_use]
    pub fn current(&self) -> Option<&ActiveSession> {
        self.current.as_ref()
    }

    /// Mutable access to the current session for graph operations.
    pub fn current_mut(&mut self) -> Option<&mut ActiveSession> {
        self.current.as_mut()
    }

    /// All persisted session records.
    #[must_use]
    pub fn list(&self) -> Vec<Session> {
        self.store
            .list("sessions")
            .iter()
            .filter_map(|id| load_doc(self.store.as_ref(), &Self::session_key(id)))
            .collect()
    }

    /// The fork manager, for `export_env` and fork inspection.
    #[must_use]
    pub fn forks(&self) -> &ForkManager {
        &self.forks
    }

    /// Kill every fork this manager tracks; call on host shutdown.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if rewriting the registry fails.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.forks.kill_all().await
    }
}
