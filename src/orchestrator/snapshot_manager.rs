//! Cheap, frequent state captures via lightweight RPC.
//!
//! Snapshot ids are the opaque tokens issued by `evm_snapshot`. A fresh
//! fork process restarts its token counter, so tokens are not unique
//! across recoveries; the per-session `seq` assigned here is, and it is
//! what persisted documents are keyed by and what checkpoint ranges
//! bracket.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::models::snapshot::Snapshot;
use crate::persistence::{load_doc, save_doc, StateStore};
use crate::rpc::RpcClient;
use crate::Result;

/// Inputs for [`SnapshotManager::create`].
#[derive(Debug, Clone, Default)]
pub struct SnapshotRequest {
    /// Fork the snapshot is taken on.
    pub fork_id: String,
    /// Task whose completion binds this snapshot, if any.
    pub task_id: Option<String>,
    /// Free-form description.
    pub description: Option<String>,
}

/// Owns a session's snapshot history; snapshots are immutable once
/// created and revert-only.
pub struct SnapshotManager {
    session_id: String,
    store: Arc<dyn StateStore>,
    snapshots: Vec<Snapshot>,
    by_task: HashMap<String, String>,
    next_seq: u64,
}

impl SnapshotManager {
    /// Create an empty manager for a session.
    #[must_use]
    pub fn new(session_id: String, store: Arc<dyn StateStore>) -> Self {
        Self {
            session_id,
            store,
            snapshots: Vec::new(),
            by_task: HashMap::new(),
            next_seq: 1,
        }
    }

    /// Load a session's snapshot records from the store.
    ///
    /// Missing or corrupt records are skipped, never fatal.
    #[must_use]
    pub fn load(session_id: String, store: Arc<dyn StateStore>) -> Self {
        let mut manager = Self::new(session_id, store);
        let prefix = format!("snapshots/{}", manager.session_id);
        for id in manager.store.list(&prefix) {
            let key = format!("{prefix}/{id}");
            if let Some(snapshot) = load_doc::<Snapshot>(manager.store.as_ref(), &key) {
                manager.snapshots.push(snapshot);
            }
        }
        manager.snapshots.sort_by_key(|snapshot| snapshot.seq);
        manager.next_seq = manager
            .snapshots
            .last()
            .map_or(1, |snapshot| snapshot.seq + 1);
        for snapshot in &manager.snapshots {
            if let Some(task_id) = &snapshot.task_id {
                manager
                    .by_task
                    .insert(task_id.clone(), snapshot.id.clone());
            }
        }
        debug!(
            session_id = manager.session_id,
            count = manager.snapshots.len(),
            "snapshot history loaded"
        );
        manager
    }

    fn doc_key(&self, seq: u64) -> String {
        format!("snapshots/{}/{seq:010}", self.session_id)
    }

    /// Take a snapshot on the fork and persist its record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rpc` if either RPC call fails, or
    /// `AppError::Storage` if the record cannot be written.
    pub async fn create(&mut self, request: SnapshotRequest, rpc: &RpcClient) -> Result<Snapshot> {
        let id = rpc.snapshot().await?;
        let block_number = rpc.block_number().await?;

        let snapshot = Snapshot {
            id,
            seq: self.next_seq,
            fork_id: request.fork_id,
            session_id: self.session_id.clone(),
            block_number,
            task_id: request.task_id,
            description: request.description,
            created_at: Utc::now(),
        };
        self.next_seq += 1;

        save_doc(self.store.as_ref(), &self.doc_key(snapshot.seq), &snapshot)?;
        if let Some(task_id) = &snapshot.task_id {
            self.by_task
                .insert(task_id.clone(), snapshot.id.clone());
        }
        info!(
            session_id = self.session_id,
            snapshot_id = snapshot.id,
            seq = snapshot.seq,
            block_number,
            "snapshot created"
        );
        self.snapshots.push(snapshot.clone());
        Ok(snapshot)
    }

    /// Revert the fork to a snapshot; returns the node's boolean verdict.
    ///
    /// RPC-level failures surface as errors from the call itself; this
    /// method does not catch them.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rpc` if the transport fails.
    pub async fn revert(&self, rpc: &RpcClient, snapshot_id: &str) -> Result<bool> {
        rpc.revert(snapshot_id).await
    }

    /// Retain only the `keep_last` most recent snapshots, in memory and
    /// on disk. Returns how many were deleted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if a record removal fails.
    pub fn cleanup(&mut self, keep_last: usize) -> Result<usize> {
        if self.snapshots.len() <= keep_last {
            return Ok(0);
        }
        let surplus = self.snapshots.len() - keep_last;
        let removed: Vec<Snapshot> = self.snapshots.drain(..surplus).collect();
        for snapshot in &removed {
            self.store.remove(&self.doc_key(snapshot.seq))?;
            if let Some(task_id) = &snapshot.task_id {
                self.by_task.remove(task_id);
            }
        }
        info!(
            session_id = self.session_id,
            removed = removed.len(),
            kept = self.snapshots.len(),
            "snapshot history trimmed"
        );
        Ok(removed.len())
    }

    /// Look up a snapshot by its opaque id; newest match wins, since a
    /// respawned fork reissues tokens.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Snapshot> {
        self.snapshots
            .iter()
            .rev()
            .find(|snapshot| snapshot.id == id)
    }

    /// Sequence number for an opaque snapshot id.
    #[must_use]
    pub fn seq_of(&self, id: &str) -> Option<u64> {
        self.get(id).map(|snapshot| snapshot.seq)
    }

    /// Snapshot bound to a task's completion.
    #[must_use]
    pub fn for_task(&self, task_id: &str) -> Option<&Snapshot> {
        self.by_task.get(task_id).and_then(|id| self.get(id))
    }

    /// All snapshots, oldest first.
    #[must_use]
    pub fn list(&self) -> &[Snapshot] {
        &self.snapshots
    }

    /// The most recently created snapshot.
    #[must_use]
    pub fn latest(&self) -> Option<&Snapshot> {
        self.snapshots.last()
    }
}
