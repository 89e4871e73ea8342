//! Periodic heavyweight state exports for memory-bloat mitigation and
//! crash recovery.
//!
//! Long-running fork processes accumulate unbounded in-memory snapshot
//! history; every `interval` snapshots the full node state is exported to
//! disk so recovery can reload it into a brand-new process. Exports are
//! silent from the caller's perspective — `on_snapshot` only reports
//! whether one happened.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, info, info_span, warn};

use crate::config::CheckpointConfig;
use crate::models::checkpoint::{Checkpoint, SnapshotRange};
use crate::models::fork::Fork;
use crate::models::snapshot::Snapshot;
use crate::orchestrator::fork_manager::{ForkManager, ForkSpec};
use crate::persistence::{load_doc, save_doc, StateStore};
use crate::rpc::RpcClient;
use crate::{AppError, Result};

/// First/last snapshot seen since the previous checkpoint.
struct PendingRange {
    first_id: String,
    first_seq: u64,
    last_id: String,
    last_seq: u64,
}

/// Owns a session's checkpoint history and the export cadence.
pub struct CheckpointManager {
    session_id: String,
    config: CheckpointConfig,
    store: Arc<dyn StateStore>,
    checkpoints: Vec<Checkpoint>,
    counter: u32,
    pending: Option<PendingRange>,
}

impl CheckpointManager {
    /// Create an empty manager for a session.
    #[must_use]
    pub fn new(session_id: String, config: CheckpointConfig, store: Arc<dyn StateStore>) -> Self {
        Self {
            session_id,
            config,
            store,
            checkpoints: Vec::new(),
            counter: 0,
            pending: None,
        }
    }

    /// Load a session's checkpoint records from the store.
    ///
    /// Missing or corrupt records are skipped, never fatal.
    #[must_use]
    pub fn load(session_id: String, config: CheckpointConfig, store: Arc<dyn StateStore>) -> Self {
        let mut manager = Self::new(session_id, config, store);
        let prefix = format!("checkpoints/{}", manager.session_id);
        for id in manager.store.list(&prefix) {
            let key = format!("{prefix}/{id}");
            if let Some(checkpoint) = load_doc::<Checkpoint>(manager.store.as_ref(), &key) {
                manager.checkpoints.push(checkpoint);
            }
        }
        manager
            .checkpoints
            .sort_by_key(|checkpoint| checkpoint.created_at);
        debug!(
            session_id = manager.session_id,
            count = manager.checkpoints.len(),
            "checkpoint history loaded"
        );
        manager
    }

    fn doc_key(&self, id: &str) -> String {
        format!("checkpoints/{}/{id}", self.session_id)
    }

    fn blob_key(&self, id: &str) -> String {
        format!("checkpoints/{}/{id}.state", self.session_id)
    }

    /// Record a freshly taken snapshot; every `interval` snapshots this
    /// silently exports a checkpoint. Returns whether one was cut, and
    /// resets the cadence so the cycle repeats.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rpc` or `AppError::Storage` if an export was due
    /// and failed.
    pub async fn on_snapshot(
        &mut self,
        snapshot: &Snapshot,
        rpc: &RpcClient,
        fork: &Fork,
    ) -> Result<bool> {
        match &mut self.pending {
            Some(range) => {
                range.last_id = snapshot.id.clone();
                range.last_seq = snapshot.seq;
            }
            None => {
                self.pending = Some(PendingRange {
                    first_id: snapshot.id.clone(),
                    first_seq: snapshot.seq,
                    last_id: snapshot.id.clone(),
                    last_seq: snapshot.seq,
                });
            }
        }
        self.counter += 1;

        if self.counter < self.config.interval {
            return Ok(false);
        }
        self.create(rpc, fork).await?;
        Ok(true)
    }

    /// Export the fork's full state and persist the checkpoint.
    ///
    /// Distinct from a cheap snapshot: the whole node state is dumped and
    /// written to disk, the bracketed snapshot range is recorded, the
    /// cadence tracking resets, and retention pruning runs.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if no snapshot was taken since the
    /// previous checkpoint, `AppError::Rpc` if the export RPC fails, or
    /// `AppError::Storage` if the blob or metadata cannot be written.
    pub async fn create(&mut self, rpc: &RpcClient, fork: &Fork) -> Result<Checkpoint> {
        let span = info_span!("checkpoint_create", session_id = self.session_id);
        let _guard = span.enter();

        let Some(range) = self.pending.take() else {
            return Err(AppError::Validation(
                "no snapshots taken since the previous checkpoint".into(),
            ));
        };
        let snapshot_count = self.counter;

        let blob = rpc.dump_state().await?;
        let block_number = rpc.block_number().await?;

        let checkpoint = Checkpoint::new(
            self.session_id.clone(),
            fork.id.clone(),
            SnapshotRange {
                first_id: range.first_id,
                last_id: range.last_id,
                first_seq: range.first_seq,
                last_seq: range.last_seq,
            },
            block_number,
            snapshot_count,
            sha256_hex(blob.as_bytes()),
        );

        self.store
            .save_raw(&self.blob_key(&checkpoint.id), blob.as_bytes())?;
        save_doc(
            self.store.as_ref(),
            &self.doc_key(&checkpoint.id),
            &checkpoint,
        )?;

        self.counter = 0;
        info!(
            session_id = self.session_id,
            checkpoint_id = checkpoint.id,
            block_number,
            snapshot_count,
            "checkpoint exported"
        );

        self.checkpoints.push(checkpoint.clone());
        self.cleanup()?;
        Ok(checkpoint)
    }

    /// Retain only the newest `max_checkpoints`, deleting the metadata and
    /// state blobs of the rest, oldest first. Returns how many were
    /// deleted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if a removal fails.
    pub fn cleanup(&mut self) -> Result<usize> {
        if self.checkpoints.len() <= self.config.max_checkpoints {
            return Ok(0);
        }
        let surplus = self.checkpoints.len() - self.config.max_checkpoints;
        let removed: Vec<Checkpoint> = self.checkpoints.drain(..surplus).collect();
        for checkpoint in &removed {
            self.store.remove(&self.doc_key(&checkpoint.id))?;
            self.store.remove_raw(&self.blob_key(&checkpoint.id))?;
        }
        info!(
            session_id = self.session_id,
            removed = removed.len(),
            kept = self.checkpoints.len(),
            "checkpoint history pruned"
        );
        Ok(removed.len())
    }

    /// Rebuild the session's fork from a checkpoint: kill every fork the
    /// session still has (so exactly one is live afterwards), spawn a
    /// fresh one pinned at the checkpoint's block, and load the persisted
    /// state into it. Returns the new fork for the session to rebind.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown checkpoint id,
    /// `AppError::Storage` if the state blob is missing or fails its
    /// digest check, and `AppError::Spawn`/`AppError::Rpc` for the
    /// respawn/reload steps.
    pub async fn restore(
        &self,
        checkpoint_id: &str,
        forks: &mut ForkManager,
        mut spec: ForkSpec,
    ) -> Result<Fork> {
        let span = info_span!(
            "checkpoint_restore",
            session_id = self.session_id,
            checkpoint_id
        );
        let _guard = span.enter();

        let checkpoint = self
            .get(checkpoint_id)
            .ok_or_else(|| AppError::NotFound(format!("checkpoint {checkpoint_id} not found")))?;

        let bytes = self
            .store
            .load_raw(&self.blob_key(&checkpoint.id))
            .ok_or_else(|| {
                AppError::Storage(format!(
                    "state blob for checkpoint {checkpoint_id} is missing"
                ))
            })?;
        if sha256_hex(&bytes) != checkpoint.state_digest {
            return Err(AppError::Storage(format!(
                "state blob for checkpoint {checkpoint_id} failed its digest check"
            )));
        }
        let blob = String::from_utf8(bytes).map_err(|err| {
            AppError::Storage(format!(
                "state blob for checkpoint {checkpoint_id} is not text: {err}"
            ))
        })?;

        forks.kill_session(&self.session_id).await?;

        spec.block_number = Some(checkpoint.block_number);
        let fork = forks.fork(spec).await?;

        let rpc = RpcClient::new(&fork.rpc_url);
        if !rpc.load_state(&blob).await? {
            warn!(
                checkpoint_id,
                fork_id = fork.id,
                "node reported state load failure"
            );
        }

        info!(
            session_id = self.session_id,
            checkpoint_id,
            fork_id = fork.id,
            block_number = checkpoint.block_number,
            "checkpoint restored into fresh fork"
        );
        Ok(fork)
    }

    /// Checkpoint whose snapshot bracket contains the given sequence
    /// number; falls back to the most recently created checkpoint when no
    /// bracket matches.
    #[must_use]
    pub fn find_for_snapshot(&self, seq: u64) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .find(|checkpoint| checkpoint.snapshot_range.contains(seq))
            .or_else(|| self.checkpoints.last())
    }

    /// Look up a checkpoint by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .find(|checkpoint| checkpoint.id == id)
    }

    /// The most recently created checkpoint.
    #[must_use]
    pub fn latest(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    /// All checkpoints, oldest first.
    #[must_use]
    pub fn list(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    /// Snapshots counted toward the next automatic export.
    #[must_use]
    pub fn snapshots_since_checkpoint(&self) -> u32 {
        self.counter
    }
}

/// SHA-256 hex digest of the given bytes.
fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
