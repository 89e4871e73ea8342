//! Checkpoint model: a heavyweight full-state export of a fork.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The bracket of snapshots captured between two checkpoints.
///
/// Containment queries use the integer `first_seq..=last_seq` range; the
/// opaque ids are kept for operator display only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SnapshotRange {
    /// First snapshot id captured since the prior checkpoint.
    pub first_id: String,
    /// Last snapshot id captured since the prior checkpoint.
    pub last_id: String,
    /// Sequence number of `first_id`.
    pub first_seq: u64,
    /// Sequence number of `last_id`.
    pub last_seq: u64,
}

impl SnapshotRange {
    /// Whether a snapshot sequence number falls inside this bracket.
    #[must_use]
    pub fn contains(&self, seq: u64) -> bool {
        (self.first_seq..=self.last_seq).contains(&seq)
    }
}

/// Metadata for one heavyweight state export, reloadable into a brand-new
/// fork process.
///
/// The raw state blob lives in a separate file next to this document; the
/// digest ties the two together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Checkpoint {
    /// Unique record identifier.
    pub id: String,
    /// Session this checkpoint belongs to.
    pub session_id: String,
    /// Fork the state was exported from.
    pub fork_id: String,
    /// Snapshots bracketed since the prior checkpoint.
    pub snapshot_range: SnapshotRange,
    /// Block number at export time.
    pub block_number: u64,
    /// Number of snapshots captured since the prior checkpoint.
    pub snapshot_count: u32,
    /// SHA-256 hex digest of the on-disk state blob.
    pub state_digest: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Construct a checkpoint record with a generated identifier.
    #[must_use]
    pub fn new(
        session_id: String,
        fork_id: String,
        snapshot_range: SnapshotRange,
        block_number: u64,
        snapshot_count: u32,
        state_digest: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            fork_id,
            snapshot_range,
            block_number,
            snapshot_count,
            state_digest,
            created_at: Utc::now(),
        }
    }
}
