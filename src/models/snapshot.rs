//! Snapshot model: a cheap in-memory save point of fork state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A cheap save point of fork state, created and reverted via lightweight
/// RPC calls.
///
/// The `id` is the opaque token issued by the node's `evm_snapshot`; `seq`
/// is a monotone sequence number assigned at creation time and used for
/// checkpoint range containment, since the opaque ids carry no reliable
/// order. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Snapshot {
    /// Opaque RPC-issued snapshot token.
    pub id: String,
    /// Monotone per-session sequence number.
    pub seq: u64,
    /// Fork the snapshot was taken on.
    pub fork_id: String,
    /// Session this snapshot belongs to.
    pub session_id: String,
    /// Block number at capture time.
    pub block_number: u64,
    /// Task whose completion bound this snapshot, if any.
    pub task_id: Option<String>,
    /// Free-form description.
    pub description: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}
