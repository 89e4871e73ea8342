//! Fork model: one ephemeral fork-node process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A running (or registered) fork-node process replaying an upstream
/// network from a pinned block.
///
/// Exactly one live OS process backs each record; the record is destroyed
/// when the process is killed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Fork {
    /// Unique record identifier.
    pub id: String,
    /// Session this fork belongs to.
    pub session_id: String,
    /// Named upstream network the fork replays.
    pub network: String,
    /// Chain id of the upstream network.
    pub chain_id: u64,
    /// Block number the fork is pinned at.
    pub block_number: u64,
    /// Local JSON-RPC endpoint of the fork process.
    pub rpc_url: String,
    /// Local port the fork listens on.
    pub port: u16,
    /// OS process id.
    pub pid: u32,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Fork {
    /// Construct a fork record with a generated identifier.
    #[must_use]
    pub fn new(
        session_id: String,
        network: String,
        chain_id: u64,
        block_number: u64,
        port: u16,
        pid: u32,
        rpc_url: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            network,
            chain_id,
            block_number,
            rpc_url,
            port,
            pid,
            created_at: Utc::now(),
        }
    }
}
