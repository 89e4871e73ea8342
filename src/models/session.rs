//! Session model and lifecycle helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status for a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session actively running work.
    Active,
    /// Session suspended by the operator; resumable.
    Suspended,
    /// Session finished successfully. Terminal.
    Complete,
    /// Session finished with an error. Terminal.
    Failed,
}

/// The aggregate root binding one fork, one task graph, and their
/// snapshot/checkpoint history, durable across process restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Session {
    /// Unique record identifier.
    pub id: String,
    /// Named upstream network this session forks.
    pub network: String,
    /// Chain id of the upstream network.
    pub chain_id: u64,
    /// The session's current (single) live fork.
    pub fork_id: String,
    /// Block the original fork was pinned at; recovery re-forks here.
    pub initial_block: u64,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub last_activity: DateTime<Utc>,
}

impl Session {
    /// Construct an active session.
    ///
    /// The id is coined by the caller: the session manager generates it
    /// before the fork spawns so the fork can record which session owns
    /// it.
    #[must_use]
    pub fn new(
        id: String,
        network: String,
        chain_id: u64,
        fork_id: String,
        initial_block: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            network,
            chain_id,
            fork_id,
            initial_block,
            status: SessionStatus::Active,
            created_at: now,
            last_activity: now,
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        matches!(
            (self.status, next),
            (SessionStatus::Active, SessionStatus::Suspended)
                | (SessionStatus::Suspended, SessionStatus::Active)
                | (
                    SessionStatus::Active | SessionStatus::Suspended,
                    SessionStatus::Complete | SessionStatus::Failed
                )
        )
    }

    /// Stamp `last_activity` with the current time.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }
}
