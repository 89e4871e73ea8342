//! Global configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{AppError, Result};

/// Fork process settings: binary, port range, readiness, and shutdown.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ForkConfig {
    /// Fork node binary (e.g., `anvil`).
    #[serde(default = "default_fork_binary")]
    pub binary: String,
    /// Extra arguments appended to every fork invocation.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// First port in the allocation range (inclusive).
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    /// Last port in the allocation range (inclusive).
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
    /// Maximum readiness probes before a spawn attempt fails.
    #[serde(default = "default_ready_attempts")]
    pub ready_attempts: u32,
    /// Delay between readiness probes, in milliseconds.
    #[serde(default = "default_ready_interval_ms")]
    pub ready_interval_ms: u64,
    /// Grace window between SIGTERM and SIGKILL, in milliseconds.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
}

fn default_fork_binary() -> String {
    "anvil".into()
}

fn default_port_range_start() -> u16 {
    8600
}

fn default_port_range_end() -> u16 {
    8699
}

fn default_ready_attempts() -> u32 {
    30
}

fn default_ready_interval_ms() -> u64 {
    500
}

fn default_grace_period_ms() -> u64 {
    5000
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            binary: default_fork_binary(),
            extra_args: Vec::new(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            ready_attempts: default_ready_attempts(),
            ready_interval_ms: default_ready_interval_ms(),
            grace_period_ms: default_grace_period_ms(),
        }
    }
}

/// Snapshot retention settings.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SnapshotConfig {
    /// Number of most-recent snapshots kept by `cleanup`.
    #[serde(default = "default_keep_last")]
    pub keep_last: usize,
}

fn default_keep_last() -> usize {
    50
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            keep_last: default_keep_last(),
        }
    }
}

/// Checkpoint cadence and retention settings.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CheckpointConfig {
    /// Snapshots between automatic checkpoint exports.
    #[serde(default = "default_checkpoint_interval")]
    pub interval: u32,
    /// Newest checkpoints retained per session; older ones are deleted.
    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints: usize,
}

fn default_checkpoint_interval() -> u32 {
    5
}

fn default_max_checkpoints() -> usize {
    3
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: default_checkpoint_interval(),
            max_checkpoints: default_max_checkpoints(),
        }
    }
}

/// Upstream network a fork can replay.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct NetworkConfig {
    /// Upstream JSON-RPC endpoint the fork replays from.
    pub upstream_url: String,
    /// Chain id of the upstream network.
    pub chain_id: u64,
    /// Optional default pin block for new forks of this network.
    #[serde(default)]
    pub default_block: Option<u64>,
}

/// Global configuration parsed from `forkbench.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Root directory for all persisted state.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Fork process settings.
    #[serde(default)]
    pub fork: ForkConfig,
    /// Snapshot retention settings.
    #[serde(default)]
    pub snapshots: SnapshotConfig,
    /// Checkpoint cadence and retention settings.
    #[serde(default)]
    pub checkpoints: CheckpointConfig,
    /// Named upstream networks available to sessions.
    #[serde(default)]
    pub networks: HashMap<String, NetworkConfig>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".forkbench")
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            fork: ForkConfig::default(),
            snapshots: SnapshotConfig::default(),
            checkpoints: CheckpointConfig::default(),
            networks: HashMap::new(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a named network.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if the network is not configured.
    pub fn network(&self, name: &str) -> Result<&NetworkConfig> {
        self.networks
            .get(name)
            .ok_or_else(|| AppError::Validation(format!("unknown network: {name}")))
    }

    fn validate(&self) -> Result<()> {
        if self.fork.port_range_start > self.fork.port_range_end {
            return Err(AppError::Config(
                "fork.port_range_start must not exceed fork.port_range_end".into(),
            ));
        }
        if self.fork.ready_attempts == 0 {
            return Err(AppError::Config(
                "fork.ready_attempts must be greater than zero".into(),
            ));
        }
        if self.checkpoints.interval == 0 {
            return Err(AppError::Config(
                "checkpoints.interval must be greater than zero".into(),
            ));
        }
        if self.checkpoints.max_checkpoints == 0 {
            return Err(AppError::Config(
                "checkpoints.max_checkpoints must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
