//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// JSON-RPC transport or node-side failure.
    Rpc(String),
    /// Fork process spawn, readiness, or termination failure.
    Spawn(String),
    /// Rejected input: dependency cycle, unknown id, invalid transition.
    Validation(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Persisted document or state-blob write/read failure.
    Storage(String),
    /// Other file-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Rpc(msg) => write!(f, "rpc: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Storage(msg) => write!(f, "storage: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::Rpc(err.to_string())
    }
}
