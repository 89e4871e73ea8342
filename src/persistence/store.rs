//! Document store for persisted orchestrator state.
//!
//! All durable state is keyed JSON documents (`sessions/<id>`,
//! `graphs/<id>`, `snapshots/<sid>/<id>`, `checkpoints/<sid>/<id>`,
//! `forks/registry`) plus raw byte blobs for checkpoint state exports.
//! Loads tolerate corruption: a document that exists but does not parse is
//! treated as absent, so every consumer starts from its empty/default
//! value instead of failing.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::{AppError, Result};

/// Keyed document + blob storage behind which any embedded store can sit.
pub trait StateStore: Send + Sync {
    /// Load a document; `None` when missing or unparsable.
    fn load(&self, key: &str) -> Option<Value>;

    /// Save a document, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if the write fails.
    fn save(&self, key: &str, value: &Value) -> Result<()>;

    /// List document ids under a key prefix, sorted.
    fn list(&self, prefix: &str) -> Vec<String>;

    /// Remove a document; removing a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if the removal fails.
    fn remove(&self, key: &str) -> Result<()>;

    /// Load a raw byte blob; `None` when missing.
    fn load_raw(&self, key: &str) -> Option<Vec<u8>>;

    /// Save a raw byte blob, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if the write fails.
    fn save_raw(&self, key: &str, bytes: &[u8]) -> Result<()>;

    /// Remove a raw byte blob; removing a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if the removal fails.
    fn remove_raw(&self, key: &str) -> Result<()>;
}

/// Load and deserialize a document; corruption degrades to `None`.
pub fn load_doc<T: DeserializeOwned>(store: &dyn StateStore, key: &str) -> Option<T> {
    let value = store.load(key)?;
    match serde_json::from_value(value) {
        Ok(doc) => Some(doc),
        Err(err) => {
            warn!(key, %err, "discarding unreadable persisted document");
            None
        }
    }
}

/// Serialize and save a document.
///
/// # Errors
///
/// Returns `AppError::Storage` if serialization or the write fails.
pub fn save_doc<T: Serialize>(store: &dyn StateStore, key: &str, doc: &T) -> Result<()> {
    let value = serde_json::to_value(doc)
        .map_err(|err| AppError::Storage(format!("failed to serialize {key}: {err}")))?;
    store.save(key, &value)
}

// ── Filesystem store ─────────────────────────────────────────────────────────

/// Production store: one pretty-printed JSON file per document under a
/// root directory, raw blobs stored verbatim.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Storage` if the root cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|err| AppError::Storage(format!("failed to create store root: {err}")))?;
        Ok(Self { root })
    }

    fn doc_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }

    fn raw_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn ensure_parent(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::Storage(format!("failed to create {}: {err}", parent.display()))
            })?;
        }
        Ok(())
    }
}

impl StateStore for FsStore {
    fn load(&self, key: &str) -> Option<Value> {
        let path = self.doc_path(key);
        let raw = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, %err, "persisted document is corrupt, treating as absent");
                None
            }
        }
    }

    fn save(&self, key: &str, value: &Value) -> Result<()> {
        let path = self.doc_path(key);
        self.ensure_parent(&path)?;
        let mut buf = serde_json::to_string_pretty(value)
            .map_err(|err| AppError::Storage(format!("failed to serialize {key}: {err}")))?;
        buf.push('\n');
        fs::write(&path, buf)
            .map_err(|err| AppError::Storage(format!("failed to write {key}: {err}")))
    }

    fn list(&self, prefix: &str) -> Vec<String> {
        let dir = self.root.join(prefix);
        let Ok(entries) = fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut ids: Vec<String> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "json") {
                    path.file_stem()
                        .map(|stem| stem.to_string_lossy().into_owned())
                } else {
                    None
                }
            })
            .collect();
        ids.sort();
        ids
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.doc_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AppError::Storage(format!("failed to remove {key}: {err}"))),
        }
    }

    fn load_raw(&self, key: &str) -> Option<Vec<u8>> {
        fs::read(self.raw_path(key)).ok()
    }

    fn save_raw(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.raw_path(key);
        self.ensure_parent(&path)?;
        fs::write(&path, bytes)
            .map_err(|err| AppError::Storage(format!("failed to write {key}: {err}")))
    }

    fn remove_raw(&self, key: &str) -> Result<()> {
        let path = self.raw_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AppError::Storage(format!("failed to remove {key}: {err}"))),
        }
    }
}

// ── In-memory store ──────────────────────────────────────────────────────────

/// In-memory store for tests; mirrors the filesystem key layout.
#[derive(Debug, Default)]
pub struct MemStore {
    docs: Mutex<HashMap<String, Value>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemStore {
    /// Create an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_docs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Value>> {
        // Recover the map even if a test panicked while holding the lock.
        match self.docs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_blobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        match self.blobs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl StateStore for MemStore {
    fn load(&self, key: &str) -> Option<Value> {
        self.lock_docs().get(key).cloned()
    }

    fn save(&self, key: &str, value: &Value) -> Result<()> {
        self.lock_docs().insert(key.to_owned(), value.clone());
        Ok(())
    }

    fn list(&self, prefix: &str) -> Vec<String> {
        let wanted = format!("{prefix}/");
        let mut ids: Vec<String> = self
            .lock_docs()
            .keys()
            .filter_map(|key| {
                let rest = key.strip_prefix(&wanted)?;
                if rest.contains('/') {
                    None
                } else {
                    Some(rest.to_owned())
                }
            })
            .collect();
        ids.sort();
        ids
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.lock_docs().remove(key);
        Ok(())
    }

    fn load_raw(&self, key: &str) -> Option<Vec<u8>> {
        self.lock_blobs().get(key).cloned()
    }

    fn save_raw(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.lock_blobs().insert(key.to_owned(), bytes.to_vec());
        Ok(())
    }

    fn remove_raw(&self, key: &str) -> Result<()> {
        self.lock_blobs().remove(key);
        Ok(())
    }
}
