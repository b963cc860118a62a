//! Local persistence of the session list.
//!
//! The cache is a plain string store keyed by namespace. The engine keeps
//! one [`CacheSnapshot`] per namespace, serialized as JSON.

use crate::error::CacheError;
use crate::session::{ConversationSession, SessionStore};
use counsel_core::{LocalSessionId, RemoteSessionId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Snapshot format version written by this crate.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Get/set of serialized values under a namespace.
pub trait LocalCache: Send + Sync {
    /// Returns the stored value, if any.
    fn get(&self, namespace: &str) -> Result<Option<String>, CacheError>;

    /// Stores a value, replacing any previous one.
    fn set(&self, namespace: &str, value: &str) -> Result<(), CacheError>;
}

/// Everything the engine caches locally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    /// Format version.
    #[serde(default)]
    pub version: u32,
    /// Sessions with their messages.
    #[serde(default)]
    pub sessions: Vec<ConversationSession>,
    /// Remote sessions deleted locally.
    #[serde(default)]
    pub deleted_remote_ids: Vec<RemoteSessionId>,
    /// The session selected when the snapshot was taken.
    #[serde(default)]
    pub active: Option<LocalSessionId>,
}

impl CacheSnapshot {
    /// Captures the state of a store.
    #[must_use]
    pub fn capture(store: &SessionStore) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            sessions: store.sessions().into_iter().cloned().collect(),
            deleted_remote_ids: store.deleted_remote_ids().iter().cloned().collect(),
            active: store.active_id(),
        }
    }

    /// Rebuilds a store from this snapshot.
    #[must_use]
    pub fn into_store(self) -> SessionStore {
        SessionStore::restore(self.sessions, self.deleted_remote_ids, self.active)
    }

    /// Reads the snapshot under `namespace`.
    ///
    /// Missing, unreadable or corrupt entries yield an empty snapshot.
    #[must_use]
    pub fn load(cache: &dyn LocalCache, namespace: &str) -> Self {
        let raw = match cache.get(namespace) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Self::default(),
            Err(e) => {
                warn!(namespace, error = %e, "failed to read session cache");
                return Self::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let err = CacheError::Corrupt {
                    reason: e.to_string(),
                };
                warn!(namespace, error = %err, "discarding unreadable session cache");
                Self::default()
            }
        }
    }

    /// Writes this snapshot under `namespace`.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn store(&self, cache: &dyn LocalCache, namespace: &str) -> Result<(), CacheError> {
        let raw = serde_json::to_string(self).map_err(|e| CacheError::WriteFailed {
            reason: e.to_string(),
        })?;
        cache.set(namespace, &raw)
    }
}

/// Process-local cache, lost on exit.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemoryCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalCache for InMemoryCache {
    fn get(&self, namespace: &str) -> Result<Option<String>, CacheError> {
        let entries = self.entries.lock().map_err(|e| CacheError::ReadFailed {
            reason: e.to_string(),
        })?;
        Ok(entries.get(namespace).cloned())
    }

    fn set(&self, namespace: &str, value: &str) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().map_err(|e| CacheError::WriteFailed {
            reason: e.to_string(),
        })?;
        entries.insert(namespace.to_string(), value.to_string());
        Ok(())
    }
}

/// Cache backed by one JSON file per namespace in a directory.
///
/// Writes go to a temporary file that is renamed over the target, so a
/// crash mid-write leaves the previous value intact.
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    /// Creates a cache rooted at `dir`. The directory is created on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the directory holding the cache files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, namespace: &str) -> PathBuf {
        let file_name: String = namespace
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{file_name}.json"))
    }
}

impl LocalCache for FileCache {
    fn get(&self, namespace: &str) -> Result<Option<String>, CacheError> {
        match fs::read_to_string(self.path_for(namespace)) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::ReadFailed {
                reason: e.to_string(),
            }),
        }
    }

    fn set(&self, namespace: &str, value: &str) -> Result<(), CacheError> {
        let write_failed = |e: std::io::Error| CacheError::WriteFailed {
            reason: e.to_string(),
        };

        fs::create_dir_all(&self.dir).map_err(write_failed)?;
        let path = self.path_for(namespace);
        let tmp_path = path.with_extension("json.tmp");

        let mut file = fs::File::create(&tmp_path).map_err(write_failed)?;
        file.write_all(value.as_bytes()).map_err(write_failed)?;
        file.sync_all().map_err(write_failed)?;
        drop(file);

        fs::rename(&tmp_path, &path).map_err(write_failed)
    }
}
