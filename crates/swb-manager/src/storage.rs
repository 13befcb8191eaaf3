// SPDX-License-Identifier: MIT OR Apache-2.0
//! Narrow persistence contracts and the in-memory / file-backed
//! implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Coarse registry state for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrySessionState {
    /// Registered, backend not yet confirmed.
    Starting,
    /// Backend bound at least once.
    Connected,
}

/// Persistent session metadata, independent of subprocess presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Broker-side session id.
    pub session_id: String,
    /// Adapter the session runs on.
    pub adapter_name: String,
    /// Working directory.
    pub cwd: Option<String>,
    /// Backend-assigned id used for resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_session_id: Option<String>,
    /// Archived sessions are never relaunched.
    #[serde(default)]
    pub archived: bool,
    /// Coarse state.
    pub state: RegistrySessionState,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Storage-layer failures.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Filesystem failure.
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization failure.
    #[error("storage serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

/// Persistent session metadata store.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Persist (insert or replace) a record.
    async fn save_session(&self, record: &SessionRecord) -> Result<(), StorageError>;

    /// Load one record.
    async fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StorageError>;

    /// Load every record.
    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StorageError>;

    /// Remove a record. Removing a missing record is not an error.
    async fn delete_session(&self, session_id: &str) -> Result<(), StorageError>;
}

/// Opaque launcher-state store (one JSON document).
#[async_trait]
pub trait LauncherStateStorage: Send + Sync {
    /// Load the persisted state, if any.
    async fn load_launcher_state(&self) -> Result<Option<Value>, StorageError>;

    /// Persist the state document.
    async fn save_launcher_state(&self, state: &Value) -> Result<(), StorageError>;
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

/// In-memory [`SessionStorage`] for tests and dev mode.
#[derive(Debug, Default)]
pub struct InMemorySessionStorage {
    records: Mutex<HashMap<String, SessionRecord>>,
}

impl InMemorySessionStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStorage for InMemorySessionStorage {
    async fn save_session(&self, record: &SessionRecord) -> Result<(), StorageError> {
        self.records
            .lock()
            .expect("storage lock poisoned")
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StorageError> {
        Ok(self
            .records
            .lock()
            .expect("storage lock poisoned")
            .get(session_id)
            .cloned())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StorageError> {
        let mut records: Vec<SessionRecord> = self
            .records
            .lock()
            .expect("storage lock poisoned")
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(records)
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), StorageError> {
        self.records
            .lock()
            .expect("storage lock poisoned")
            .remove(session_id);
        Ok(())
    }
}

/// In-memory [`LauncherStateStorage`].
#[derive(Debug, Default)]
pub struct InMemoryLauncherStateStorage {
    state: Mutex<Option<Value>>,
}

impl InMemoryLauncherStateStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LauncherStateStorage for InMemoryLauncherStateStorage {
    async fn load_launcher_state(&self) -> Result<Option<Value>, StorageError> {
        Ok(self.state.lock().expect("storage lock poisoned").clone())
    }

    async fn save_launcher_state(&self, state: &Value) -> Result<(), StorageError> {
        *self.state.lock().expect("storage lock poisoned") = Some(state.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File-backed implementations
// ---------------------------------------------------------------------------

/// File-backed [`SessionStorage`]: one pretty-printed JSON file per session.
#[derive(Debug)]
pub struct FileSessionStorage {
    dir: PathBuf,
}

impl FileSessionStorage {
    /// Store records under `dir` (created on first save).
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        // Session ids are uuids; keep the guard anyway.
        let safe: String = session_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

#[async_trait]
impl SessionStorage for FileSessionStorage {
    async fn save_session(&self, record: &SessionRecord) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_string_pretty(record)?;
        tokio::fs::write(self.path_for(&record.session_id), json).await?;
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StorageError> {
        match tokio::fs::read_to_string(self.path_for(session_id)).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>, StorageError> {
        let mut records = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read_to_string(entry.path()).await?;
            match serde_json::from_str(&content) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(
                        target: "swb.storage",
                        path = %entry.path().display(),
                        "skipping unreadable session record: {e}"
                    );
                }
            }
        }
        records.sort_by(|a: &SessionRecord, b: &SessionRecord| a.session_id.cmp(&b.session_id));
        Ok(records)
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path_for(session_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// File-backed [`LauncherStateStorage`]: a single JSON document.
#[derive(Debug)]
pub struct FileLauncherStateStorage {
    path: PathBuf,
}

impl FileLauncherStateStorage {
    /// Store the document at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl LauncherStateStorage for FileLauncherStateStorage {
    async fn load_launcher_state(&self) -> Result<Option<Value>, StorageError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_launcher_state(&self, state: &Value) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, serde_json::to_string_pretty(state)?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> SessionRecord {
        SessionRecord {
            session_id: id.into(),
            adapter_name: "acp".into(),
            cwd: Some("/work".into()),
            backend_session_id: None,
            archived: false,
            state: RegistrySessionState::Starting,
        }
    }

    #[tokio::test]
    async fn in_memory_roundtrip() {
        let storage = InMemorySessionStorage::new();
        storage.save_session(&record("s-1")).await.unwrap();
        let loaded = storage.load_session("s-1").await.unwrap().unwrap();
        assert_eq!(loaded.adapter_name, "acp");

        storage.delete_session("s-1").await.unwrap();
        assert!(storage.load_session("s-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileSessionStorage::new(dir.path());

        storage.save_session(&record("s-2")).await.unwrap();
        storage.save_session(&record("s-1")).await.unwrap();

        let listed = storage.list_sessions().await.unwrap();
        assert_eq!(listed.len(), 2);
        // Deterministic order.
        assert_eq!(listed[0].session_id, "s-1");

        storage.delete_session("s-1").await.unwrap();
        assert_eq!(storage.list_sessions().await.unwrap().len(), 1);
        // Deleting again is fine.
        storage.delete_session("s-1").await.unwrap();
    }

    #[tokio::test]
    async fn file_storage_skips_corrupt_records() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileSessionStorage::new(dir.path());
        storage.save_session(&record("s-1")).await.unwrap();
        std::fs::write(dir.path().join("junk.json"), "not json").unwrap();

        let listed = storage.list_sessions().await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn launcher_state_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileLauncherStateStorage::new(dir.path().join("launcher.json"));
        assert!(storage.load_launcher_state().await.unwrap().is_none());

        let state = serde_json::json!({"sessions": {"s-1": {"pid": 42}}});
        storage.save_launcher_state(&state).await.unwrap();
        let loaded = storage.load_launcher_state().await.unwrap().unwrap();
        assert_eq!(loaded["sessions"]["s-1"]["pid"], 42);
    }
}
