// SPDX-License-Identifier: MIT OR Apache-2.0
//! Launcher bookkeeping for subprocess-spawning adapters.
//!
//! Tracks per-session process facts (pid, backend session id, coarse state)
//! and persists the whole table through the opaque launcher-state storage so
//! a restarted broker can reattach or relaunch.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::storage::{LauncherStateStorage, StorageError};

/// Coarse launcher state for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LauncherSessionState {
    /// Process launch requested, backend not yet confirmed.
    Starting,
    /// Backend confirmed.
    Connected,
}

/// Per-session launcher facts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LauncherSessionInfo {
    /// Broker-side session id.
    pub session_id: String,
    /// OS process id, when a subprocess is running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Adapter the session runs on.
    pub adapter_name: String,
    /// Working directory.
    pub cwd: Option<String>,
    /// Coarse state.
    pub state: LauncherSessionState,
    /// Archived sessions are never relaunched.
    #[serde(default)]
    pub archived: bool,
    /// Backend-assigned id used for resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_session_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LauncherState {
    sessions: HashMap<String, LauncherSessionInfo>,
}

/// Launcher bookkeeping, persisted on every mutation.
pub struct Launcher {
    storage: Arc<dyn LauncherStateStorage>,
    state: Mutex<LauncherState>,
}

impl Launcher {
    /// Create an empty launcher over the given storage.
    #[must_use]
    pub fn new(storage: Arc<dyn LauncherStateStorage>) -> Self {
        Self {
            storage,
            state: Mutex::new(LauncherState::default()),
        }
    }

    /// Load persisted launcher state.
    ///
    /// # Errors
    ///
    /// Propagates storage failures; a corrupt document restores empty.
    pub async fn restore(&self) -> Result<Vec<LauncherSessionInfo>, StorageError> {
        let Some(value) = self.storage.load_launcher_state().await? else {
            return Ok(Vec::new());
        };
        let restored: LauncherState = match serde_json::from_value(value) {
            Ok(state) => state,
            Err(e) => {
                warn!(target: "swb.launcher", "discarding unreadable launcher state: {e}");
                LauncherState::default()
            }
        };
        let sessions: Vec<LauncherSessionInfo> = restored.sessions.values().cloned().collect();
        *self.state.lock().expect("launcher lock poisoned") = restored;
        Ok(sessions)
    }

    async fn persist(&self) -> Result<(), StorageError> {
        let snapshot = self.state.lock().expect("launcher lock poisoned").clone();
        let value = serde_json::to_value(&snapshot)?;
        self.storage.save_launcher_state(&value).await
    }

    /// Track a session launch.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn track(&self, info: LauncherSessionInfo) -> Result<(), StorageError> {
        self.state
            .lock()
            .expect("launcher lock poisoned")
            .sessions
            .insert(info.session_id.clone(), info);
        self.persist().await
    }

    /// Fetch one session's facts.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<LauncherSessionInfo> {
        self.state
            .lock()
            .expect("launcher lock poisoned")
            .sessions
            .get(session_id)
            .cloned()
    }

    /// Forget a session.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn remove(&self, session_id: &str) -> Result<(), StorageError> {
        self.state
            .lock()
            .expect("launcher lock poisoned")
            .sessions
            .remove(session_id);
        self.persist().await
    }

    /// Record the spawned pid.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn set_pid(&self, session_id: &str, pid: Option<u32>) -> Result<(), StorageError> {
        self.mutate(session_id, |info| info.pid = pid).await
    }

    /// Record the backend session id reported by the CLI.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn set_cli_session_id(
        &self,
        session_id: &str,
        backend_session_id: &str,
    ) -> Result<(), StorageError> {
        self.mutate(session_id, |info| {
            info.backend_session_id = Some(backend_session_id.to_string());
            info.state = LauncherSessionState::Connected;
        })
        .await
    }

    async fn mutate<F>(&self, session_id: &str, apply: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut LauncherSessionInfo),
    {
        let changed = {
            let mut state = self.state.lock().expect("launcher lock poisoned");
            match state.sessions.get_mut(session_id) {
                Some(info) => {
                    apply(info);
                    true
                }
                None => false,
            }
        };
        if changed {
            self.persist().await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .state
            .lock()
            .expect("launcher lock poisoned")
            .sessions
            .len();
        f.debug_struct("Launcher")
            .field("sessions", &count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryLauncherStateStorage;

    fn info(id: &str) -> LauncherSessionInfo {
        LauncherSessionInfo {
            session_id: id.into(),
            pid: None,
            adapter_name: "acp".into(),
            cwd: None,
            state: LauncherSessionState::Starting,
            archived: false,
            backend_session_id: None,
        }
    }

    #[tokio::test]
    async fn state_survives_restore() {
        let storage = Arc::new(InMemoryLauncherStateStorage::new());
        let launcher = Launcher::new(storage.clone());
        launcher.track(info("s-1")).await.unwrap();
        launcher.set_pid("s-1", Some(42)).await.unwrap();
        launcher.set_cli_session_id("s-1", "be-1").await.unwrap();

        let other = Launcher::new(storage);
        let restored = other.restore().await.unwrap();
        assert_eq!(restored.len(), 1);
        let got = other.get("s-1").unwrap();
        assert_eq!(got.pid, Some(42));
        assert_eq!(got.backend_session_id.as_deref(), Some("be-1"));
        assert_eq!(got.state, LauncherSessionState::Connected);
    }

    #[tokio::test]
    async fn mutating_unknown_session_is_noop() {
        let launcher = Launcher::new(Arc::new(InMemoryLauncherStateStorage::new()));
        launcher.set_pid("ghost", Some(1)).await.unwrap();
        assert!(launcher.get("ghost").is_none());
    }

    #[tokio::test]
    async fn remove_forgets_session() {
        let launcher = Launcher::new(Arc::new(InMemoryLauncherStateStorage::new()));
        launcher.track(info("s-1")).await.unwrap();
        launcher.remove("s-1").await.unwrap();
        assert!(launcher.get("s-1").is_none());
    }
}
