// SPDX-License-Identifier: MIT OR Apache-2.0
//! The session registry: persistent metadata, persisted on every mutation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::storage::{RegistrySessionState, SessionRecord, SessionStorage, StorageError};

/// Registry of session metadata kept consistent with a [`SessionStorage`].
pub struct SessionRegistry {
    storage: Arc<dyn SessionStorage>,
    records: Mutex<HashMap<String, SessionRecord>>,
}

impl SessionRegistry {
    /// Create an empty registry over the given storage.
    #[must_use]
    pub fn new(storage: Arc<dyn SessionStorage>) -> Self {
        Self {
            storage,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Load every persisted record into memory, returning them.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn restore(&self) -> Result<Vec<SessionRecord>, StorageError> {
        let records = self.storage.list_sessions().await?;
        let mut table = self.records.lock().expect("registry lock poisoned");
        for record in &records {
            table.insert(record.session_id.clone(), record.clone());
        }
        Ok(records)
    }

    /// Register a new session.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn register(&self, record: SessionRecord) -> Result<(), StorageError> {
        self.storage.save_session(&record).await?;
        self.records
            .lock()
            .expect("registry lock poisoned")
            .insert(record.session_id.clone(), record);
        Ok(())
    }

    /// Look up a record.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<SessionRecord> {
        self.records
            .lock()
            .expect("registry lock poisoned")
            .get(session_id)
            .cloned()
    }

    /// Every record, sorted by session id.
    #[must_use]
    pub fn list(&self) -> Vec<SessionRecord> {
        let mut records: Vec<SessionRecord> = self
            .records
            .lock()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        records.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        records
    }

    /// Remove a record.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn remove(&self, session_id: &str) -> Result<(), StorageError> {
        self.storage.delete_session(session_id).await?;
        self.records
            .lock()
            .expect("registry lock poisoned")
            .remove(session_id);
        Ok(())
    }

    /// Update one record in place and persist it.
    ///
    /// No-op for unknown sessions.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn update<F>(&self, session_id: &str, mutate: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut SessionRecord),
    {
        let updated = {
            let mut table = self.records.lock().expect("registry lock poisoned");
            match table.get_mut(session_id) {
                Some(record) => {
                    mutate(record);
                    Some(record.clone())
                }
                None => None,
            }
        };
        if let Some(record) = updated {
            self.storage.save_session(&record).await?;
        }
        Ok(())
    }

    /// Record the backend session id for resume.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn set_backend_session_id(
        &self,
        session_id: &str,
        backend_session_id: &str,
    ) -> Result<(), StorageError> {
        self.update(session_id, |r| {
            r.backend_session_id = Some(backend_session_id.to_string());
        })
        .await
    }

    /// Mark the session connected.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn mark_connected(&self, session_id: &str) -> Result<(), StorageError> {
        self.update(session_id, |r| r.state = RegistrySessionState::Connected)
            .await
    }

    /// Archive a session (never relaunched again).
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub async fn archive(&self, session_id: &str) -> Result<(), StorageError> {
        self.update(session_id, |r| r.archived = true).await
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("records", &self.list().len())
            .finish_non_exhaustive()
    }
}
