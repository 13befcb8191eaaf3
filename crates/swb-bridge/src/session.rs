// SPDX-License-Identifier: MIT OR Apache-2.0
//! The session entity.
//!
//! Mutable session state splits in two: a sync-shared rim (consumer set,
//! passthrough queue, pending permissions, activity clock) that transport
//! callbacks and the reaper may touch, and an async-guarded core that only
//! the bridge's serialized operations mutate.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use swb_adapter::{BackendSession, SlashExecutor};
use swb_core::lifecycle::Lifecycle;
use swb_core::state::SessionState;
use swb_core::UnifiedMessage;

use crate::cancel::CancelToken;
use crate::consumer::{ConsumerRole, ConsumerSocket, Identity};
use crate::passthrough::PassthroughQueue;

/// One attached consumer.
#[derive(Clone)]
pub struct ConsumerEntry {
    /// The transport socket.
    pub socket: Arc<dyn ConsumerSocket>,
    /// The authenticated identity.
    pub identity: Identity,
}

/// The async-guarded mutable core of a session.
pub struct SessionCore {
    /// Lifecycle position.
    pub lifecycle: Lifecycle,
    /// Derived session state (reducer output).
    pub state: SessionState,
    /// The bound backend session, if any.
    pub backend: Option<Box<dyn BackendSession>>,
    /// Abort handle for the running consumption loop.
    pub backend_abort: Option<CancelToken>,
    /// Backend-assigned id used for resume.
    pub backend_session_id: Option<String>,
    /// Messages buffered before the backend was bound, FIFO.
    pub pending_messages: VecDeque<UnifiedMessage>,
    /// Per-session adapter override.
    pub adapter_name: Option<String>,
    /// Name of the currently bound adapter.
    pub connected_adapter: Option<String>,
    /// Slash executor supplied by the adapter at connect time.
    pub slash_executor: Option<Arc<dyn SlashExecutor>>,
    /// Whether the adapter accepted a passthrough handler.
    pub supports_passthrough: bool,
    /// Capabilities handshake already issued for this session.
    pub capabilities_requested: bool,
    /// Terminal flag; post-close operations fail.
    pub closed: bool,
}

impl Default for SessionCore {
    fn default() -> Self {
        Self {
            lifecycle: Lifecycle::Starting,
            state: SessionState::default(),
            backend: None,
            backend_abort: None,
            backend_session_id: None,
            pending_messages: VecDeque::new(),
            adapter_name: None,
            connected_adapter: None,
            slash_executor: None,
            supports_passthrough: false,
            capabilities_requested: false,
            closed: false,
        }
    }
}

/// A session owned by the bridge's table.
pub struct SessionHandle {
    /// Session identifier.
    pub id: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    pub(crate) consumers: Mutex<HashMap<String, ConsumerEntry>>,
    pub(crate) passthrough: Arc<Mutex<PassthroughQueue>>,
    pub(crate) pending_permissions: Mutex<HashMap<String, Value>>,
    /// The async-guarded mutable core. The bridge serializes its own access;
    /// the composition root locks it for restore-time seeding.
    pub core: tokio::sync::Mutex<SessionCore>,
    pub(crate) claims_wake: Arc<Notify>,
    last_activity: Mutex<DateTime<Utc>>,
    cli_connected: AtomicBool,
}

impl SessionHandle {
    /// Create a fresh session in the `starting` state.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            created_at: now,
            consumers: Mutex::new(HashMap::new()),
            passthrough: Arc::new(Mutex::new(PassthroughQueue::new())),
            pending_permissions: Mutex::new(HashMap::new()),
            core: tokio::sync::Mutex::new(SessionCore::default()),
            claims_wake: Arc::new(Notify::new()),
            last_activity: Mutex::new(now),
            cli_connected: AtomicBool::new(false),
        }
    }

    /// Mark activity now.
    pub fn touch(&self) {
        *self.last_activity.lock().expect("activity lock poisoned") = Utc::now();
    }

    /// Last observed activity.
    #[must_use]
    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.lock().expect("activity lock poisoned")
    }

    /// Whether a backend is currently bound.
    #[must_use]
    pub fn cli_connected(&self) -> bool {
        self.cli_connected.load(Ordering::SeqCst)
    }

    pub(crate) fn set_cli_connected(&self, connected: bool) {
        self.cli_connected.store(connected, Ordering::SeqCst);
    }

    /// Whether no permission requests are awaiting an answer.
    #[must_use]
    pub fn pending_permissions_empty(&self) -> bool {
        self.pending_permissions
            .lock()
            .expect("permission lock poisoned")
            .is_empty()
    }

    /// Number of attached consumers.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().expect("consumer lock poisoned").len()
    }

    /// Identities of attached consumers.
    #[must_use]
    pub fn consumer_identities(&self) -> Vec<Identity> {
        self.consumers
            .lock()
            .expect("consumer lock poisoned")
            .values()
            .map(|e| e.identity.clone())
            .collect()
    }

    pub(crate) fn add_consumer(&self, entry: ConsumerEntry) {
        self.consumers
            .lock()
            .expect("consumer lock poisoned")
            .insert(entry.socket.id().to_string(), entry);
    }

    pub(crate) fn remove_consumer(&self, socket_id: &str) -> Option<ConsumerEntry> {
        self.consumers
            .lock()
            .expect("consumer lock poisoned")
            .remove(socket_id)
    }

    pub(crate) fn consumer(&self, socket_id: &str) -> Option<ConsumerEntry> {
        self.consumers
            .lock()
            .expect("consumer lock poisoned")
            .get(socket_id)
            .cloned()
    }

    /// Serialize once, write to every consumer socket.
    pub fn broadcast(&self, payload: &Value) {
        let text = payload.to_string();
        for entry in self
            .consumers
            .lock()
            .expect("consumer lock poisoned")
            .values()
        {
            entry.socket.send(&text);
        }
    }

    /// Serialize once, write to participant sockets only.
    pub fn broadcast_to_participants(&self, payload: &Value) {
        let text = payload.to_string();
        for entry in self
            .consumers
            .lock()
            .expect("consumer lock poisoned")
            .values()
        {
            if entry.identity.role == ConsumerRole::Participant {
                entry.socket.send(&text);
            }
        }
    }

    /// Close every consumer socket and drop the set.
    pub(crate) fn close_consumers(&self, code: u16, reason: &str) {
        let mut consumers = self.consumers.lock().expect("consumer lock poisoned");
        for entry in consumers.values() {
            entry.socket.close(code, reason);
        }
        consumers.clear();
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("consumers", &self.consumer_count())
            .field("cli_connected", &self.cli_connected())
            .finish_non_exhaustive()
    }
}
