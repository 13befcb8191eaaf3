// SPDX-License-Identifier: MIT OR Apache-2.0
//! The session bridge: session table, consumer plane, slash dispatch.

use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::debug;
use uuid::Uuid;

use swb_adapter::{AdapterError, AdapterRegistry, SlashContext};
use swb_core::lifecycle::{self, LifecycleSignal};
use swb_core::{MessageBuilder, MessageType, Role, UnifiedMessage};
use swb_telemetry::{BrokerEvent, EventBus, JsonLineTracer, Tracer};

use crate::connector::{self, ConnectBackendOptions};
use crate::consumer::{
    AuthContext, Authenticator, CLOSE_AUTH_FAILED, ConsumerRole, ConsumerSocket, Identity,
};
use crate::frames;
use crate::passthrough::PendingPassthrough;
use crate::session::{ConsumerEntry, SessionHandle};
use crate::slash::{CommandRouting, command_name};

/// Bridge-level failures.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Neither the requested adapter nor the default is registered.
    #[error("unknown adapter `{0}`")]
    UnknownAdapter(String),

    /// The session does not exist.
    #[error("unknown session {0}")]
    UnknownSession(String),

    /// The session is closed; no further operations are accepted.
    #[error("session {0} is closed")]
    SessionClosed(String),

    /// No backend session could be taken over.
    #[error("no backend stream for session {0}")]
    NoBackend(String),

    /// Adapter-level failure during connect.
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

/// Bridge tuning.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Adapter used when a session names none.
    pub default_adapter: String,
    /// Consumer authentication deadline.
    pub auth_timeout: Duration,
    /// Capabilities handshake deadline.
    pub capabilities_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_adapter: "agent-sdk".into(),
            auth_timeout: Duration::from_millis(5_000),
            capabilities_timeout: Duration::from_millis(10_000),
        }
    }
}

pub(crate) struct BridgeInner {
    pub sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
    pub adapters: Arc<AdapterRegistry>,
    pub config: BridgeConfig,
    pub slash: Arc<crate::slash::SlashRegistry>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    pub bus: EventBus,
    pub tracer: Arc<dyn Tracer>,
}

/// Owns the session table and the consumer plane.
#[derive(Clone)]
pub struct SessionBridge {
    inner: Arc<BridgeInner>,
}

impl SessionBridge {
    /// Create a bridge over the given adapter registry.
    #[must_use]
    pub fn new(adapters: Arc<AdapterRegistry>, config: BridgeConfig) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                sessions: Mutex::new(HashMap::new()),
                adapters,
                config,
                slash: Arc::new(crate::slash::SlashRegistry::new()),
                authenticator: None,
                bus: EventBus::new(),
                tracer: Arc::new(JsonLineTracer),
            }),
        }
    }

    /// Replace the authenticator (dev mode runs without one).
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        let inner = Arc::get_mut(&mut self.inner).expect("bridge not yet shared");
        inner.authenticator = Some(authenticator);
        self
    }

    /// Replace the event bus.
    #[must_use]
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        let inner = Arc::get_mut(&mut self.inner).expect("bridge not yet shared");
        inner.bus = bus;
        self
    }

    /// Replace the trace sink.
    #[must_use]
    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        let inner = Arc::get_mut(&mut self.inner).expect("bridge not yet shared");
        inner.tracer = tracer;
        self
    }

    /// The event bus this bridge publishes on.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// The shared slash registry.
    #[must_use]
    pub fn slash_registry(&self) -> Arc<crate::slash::SlashRegistry> {
        Arc::clone(&self.inner.slash)
    }

    // ── Session table ───────────────────────────────────────────────────

    /// Fetch or create the session with the given id. Idempotent.
    pub fn get_or_create_session(&self, session_id: &str) -> Arc<SessionHandle> {
        self.inner
            .sessions
            .lock()
            .expect("session table lock poisoned")
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(SessionHandle::new(session_id)))
            .clone()
    }

    /// Fetch an existing session.
    #[must_use]
    pub fn session(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.inner
            .sessions
            .lock()
            .expect("session table lock poisoned")
            .get(session_id)
            .cloned()
    }

    /// All session ids, sorted.
    #[must_use]
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .sessions
            .lock()
            .expect("session table lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// All sessions.
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<SessionHandle>> {
        self.inner
            .sessions
            .lock()
            .expect("session table lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    // ── Consumer plane ──────────────────────────────────────────────────

    /// Authenticate and attach a consumer socket to a session.
    pub async fn handle_consumer_open(
        &self,
        session_id: &str,
        socket: Arc<dyn ConsumerSocket>,
        auth: AuthContext,
    ) {
        let session = self.get_or_create_session(session_id);

        let identity = match &self.inner.authenticator {
            None => Identity::anonymous(),
            Some(authenticator) => {
                match timeout(
                    self.inner.config.auth_timeout,
                    authenticator.authenticate(&auth),
                )
                .await
                {
                    Ok(Ok(identity)) => identity,
                    Ok(Err(e)) => {
                        self.reject_consumer(session_id, &socket, &e.to_string());
                        return;
                    }
                    Err(_) => {
                        self.reject_consumer(session_id, &socket, "timeout");
                        return;
                    }
                }
            }
        };

        // The session may have been removed while authentication was
        // pending; that is indistinguishable from a failed login.
        let still_there = self.session(session_id);
        let closed = match &still_there {
            Some(session) => session.core.lock().await.closed,
            None => true,
        };
        if closed {
            self.reject_consumer(session_id, &socket, "session removed");
            return;
        }

        session.add_consumer(ConsumerEntry {
            socket: Arc::clone(&socket),
            identity: identity.clone(),
        });
        socket.send(&frames::identity_frame(&identity).to_string());
        {
            let core = session.core.lock().await;
            socket.send(&frames::session_init_frame(&session.id, &core.state).to_string());
            if let Some(caps) = &core.state.capabilities {
                let caps = serde_json::to_value(caps).unwrap_or(Value::Null);
                socket.send(&frames::capabilities_ready_frame(&caps).to_string());
            }
        }
        session.touch();
        self.inner.bus.publish(BrokerEvent::ConsumerAuthenticated {
            session_id: session_id.to_string(),
            role: identity.role.as_str().to_string(),
        });
    }

    fn reject_consumer(&self, session_id: &str, socket: &Arc<dyn ConsumerSocket>, reason: &str) {
        socket.close(CLOSE_AUTH_FAILED, "Authentication failed");
        self.inner.bus.publish(BrokerEvent::ConsumerAuthFailed {
            session_id: session_id.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Handle one raw inbound consumer payload.
    pub async fn handle_consumer_message(&self, session_id: &str, socket_id: &str, raw: &str) {
        let Some(session) = self.session(session_id) else {
            return;
        };
        // Unregistered or mid-auth sockets are dropped silently.
        let Some(entry) = session.consumer(socket_id) else {
            return;
        };

        let parsed: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(_) => {
                entry
                    .socket
                    .send(&frames::error_frame("invalid JSON payload").to_string());
                return;
            }
        };
        let msg_type = parsed.get("type").and_then(Value::as_str).unwrap_or("");

        // Role gate: observers only get presence.
        if entry.identity.role == ConsumerRole::Observer && msg_type != "presence_query" {
            let text = format!("Observers cannot send {msg_type} messages");
            entry.socket.send(&frames::error_frame(&text).to_string());
            return;
        }

        session.touch();
        match msg_type {
            "user_message" => {
                let content = parsed.get("content").and_then(Value::as_str).unwrap_or("");
                let msg = UnifiedMessage::user_text(content);
                self.consumer_lifecycle(&session, &msg).await;
                self.forward_or_buffer(&session, msg).await;
            }

            "interrupt" => {
                let msg = MessageBuilder::new(MessageType::Interrupt, Role::User).build();
                self.forward_or_buffer(&session, msg).await;
            }

            "permission_response" => {
                let request_id = parsed.get("request_id").cloned().unwrap_or(Value::Null);
                let key = connector::permission_key(&request_id);
                let known = session
                    .pending_permissions
                    .lock()
                    .expect("permission lock poisoned")
                    .remove(&key)
                    .is_some();
                if !known {
                    debug!(
                        target: "swb.bridge",
                        session_id,
                        request_id = %key,
                        "permission response without pending request"
                    );
                }
                let behavior = parsed
                    .get("behavior")
                    .and_then(Value::as_str)
                    .unwrap_or("deny");
                self.inner.bus.publish(BrokerEvent::PermissionResolved {
                    session_id: session_id.to_string(),
                    request_id: key,
                    behavior: behavior.to_string(),
                });

                let mut builder =
                    MessageBuilder::new(MessageType::PermissionResponse, Role::User)
                        .meta("request_id", request_id)
                        .meta("behavior", json!(behavior));
                for field in ["updated_input", "message", "option_id"] {
                    if let Some(v) = parsed.get(field) {
                        builder = builder.meta(field, v.clone());
                    }
                }
                self.forward_or_buffer(&session, builder.build()).await;
            }

            "slash_command" => {
                let command = parsed
                    .get("command")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let request_id = parsed
                    .get("request_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("req-{}", Uuid::new_v4()));
                self.handle_slash_command(&session, &command, &request_id)
                    .await;
            }

            "presence_query" => {
                let identities = session.consumer_identities();
                entry
                    .socket
                    .send(&frames::presence_frame(&identities).to_string());
            }

            other => {
                let text = format!("unknown message type `{other}`");
                entry.socket.send(&frames::error_frame(&text).to_string());
            }
        }
    }

    /// Detach a consumer socket. No state cleanup beyond the set.
    pub fn handle_consumer_close(&self, session_id: &str, socket_id: &str) {
        if let Some(session) = self.session(session_id) {
            session.remove_consumer(socket_id);
        }
    }

    // ── Backend plumbing ────────────────────────────────────────────────

    /// Bind a backend to the session.
    ///
    /// # Errors
    ///
    /// Propagates adapter connect failures and closed-session errors.
    pub async fn connect_backend(
        &self,
        session_id: &str,
        options: ConnectBackendOptions,
    ) -> Result<(), BridgeError> {
        let session = self.get_or_create_session(session_id);
        connector::connect_backend(&self.inner, &session, options).await
    }

    /// Tear down the session's backend, cancelling pending permissions.
    pub async fn disconnect_backend(&self, session_id: &str) {
        if let Some(session) = self.session(session_id) {
            connector::disconnect_backend(&self.inner, &session).await;
        }
    }

    /// Forward a canonical message to the session's backend (or buffer it).
    pub async fn send_to_backend(&self, session_id: &str, msg: UnifiedMessage) {
        if let Some(session) = self.session(session_id) {
            self.forward_or_buffer(&session, msg).await;
        }
    }

    async fn forward_or_buffer(&self, session: &Arc<SessionHandle>, msg: UnifiedMessage) {
        let has_backend = {
            let mut core = session.core.lock().await;
            if core.closed {
                return;
            }
            if core.backend.is_none() {
                core.pending_messages.push_back(msg.clone());
                false
            } else {
                true
            }
        };
        if has_backend {
            connector::send_to_backend(&self.inner, session, msg).await;
        }
    }

    async fn consumer_lifecycle(&self, session: &Arc<SessionHandle>, msg: &UnifiedMessage) {
        let mut core = session.core.lock().await;
        if let Some(next) = lifecycle::transition_for_consumer_message(core.lifecycle, msg) {
            core.lifecycle = next;
        }
    }

    // ── Slash commands ──────────────────────────────────────────────────

    /// Dispatch a slash command: local, executor, or passthrough.
    pub async fn handle_slash_command(
        &self,
        session: &Arc<SessionHandle>,
        command_line: &str,
        request_id: &str,
    ) {
        let started = Instant::now();
        let name = command_name(command_line);
        if name.is_empty() {
            session.broadcast(&frames::slash_command_error_frame(
                command_line,
                request_id,
                "empty command",
            ));
            return;
        }

        let registered = self.inner.slash.get(name);
        let is_local = registered
            .as_ref()
            .is_some_and(|c| c.routing == CommandRouting::Consumer);

        if is_local {
            let state = session.core.lock().await.state.clone();
            match self.inner.slash.execute_local(name, &state) {
                Ok(content) => {
                    session.broadcast(&frames::slash_command_result_frame(
                        command_line,
                        request_id,
                        &content,
                        "emulated",
                    ));
                    self.inner.bus.publish(BrokerEvent::SlashCommandExecuted {
                        session_id: session.id.clone(),
                        command: command_line.to_string(),
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Err(error) => {
                    session.broadcast(&frames::slash_command_error_frame(
                        command_line,
                        request_id,
                        &error,
                    ));
                    self.inner.bus.publish(BrokerEvent::SlashCommandFailed {
                        session_id: session.id.clone(),
                        command: command_line.to_string(),
                        error,
                    });
                }
            }
            return;
        }

        // Explicit executor path: the adapter services the command without
        // the forwarding round-trip.
        let executor = {
            let core = session.core.lock().await;
            core.slash_executor
                .as_ref()
                .filter(|e| e.supported_commands().iter().any(|c| c == name))
                .cloned()
        };
        if let Some(executor) = executor {
            let ctx = SlashContext {
                session_id: session.id.clone(),
                cwd: session.core.lock().await.state.cwd.clone(),
            };
            match executor.execute(&ctx, command_line).await {
                Ok(output) => {
                    session.broadcast(&frames::slash_command_result_frame(
                        command_line,
                        request_id,
                        &output.content,
                        "cli",
                    ));
                    self.inner.bus.publish(BrokerEvent::SlashCommandExecuted {
                        session_id: session.id.clone(),
                        command: command_line.to_string(),
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                }
                Err(e) => {
                    let error = e.to_string();
                    session.broadcast(&frames::slash_command_error_frame(
                        command_line,
                        request_id,
                        &error,
                    ));
                    self.inner.bus.publish(BrokerEvent::SlashCommandFailed {
                        session_id: session.id.clone(),
                        command: command_line.to_string(),
                        error,
                    });
                }
            }
            return;
        }

        // Passthrough: record, then forward the command text as a user turn.
        // The consumption loop intercepts the reply.
        session
            .passthrough
            .lock()
            .expect("passthrough lock poisoned")
            .push(PendingPassthrough {
                command: command_line.to_string(),
                request_id: request_id.to_string(),
                trace_id: format!("trace-{}", Uuid::new_v4()),
                started_at: started,
            });
        self.forward_or_buffer(session, UnifiedMessage::user_text(command_line))
            .await;
    }

    // ── Teardown ────────────────────────────────────────────────────────

    /// Transition the session to `closed`, releasing everything.
    pub async fn close_session(&self, session_id: &str) {
        let Some(session) = self.session(session_id) else {
            return;
        };
        {
            let mut core = session.core.lock().await;
            if core.closed {
                return;
            }
            core.closed = true;
            connector::apply_signal(&mut core, LifecycleSignal::Closing);
            if let Some(abort) = core.backend_abort.take() {
                abort.cancel();
            }
            if let Some(mut backend) = core.backend.take() {
                let _ = backend.close().await;
            }
            core.backend_session_id = None;
            core.slash_executor = None;
            session.set_cli_connected(false);
            connector::apply_signal(&mut core, LifecycleSignal::Closed);
        }

        // Pending work dies with the session.
        let cancelled = session
            .passthrough
            .lock()
            .expect("passthrough lock poisoned")
            .cancel_all();
        for entry in cancelled {
            session.broadcast(&frames::slash_command_error_frame(
                &entry.command,
                &entry.request_id,
                "session closed",
            ));
        }
        let drained: Vec<(String, Value)> = session
            .pending_permissions
            .lock()
            .expect("permission lock poisoned")
            .drain()
            .collect();
        for (_, request_id) in drained {
            session.broadcast_to_participants(&frames::permission_cancelled_frame(&request_id));
        }

        session.close_consumers(1000, "session closed");
        self.inner.bus.publish(BrokerEvent::SessionClosed {
            session_id: session_id.to_string(),
        });
    }

    /// Close and drop the session from the table.
    pub async fn remove_session(&self, session_id: &str) {
        self.close_session(session_id).await;
        self.inner
            .sessions
            .lock()
            .expect("session table lock poisoned")
            .remove(session_id);
    }

    /// Close every session (shutdown path).
    pub async fn close_all(&self) {
        for id in self.session_ids() {
            self.close_session(&id).await;
        }
    }
}

impl std::fmt::Debug for SessionBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBridge")
            .field("sessions", &self.session_ids().len())
            .finish_non_exhaustive()
    }
}
