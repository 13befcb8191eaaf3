// SPDX-License-Identifier: MIT OR Apache-2.0
//! The backend connector: binds adapters to sessions and owns each
//! session's message-consumption loop.

use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use swb_adapter::{ConnectOptions, MessageStream};
use swb_core::lifecycle::{self, LifecycleSignal};
use swb_core::state::reduce;
use swb_core::{MessageBuilder, MessageType, Role, UnifiedMessage};
use swb_telemetry::{BrokerEvent, TraceContext};

use crate::bridge::{BridgeError, BridgeInner};
use crate::cancel::CancelToken;
use crate::frames;
use crate::passthrough::{PassthroughEmission, PassthroughOutcome, PendingPassthrough};
use crate::session::{SessionCore, SessionHandle};

/// Options for binding a backend to a session.
#[derive(Debug, Clone, Default)]
pub struct ConnectBackendOptions {
    /// Adapter override for this connect; unknown names fall back to the
    /// configured default.
    pub adapter_name: Option<String>,
    /// Working directory for the backend.
    pub cwd: Option<String>,
    /// Preferred model.
    pub model: Option<String>,
}

/// Build the deduplicated capabilities control request.
#[must_use]
pub fn control_request_message() -> UnifiedMessage {
    MessageBuilder::new(MessageType::Unknown, Role::System)
        .meta("control", json!("initialize"))
        .meta("request_id", json!(format!("ctrl-{}", Uuid::new_v4())))
        .build()
}

pub(crate) async fn connect_backend(
    inner: &Arc<BridgeInner>,
    session: &Arc<SessionHandle>,
    opts: ConnectBackendOptions,
) -> Result<(), BridgeError> {
    let mut core = session.core.lock().await;
    if core.closed {
        return Err(BridgeError::SessionClosed(session.id.clone()));
    }

    // Resolve the adapter: per-connect override, then the session's own,
    // then the global default. Unknown names log and fall through.
    let requested = opts
        .adapter_name
        .clone()
        .or_else(|| core.adapter_name.clone())
        .unwrap_or_else(|| inner.config.default_adapter.clone());
    let (adapter_name, adapter) = match inner.adapters.get(&requested) {
        Some(adapter) => (requested, adapter),
        None => {
            warn!(
                target: "swb.connector",
                session_id = %session.id,
                adapter = %requested,
                "unknown adapter, falling back to default"
            );
            let default = inner.config.default_adapter.clone();
            let adapter = inner
                .adapters
                .get(&default)
                .ok_or_else(|| BridgeError::UnknownAdapter(default.clone()))?;
            (default, adapter)
        }
    };

    // Exactly one backend session at a time: abort and close any prior one.
    if let Some(abort) = core.backend_abort.take() {
        abort.cancel();
    }
    if let Some(mut previous) = core.backend.take() {
        let _ = previous.close().await;
        session.set_cli_connected(false);
    }

    let connect_opts = ConnectOptions {
        session_id: session.id.clone(),
        cwd: opts.cwd.or_else(|| core.state.cwd.clone()),
        resume: core.backend_session_id.clone(),
        model: opts.model.or_else(|| core.state.model.clone()),
        extra: Default::default(),
    };
    let mut backend = adapter.connect(connect_opts).await?;

    let rx: MessageStream = backend
        .take_messages()
        .ok_or_else(|| BridgeError::NoBackend(session.id.clone()))?;

    // Adapter-supplied slash executor: expose into state and registry.
    if let Some(executor) = backend.slash_executor() {
        let commands = executor.supported_commands();
        inner
            .slash
            .register_from_cli(commands.iter().map(|c| (c.clone(), String::new())));
        core.state.slash_commands = commands
            .into_iter()
            .map(|name| swb_core::state::SlashCommandInfo {
                name,
                description: String::new(),
                argument_hint: None,
            })
            .collect();
        core.slash_executor = Some(executor);
    }

    // CLI-echo capture for slash passthrough.
    let handler = {
        let queue = Arc::clone(&session.passthrough);
        let wake = Arc::clone(&session.claims_wake);
        Arc::new(move |raw: &Value| {
            let claimed = queue
                .lock()
                .expect("passthrough lock poisoned")
                .claim_echo(raw);
            if claimed {
                wake.notify_one();
            }
            claimed
        }) as swb_adapter::PassthroughHandler
    };
    core.supports_passthrough = backend.set_passthrough_handler(Some(handler));

    if let Some(backend_id) = backend.backend_session_id() {
        core.backend_session_id = Some(backend_id);
    }

    let abort = CancelToken::new();
    core.backend_abort = Some(abort.clone());
    core.backend = Some(backend);
    core.connected_adapter = Some(adapter_name.clone());
    session.set_cli_connected(true);
    apply_signal(&mut core, LifecycleSignal::BackendConnected);

    session.broadcast(&frames::cli_connected_frame(&adapter_name));
    inner.bus.publish(BrokerEvent::BackendConnected {
        session_id: session.id.clone(),
        adapter: adapter_name,
    });

    // Drain buffered inputs FIFO before the loop can observe any backend
    // message, so the backend sees them in submission order.
    while let Some(msg) = core.pending_messages.pop_front() {
        if let Some(backend) = &core.backend
            && let Err(e) = backend.send(msg).await
        {
            warn!(target: "swb.connector", session_id = %session.id, "buffered send failed: {e}");
        }
    }
    drop(core);
    session.touch();

    tokio::spawn(consumption_loop(
        Arc::clone(inner),
        Arc::clone(session),
        rx,
        abort,
    ));
    Ok(())
}

/// Explicit backend teardown (reconnect or close path).
pub(crate) async fn disconnect_backend(inner: &Arc<BridgeInner>, session: &Arc<SessionHandle>) {
    let mut core = session.core.lock().await;
    if let Some(abort) = core.backend_abort.take() {
        abort.cancel();
    }
    if let Some(mut backend) = core.backend.take() {
        let _ = backend.close().await;
    }
    core.backend_session_id = None;
    core.slash_executor = None;
    core.connected_adapter = None;
    session.set_cli_connected(false);
    apply_signal(&mut core, LifecycleSignal::BackendDisconnected);
    drop(core);

    cancel_pending_passthroughs(inner, session, "backend disconnected");
    cancel_pending_permissions(inner, session);
    session.broadcast(&frames::cli_disconnected_frame());
    inner.bus.publish(BrokerEvent::BackendDisconnected {
        session_id: session.id.clone(),
    });
}

/// Forward a canonical message to the bound backend.
pub(crate) async fn send_to_backend(
    inner: &Arc<BridgeInner>,
    session: &Arc<SessionHandle>,
    msg: UnifiedMessage,
) {
    let core = session.core.lock().await;
    let Some(backend) = &core.backend else {
        debug!(
            target: "swb.connector",
            session_id = %session.id,
            kind = ?msg.kind,
            "no backend bound, dropping outbound message"
        );
        return;
    };
    if let Err(e) = backend.send(msg).await {
        inner.bus.publish(BrokerEvent::Error {
            session_id: Some(session.id.clone()),
            source: "backend_send".into(),
            message: e.to_string(),
        });
    }
}

async fn consumption_loop(
    inner: Arc<BridgeInner>,
    session: Arc<SessionHandle>,
    mut rx: MessageStream,
    abort: CancelToken,
) {
    loop {
        drain_claims(&inner, &session);
        tokio::select! {
            _ = abort.cancelled() => return,
            _ = session.claims_wake.notified() => continue,
            item = rx.recv() => match item {
                Some(Ok(msg)) => handle_backend_message(&inner, &session, msg).await,
                Some(Err(e)) => {
                    finish_disconnect(&inner, &session, Some(e.to_string())).await;
                    return;
                }
                None => {
                    finish_disconnect(&inner, &session, None).await;
                    return;
                }
            },
        }
    }
}

async fn handle_backend_message(
    inner: &Arc<BridgeInner>,
    session: &Arc<SessionHandle>,
    msg: UnifiedMessage,
) {
    inner.bus.publish(BrokerEvent::BackendMessage {
        session_id: session.id.clone(),
        message_type: message_type_name(msg.kind),
    });

    // Envelope-based passthrough matching. The message itself still flows.
    let emission = session
        .passthrough
        .lock()
        .expect("passthrough lock poisoned")
        .on_canonical(&msg);
    if let Some(emission) = emission {
        broadcast_emission(inner, session, emission);
    }

    let mut core = session.core.lock().await;
    if core.closed {
        return;
    }

    match msg.kind {
        MessageType::SessionInit => {
            if let Some(backend_id) = msg.meta_str("session_id") {
                core.backend_session_id = Some(backend_id.to_string());
                inner.bus.publish(BrokerEvent::BackendSessionId {
                    session_id: session.id.clone(),
                    backend_session_id: backend_id.to_string(),
                });
            }
            if !core.capabilities_requested {
                core.capabilities_requested = true;
                let control = control_request_message();
                if let Some(backend) = &core.backend
                    && let Err(e) = backend.send(control).await
                {
                    debug!(target: "swb.connector", session_id = %session.id, "control request failed: {e}");
                }
                spawn_capabilities_timeout(inner, session);
            }
        }

        MessageType::ControlResponse => {
            if msg.meta_str("subtype") == Some("success") {
                // The reducer below fills state.capabilities; consumers get
                // the snapshot frame and the registry learns the commands.
                if let Some(commands) = msg
                    .metadata
                    .get("response")
                    .and_then(|r| r.get("commands"))
                    .and_then(Value::as_array)
                {
                    inner.slash.register_from_cli(commands.iter().filter_map(|c| {
                        let name = c.get("name").and_then(Value::as_str)?;
                        let description = c
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        Some((name.to_string(), description.to_string()))
                    }));
                }
            }
        }

        MessageType::ConfigurationChange => {
            if let Some(commands) = msg.metadata.get("slash_commands").and_then(Value::as_array) {
                inner.slash.register_from_cli(commands.iter().filter_map(|c| {
                    let name = c.get("name").and_then(Value::as_str)?;
                    let description = c
                        .get("description")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    Some((name.to_string(), description.to_string()))
                }));
            }
        }

        MessageType::PermissionRequest => {
            if let Some(request_id) = msg.metadata.get("request_id") {
                let key = permission_key(request_id);
                session
                    .pending_permissions
                    .lock()
                    .expect("permission lock poisoned")
                    .insert(key, request_id.clone());
                inner.bus.publish(BrokerEvent::PermissionRequested {
                    session_id: session.id.clone(),
                    request_id: permission_key(request_id),
                    tool_name: msg.meta_str("tool_name").unwrap_or("unknown").to_string(),
                });
            }
        }

        MessageType::AuthStatus => {
            if let Some(status) = msg.meta_str("status") {
                inner.bus.publish(BrokerEvent::AuthStatus {
                    session_id: session.id.clone(),
                    status: status.to_string(),
                });
            }
        }

        _ => {}
    }

    let had_capabilities = core.state.capabilities.is_some();
    reduce(&mut core.state, &msg);

    if !had_capabilities && core.state.capabilities.is_some() {
        let caps = serde_json::to_value(&core.state.capabilities).unwrap_or(Value::Null);
        session.broadcast(&frames::capabilities_ready_frame(&caps));
        inner.bus.publish(BrokerEvent::CapabilitiesReady {
            session_id: session.id.clone(),
        });
    }

    if let Some(next) = lifecycle::transition_for_backend_message(core.lifecycle, &msg) {
        core.lifecycle = next;
    }
    drop(core);

    // Fan-out preserves backend order: this loop is the only writer.
    if let Ok(payload) = serde_json::to_value(&msg) {
        session.broadcast(&payload);
    }
    session.touch();
}

async fn finish_disconnect(
    inner: &Arc<BridgeInner>,
    session: &Arc<SessionHandle>,
    error: Option<String>,
) {
    drain_claims(inner, session);
    cancel_pending_passthroughs(
        inner,
        session,
        error.as_deref().unwrap_or("backend disconnected"),
    );

    let mut core = session.core.lock().await;
    core.backend_abort = None;
    if let Some(mut backend) = core.backend.take() {
        let _ = backend.close().await;
    }
    core.slash_executor = None;
    core.connected_adapter = None;
    if error.is_none() {
        // Clean disconnect: the backend session id is gone with the backend.
        core.backend_session_id = None;
    }
    session.set_cli_connected(false);
    apply_signal(&mut core, LifecycleSignal::BackendDisconnected);
    drop(core);

    if let Some(message) = &error {
        inner.bus.publish(BrokerEvent::Error {
            session_id: Some(session.id.clone()),
            source: "backend_consumption".into(),
            message: message.clone(),
        });
    }

    cancel_pending_permissions(inner, session);
    session.broadcast(&frames::cli_disconnected_frame());
    // Reconnect policy belongs to the session manager: the loop only
    // reports the loss, it never reconnects.
    inner.bus.publish(BrokerEvent::BackendDisconnected {
        session_id: session.id.clone(),
    });
}

fn cancel_pending_passthroughs(
    inner: &Arc<BridgeInner>,
    session: &Arc<SessionHandle>,
    reason: &str,
) {
    let cancelled = session
        .passthrough
        .lock()
        .expect("passthrough lock poisoned")
        .cancel_all();
    for entry in cancelled {
        broadcast_emission(
            inner,
            session,
            PassthroughEmission::Error {
                error: format!("Pending passthrough \"{}\" failed: {reason}", entry.command),
                entry,
                matched_path: crate::passthrough::MatchedPath::None,
                outcome: PassthroughOutcome::BackendError,
            },
        );
    }
}

fn cancel_pending_permissions(inner: &Arc<BridgeInner>, session: &Arc<SessionHandle>) {
    let drained: Vec<(String, Value)> = session
        .pending_permissions
        .lock()
        .expect("permission lock poisoned")
        .drain()
        .collect();
    for (key, request_id) in drained {
        session.broadcast_to_participants(&frames::permission_cancelled_frame(&request_id));
        inner.bus.publish(BrokerEvent::PermissionResolved {
            session_id: session.id.clone(),
            request_id: key,
            behavior: "cancelled".into(),
        });
    }
}

pub(crate) fn drain_claims(inner: &Arc<BridgeInner>, session: &Arc<SessionHandle>) {
    let claims = session
        .passthrough
        .lock()
        .expect("passthrough lock poisoned")
        .take_claims();
    for emission in claims {
        broadcast_emission(inner, session, emission);
    }
}

pub(crate) fn broadcast_emission(
    inner: &Arc<BridgeInner>,
    session: &Arc<SessionHandle>,
    emission: PassthroughEmission,
) {
    match emission {
        PassthroughEmission::Result {
            entry,
            content,
            matched_path,
            outcome,
        } => {
            session.broadcast(&frames::slash_command_result_frame(
                &entry.command,
                &entry.request_id,
                &content,
                "cli",
            ));
            let duration_ms = entry.started_at.elapsed().as_millis() as u64;
            inner.bus.publish(BrokerEvent::SlashCommandExecuted {
                session_id: session.id.clone(),
                command: entry.command.clone(),
                duration_ms,
            });
            trace_decision(inner, session, &entry, matched_path.as_str(), outcome, duration_ms);
        }
        PassthroughEmission::Error {
            entry,
            error,
            matched_path,
            outcome,
        } => {
            session.broadcast(&frames::slash_command_error_frame(
                &entry.command,
                &entry.request_id,
                &error,
            ));
            let duration_ms = entry.started_at.elapsed().as_millis() as u64;
            inner.bus.publish(BrokerEvent::SlashCommandFailed {
                session_id: session.id.clone(),
                command: entry.command.clone(),
                error,
            });
            trace_decision(inner, session, &entry, matched_path.as_str(), outcome, duration_ms);
        }
    }
}

fn trace_decision(
    inner: &Arc<BridgeInner>,
    session: &Arc<SessionHandle>,
    entry: &PendingPassthrough,
    matched_path: &str,
    outcome: PassthroughOutcome,
    duration_ms: u64,
) {
    let ctx = TraceContext::for_session(&session.id)
        .trace_id(&entry.trace_id)
        .request_id(&entry.request_id)
        .command(&entry.command)
        .outcome(outcome.as_str());
    inner.tracer.send(
        "connector",
        "slash_decision_summary",
        json!({
            "matched_path": matched_path,
            "timings": {"duration_ms": duration_ms},
        }),
        &ctx,
    );
}

fn spawn_capabilities_timeout(inner: &Arc<BridgeInner>, session: &Arc<SessionHandle>) {
    let inner = Arc::clone(inner);
    let session = Arc::clone(session);
    let deadline: Duration = inner.config.capabilities_timeout;
    tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        let core = session.core.lock().await;
        if core.state.capabilities.is_none() && !core.closed {
            inner.bus.publish(BrokerEvent::CapabilitiesTimeout {
                session_id: session.id.clone(),
            });
        }
    });
}

pub(crate) fn apply_signal(core: &mut SessionCore, signal: LifecycleSignal) {
    if let Some(next) = lifecycle::apply_signal(core.lifecycle, signal) {
        core.lifecycle = next;
    }
}

pub(crate) fn permission_key(request_id: &Value) -> String {
    match request_id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn message_type_name(kind: MessageType) -> String {
    serde_json::to_value(kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{kind:?}"))
}
