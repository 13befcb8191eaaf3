// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! swb-daemon
#![deny(unsafe_code)]

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as AxPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

use swb_adapter::AdapterRegistry;
use swb_bridge::{AuthContext, ConsumerSocket, SessionBridge};
use swb_config::SwitchboardConfig;
use swb_manager::{CreateSessionOptions, ManagerError, SessionManager, Transport};
use swb_supervisor::{
    ProcessSpec, ProcessSupervisor, SupervisorConfig, TokioProcessManager,
};
use swb_telemetry::EventBus;

// ---------------------------------------------------------------------------
// Adapter wiring
// ---------------------------------------------------------------------------

/// Build the adapter registry (and its supervisors) from configuration.
///
/// Stdio profiles (`acp`, `gemini`, `codex`) spawn the configured command;
/// an `opencode` entry whose command is an `http(s)://` URL attaches to a
/// running server; an `sdk-url` entry binds its command as a local listen
/// address and waits for the external process.
pub async fn build_adapters(
    config: &SwitchboardConfig,
    bus: &EventBus,
) -> (Arc<AdapterRegistry>, Vec<Arc<ProcessSupervisor>>) {
    let mut registry = AdapterRegistry::new();
    let mut supervisors = Vec::new();

    for (name, entry) in &config.adapters {
        match name.as_str() {
            "acp" | "gemini" | "codex" => {
                let supervisor = Arc::new(ProcessSupervisor::new(
                    Arc::new(TokioProcessManager),
                    SupervisorConfig {
                        kill_grace_period: std::time::Duration::from_millis(
                            config.kill_grace_period_ms,
                        ),
                        crash_threshold: std::time::Duration::from_millis(
                            config.crash_threshold_ms,
                        ),
                        failure_threshold: config.failure_threshold,
                        event_prefix: name.clone(),
                    },
                    bus.clone(),
                ));
                let mut spec = ProcessSpec::new(&entry.command);
                spec.args = entry.args.clone();
                spec.env = entry.env.clone();

                let adapter = match name.as_str() {
                    "gemini" => acp_bridge::JsonRpcAdapter::gemini(Arc::clone(&supervisor), spec),
                    "codex" => acp_bridge::JsonRpcAdapter::codex(Arc::clone(&supervisor), spec),
                    _ => acp_bridge::JsonRpcAdapter::acp(Arc::clone(&supervisor), spec),
                };
                registry.register(Arc::new(adapter));
                supervisors.push(supervisor);
            }
            "opencode" if entry.command.starts_with("http") => {
                registry.register(Arc::new(opencode_bridge::OpencodeAdapter::attach(
                    &entry.command,
                )));
            }
            "sdk-url" => match sdk_bridge::UrlForwardAdapter::bind(&entry.command).await {
                Ok(adapter) => registry.register(Arc::new(adapter)),
                Err(e) => {
                    tracing::warn!(target: "swb.daemon", addr = %entry.command, "sdk-url bind failed: {e}");
                }
            },
            other => {
                tracing::warn!(target: "swb.daemon", adapter = other, "unrecognized adapter entry, skipping");
            }
        }
    }

    (Arc::new(registry), supervisors)
}

// ---------------------------------------------------------------------------
// Consumer socket over axum WebSocket
// ---------------------------------------------------------------------------

enum Outgoing {
    Text(String),
    Close(u16, String),
}

struct WsConsumerSocket {
    id: String,
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl ConsumerSocket for WsConsumerSocket {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, payload: &str) {
        // Non-blocking by contract: the writer task drains the queue; a
        // closed socket just drops the payload.
        let _ = self.tx.send(Outgoing::Text(payload.to_string()));
    }

    fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(Outgoing::Close(code, reason.to_string()));
    }
}

async fn run_consumer_socket(ws: WebSocket, bridge: SessionBridge, session_id: String, auth: AuthContext) {
    use futures::{SinkExt, StreamExt};

    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();
    let socket_id = format!("ws-{}", Uuid::new_v4());

    let writer = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            match item {
                Outgoing::Text(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outgoing::Close(code, reason) => {
                    let _ = sink
                        .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let socket = Arc::new(WsConsumerSocket {
        id: socket_id.clone(),
        tx,
    });
    bridge
        .handle_consumer_open(&session_id, socket, auth)
        .await;

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                bridge
                    .handle_consumer_message(&session_id, &socket_id, text.as_str())
                    .await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    bridge.handle_consumer_close(&session_id, &socket_id);
    writer.abort();
    debug!(target: "swb.daemon", session_id, socket_id, "consumer socket closed");
}

// ---------------------------------------------------------------------------
// HTTP surface
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct AppState {
    manager: SessionManager,
}

#[derive(Debug, Deserialize)]
struct CreateSessionBody {
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    adapter: Option<String>,
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({"error": self.message}))).into_response()
    }
}

impl From<ManagerError> for ApiError {
    fn from(e: ManagerError) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: e.to_string(),
        }
    }
}

/// Build the daemon router.
pub fn build_app(manager: SessionManager) -> Router {
    Router::new()
        .route("/health", get(cmd_health))
        .route("/sessions", get(cmd_list_sessions).post(cmd_create_session))
        .route("/sessions/{id}", axum::routing::delete(cmd_delete_session))
        .route("/sessions/{id}/archive", post(cmd_archive_session))
        .route("/ws/{session_id}", get(cmd_consumer_ws))
        .with_state(AppState { manager })
}

async fn cmd_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "contract_version": swb_core::CONTRACT_VERSION,
        "sessions": state.manager.session_overviews().len(),
        "events": state.manager.metrics().snapshot(),
    }))
}

async fn cmd_list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.session_overviews())
}

async fn cmd_create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> Result<impl IntoResponse, ApiError> {
    let session_id = state
        .manager
        .create_session(CreateSessionOptions {
            cwd: body.cwd,
            adapter_name: body.adapter,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(json!({"session_id": session_id}))))
}

async fn cmd_delete_session(
    State(state): State<AppState>,
    AxPath(id): AxPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.manager.delete_session(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cmd_archive_session(
    State(state): State<AppState>,
    AxPath(id): AxPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.manager.archive_session(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cmd_consumer_ws(
    State(state): State<AppState>,
    AxPath(session_id): AxPath<String>,
    Query(query): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    let bridge = state.manager.bridge().clone();
    let mut header_map = BTreeMap::new();
    for (name, value) in &headers {
        if let Ok(value) = value.to_str() {
            header_map.insert(name.to_string(), value.to_string());
        }
    }
    let auth = AuthContext {
        session_id: session_id.clone(),
        headers: header_map,
        query,
    };
    upgrade.on_upgrade(move |ws| run_consumer_socket(ws, bridge, session_id, auth))
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Axum-backed consumer transport.
pub struct WsTransport {
    manager: SessionManager,
    addr: SocketAddr,
    bound: Mutex<Option<SocketAddr>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl WsTransport {
    /// Create a transport serving `manager` on `addr`.
    #[must_use]
    pub fn new(manager: SessionManager, addr: SocketAddr) -> Self {
        Self {
            manager,
            addr,
            bound: Mutex::new(None),
            shutdown: Mutex::new(None),
        }
    }

    /// The address actually bound (port resolution for `:0`).
    #[must_use]
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().expect("bound lock poisoned")
    }
}

#[async_trait::async_trait]
impl Transport for WsTransport {
    async fn start(&self, _bridge: SessionBridge) -> Result<(), ManagerError> {
        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|e| ManagerError::Transport(e.to_string()))?;
        let bound = listener
            .local_addr()
            .map_err(|e| ManagerError::Transport(e.to_string()))?;
        *self.bound.lock().expect("bound lock poisoned") = Some(bound);

        let (tx, rx) = oneshot::channel();
        *self.shutdown.lock().expect("shutdown lock poisoned") = Some(tx);

        let app = build_app(self.manager.clone());
        info!(target: "swb.daemon", %bound, "listening");
        tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = rx.await;
            });
            if let Err(e) = serve.await {
                tracing::error!(target: "swb.daemon", "server error: {e}");
            }
        });
        Ok(())
    }

    async fn stop(&self) {
        if let Some(tx) = self
            .shutdown
            .lock()
            .expect("shutdown lock poisoned")
            .take()
        {
            let _ = tx.send(());
        }
    }
}
