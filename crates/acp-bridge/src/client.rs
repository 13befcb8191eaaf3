// SPDX-License-Identifier: MIT OR Apache-2.0
//! The stdio JSON-RPC driver: spawn, handshake, reader task, session.

use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use swb_adapter::{
    AdapterError, BackendSession, ConnectOptions, MESSAGE_CHANNEL_CAPACITY, MessageStream,
    OutboundAction, PassthroughHandler,
};
use swb_core::{MessageBuilder, MessageType, Role, UnifiedMessage};
use swb_supervisor::{IoMode, ProcessSpec, ProcessSupervisor};

use crate::classify::ErrorClassifier;
use crate::codec::{RequestIdGen, RpcError, RpcMessage};
use crate::inbound::{
    is_user_echo, session_init_message, translate_permission_request, translate_prompt_result,
    translate_session_update,
};
use crate::outbound::translate_outbound;

/// Deadline for each handshake round-trip.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Protocol version this client speaks.
const PROTOCOL_VERSION: u64 = 1;

type Writer = Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;
type MessageTx = mpsc::Sender<Result<UnifiedMessage, AdapterError>>;

/// Shared slot for the canonical-stream sender.
///
/// The reader task owns stream lifetime: on EOF or stream error it empties
/// the slot, which drops the last sender and closes the consumer's channel
/// even though the session object is still alive.
type SharedTx = Arc<Mutex<Option<MessageTx>>>;

/// Send an item through the shared slot. Returns `false` once the stream is
/// closed.
async fn send_shared(slot: &SharedTx, item: Result<UnifiedMessage, AdapterError>) -> bool {
    let tx = slot.lock().expect("stream slot lock poisoned").clone();
    match tx {
        Some(tx) => tx.send(item).await.is_ok(),
        None => false,
    }
}

enum Pending {
    AwaitReply(oneshot::Sender<Result<Value, RpcError>>),
    EmitTurnResult,
}

type PendingMap = Arc<Mutex<HashMap<i64, Pending>>>;

#[derive(Default)]
struct CapsCache {
    agent_info: Option<Value>,
    commands: Vec<Value>,
    modes: Option<Value>,
}

/// A bound JSON-RPC stdio backend session.
pub struct RpcBackendSession {
    session_id: String,
    backend_session_id: Arc<Mutex<Option<String>>>,
    writer: Writer,
    ids: Arc<RequestIdGen>,
    pending: PendingMap,
    rx: Option<MessageStream>,
    msg_tx: SharedTx,
    passthrough: Arc<Mutex<Option<PassthroughHandler>>>,
    caps: Arc<Mutex<CapsCache>>,
    supervisor: Arc<ProcessSupervisor>,
    closed: Arc<AtomicBool>,
}

impl RpcBackendSession {
    /// Spawn the agent, run the handshake, and start the reader task.
    pub(crate) async fn establish(
        supervisor: Arc<ProcessSupervisor>,
        spec: ProcessSpec,
        classifier: Arc<dyn ErrorClassifier>,
        opts: ConnectOptions,
    ) -> Result<Self, AdapterError> {
        let mut spec = spec;
        if let Some(cwd) = &opts.cwd {
            spec.cwd = Some(cwd.clone());
        }

        let io = supervisor
            .spawn_process(&opts.session_id, spec, IoMode::Piped)
            .await
            .ok_or_else(|| AdapterError::Connect("agent spawn refused".into()))?;

        let stdin = io
            .stdin
            .ok_or_else(|| AdapterError::Connect("agent stdin unavailable".into()))?;
        let stdout = io
            .stdout
            .ok_or_else(|| AdapterError::Connect("agent stdout unavailable".into()))?;

        let writer: Writer = Arc::new(tokio::sync::Mutex::new(stdin));
        let ids = Arc::new(RequestIdGen::new());
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (msg_tx, msg_rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        // The handshake keeps its own sender so `session_init` lands even if
        // the agent exits the instant the handshake finishes.
        let handshake_tx = msg_tx.clone();
        let msg_tx: SharedTx = Arc::new(Mutex::new(Some(msg_tx)));
        let passthrough: Arc<Mutex<Option<PassthroughHandler>>> = Arc::new(Mutex::new(None));
        let caps = Arc::new(Mutex::new(CapsCache::default()));

        tokio::spawn(reader_loop(ReaderArgs {
            stdout,
            msg_tx: Arc::clone(&msg_tx),
            writer: Arc::clone(&writer),
            pending: Arc::clone(&pending),
            passthrough: Arc::clone(&passthrough),
            caps: Arc::clone(&caps),
            classifier: Arc::clone(&classifier),
            session_id: opts.session_id.clone(),
        }));

        let session = Self {
            session_id: opts.session_id.clone(),
            backend_session_id: Arc::new(Mutex::new(None)),
            writer,
            ids,
            pending,
            rx: Some(msg_rx),
            msg_tx,
            passthrough,
            caps,
            supervisor,
            closed: Arc::new(AtomicBool::new(false)),
        };

        session.handshake(&opts, handshake_tx).await?;
        Ok(session)
    }

    async fn handshake(
        &self,
        opts: &ConnectOptions,
        handshake_tx: MessageTx,
    ) -> Result<(), AdapterError> {
        let init = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "clientCapabilities": {
                        "fs": {"readTextFile": false, "writeTextFile": false},
                    },
                    "clientInfo": {
                        "name": "agent-switchboard",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            )
            .await?;

        let reported = init.get("protocolVersion").and_then(Value::as_u64);
        if reported.is_some_and(|v| v != PROTOCOL_VERSION) {
            return Err(AdapterError::Handshake(format!(
                "agent speaks protocol version {reported:?}, expected {PROTOCOL_VERSION}"
            )));
        }
        {
            let mut caps = self.caps.lock().expect("caps lock poisoned");
            caps.agent_info = init.get("agentInfo").cloned();
        }

        let cwd = opts.cwd.clone().unwrap_or_else(|| ".".into());
        let session_result = match &opts.resume {
            Some(backend_id) => {
                self.request(
                    "session/load",
                    json!({"sessionId": backend_id, "cwd": cwd, "mcpServers": []}),
                )
                .await?
            }
            None => {
                self.request("session/new", json!({"cwd": cwd, "mcpServers": []}))
                    .await?
            }
        };

        let backend_id = session_result
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| opts.resume.clone())
            .ok_or_else(|| AdapterError::Handshake("agent reported no session id".into()))?;

        let current_mode = session_result
            .pointer("/modes/currentModeId")
            .and_then(Value::as_str)
            .map(str::to_string);
        {
            let mut caps = self.caps.lock().expect("caps lock poisoned");
            caps.modes = session_result.get("modes").cloned();
        }
        *self
            .backend_session_id
            .lock()
            .expect("backend id lock poisoned") = Some(backend_id.clone());

        let agent_info = self
            .caps
            .lock()
            .expect("caps lock poisoned")
            .agent_info
            .clone();
        let init_msg = session_init_message(
            &backend_id,
            Some(&cwd),
            opts.model.as_deref(),
            agent_info.as_ref(),
            current_mode.as_deref(),
        );
        let _ = handshake_tx.send(Ok(init_msg)).await;
        Ok(())
    }

    /// Issue a request and await its reply through the reader task.
    async fn request(&self, method: &str, params: Value) -> Result<Value, AdapterError> {
        let id = self.ids.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(id, Pending::AwaitReply(tx));

        let line = RpcMessage::Request {
            id: json!(id),
            method: method.to_string(),
            params,
        }
        .encode()?;
        write_line(&self.writer, &line).await?;

        let reply = timeout(HANDSHAKE_TIMEOUT, rx).await;
        match reply {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(rpc_error))) => Err(AdapterError::Handshake(format!(
                "{method} failed: {} (code {})",
                rpc_error.message, rpc_error.code
            ))),
            Ok(Err(_)) => Err(AdapterError::Handshake(format!(
                "{method}: agent closed before replying"
            ))),
            Err(_) => {
                self.pending.lock().expect("pending lock poisoned").remove(&id);
                Err(AdapterError::Handshake(format!("{method}: timed out")))
            }
        }
    }

    fn backend_id_or_err(&self) -> Result<String, AdapterError> {
        self.backend_session_id
            .lock()
            .expect("backend id lock poisoned")
            .clone()
            .ok_or_else(|| AdapterError::Send("no backend session id".into()))
    }

    /// Synthesize the `control_response` for the capabilities handshake from
    /// cached handshake data.
    async fn answer_control_request(&self, msg: &UnifiedMessage) {
        let (commands, models, agent) = {
            let caps = self.caps.lock().expect("caps lock poisoned");
            let models = caps
                .modes
                .as_ref()
                .and_then(|m| m.get("availableModes").cloned())
                .unwrap_or(json!([]));
            (caps.commands.clone(), models, caps.agent_info.clone())
        };
        let mut builder = MessageBuilder::new(MessageType::ControlResponse, Role::System)
            .meta("subtype", json!("success"))
            .meta(
                "response",
                json!({
                    "commands": commands,
                    "models": models,
                    "account": agent,
                }),
            );
        if let Some(request_id) = msg.metadata.get("request_id") {
            builder = builder.meta("request_id", request_id.clone());
        }
        send_shared(&self.msg_tx, Ok(builder.build())).await;
    }
}

#[async_trait::async_trait]
impl BackendSession for RpcBackendSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn backend_session_id(&self) -> Option<String> {
        self.backend_session_id
            .lock()
            .expect("backend id lock poisoned")
            .clone()
    }

    fn take_messages(&mut self) -> Option<MessageStream> {
        self.rx.take()
    }

    async fn send(&self, msg: UnifiedMessage) -> Result<(), AdapterError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AdapterError::Closed);
        }

        // Control requests are answered from cached handshake data rather
        // than round-tripped: this protocol has no control channel.
        if msg.kind == MessageType::Unknown && msg.meta_str("control") == Some("initialize") {
            self.answer_control_request(&msg).await;
            return Ok(());
        }

        let backend_id = self.backend_id_or_err()?;
        match translate_outbound(&msg, &backend_id)? {
            OutboundAction::Request { method, params } => {
                let id = self.ids.next_id();
                self.pending
                    .lock()
                    .expect("pending lock poisoned")
                    .insert(id, Pending::EmitTurnResult);
                let line = RpcMessage::Request {
                    id: json!(id),
                    method,
                    params,
                }
                .encode()?;
                write_line(&self.writer, &line).await
            }
            OutboundAction::Notification { method, params } => {
                let line = RpcMessage::Notification { method, params }.encode()?;
                write_line(&self.writer, &line).await
            }
            OutboundAction::PermissionReply {
                request_id,
                payload,
            } => {
                let line = RpcMessage::Response {
                    id: request_id,
                    result: Some(payload),
                    error: None,
                }
                .encode()?;
                write_line(&self.writer, &line).await
            }
            OutboundAction::Response { id, result } => {
                let line = RpcMessage::Response {
                    id,
                    result: Some(result),
                    error: None,
                }
                .encode()?;
                write_line(&self.writer, &line).await
            }
            OutboundAction::Prompt { .. } | OutboundAction::Abort | OutboundAction::Noop => Ok(()),
        }
    }

    fn set_passthrough_handler(&mut self, handler: Option<PassthroughHandler>) -> bool {
        *self.passthrough.lock().expect("passthrough lock poisoned") = handler;
        true
    }

    async fn close(&mut self) -> Result<(), AdapterError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Kill escalation is the supervisor's job; an unknown session just
        // means the process already exited.
        let _ = self.supervisor.kill_process(&self.session_id).await;
        Ok(())
    }
}

async fn write_line(writer: &Writer, line: &str) -> Result<(), AdapterError> {
    let mut writer = writer.lock().await;
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| AdapterError::Send(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| AdapterError::Send(e.to_string()))
}

struct ReaderArgs {
    stdout: Box<dyn AsyncRead + Send + Unpin>,
    msg_tx: SharedTx,
    writer: Writer,
    pending: PendingMap,
    passthrough: Arc<Mutex<Option<PassthroughHandler>>>,
    caps: Arc<Mutex<CapsCache>>,
    classifier: Arc<dyn ErrorClassifier>,
    session_id: String,
}

async fn reader_loop(args: ReaderArgs) {
    let ReaderArgs {
        stdout,
        msg_tx,
        writer,
        pending,
        passthrough,
        caps,
        classifier,
        session_id,
    } = args;

    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                send_shared(&msg_tx, Err(AdapterError::Io(e))).await;
                msg_tx.lock().expect("stream slot lock poisoned").take();
                return;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let raw: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                warn!(target: "swb.acp", session_id, "unparseable line: {e}");
                continue;
            }
        };

        // CLI echo interception happens on the raw value, before any
        // translation; a claimed echo never reaches the canonical stream.
        if is_user_echo(&raw) {
            let handler = passthrough
                .lock()
                .expect("passthrough lock poisoned")
                .clone();
            if let Some(handler) = handler
                && handler(&raw)
            {
                continue;
            }
        }

        let msg = match RpcMessage::from_value(raw) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(target: "swb.acp", session_id, "unclassifiable frame: {e}");
                continue;
            }
        };

        match msg {
            RpcMessage::Notification { method, params } => {
                if method != "session/update" {
                    debug!(target: "swb.acp", session_id, method, "dropping notification");
                    continue;
                }
                let Some(update) = params.get("update") else {
                    continue;
                };
                if let Some(canonical) = translate_session_update(update) {
                    if let Some(list) = canonical
                        .metadata
                        .get("slash_commands")
                        .and_then(Value::as_array)
                    {
                        caps.lock().expect("caps lock poisoned").commands = list.clone();
                    }
                    if !send_shared(&msg_tx, Ok(canonical)).await {
                        return;
                    }
                }
            }

            RpcMessage::Request { id, method, params } => {
                if method == "session/request_permission" {
                    let canonical = translate_permission_request(&id, &params);
                    if !send_shared(&msg_tx, Ok(canonical)).await {
                        return;
                    }
                } else {
                    debug!(target: "swb.acp", session_id, method, "rejecting unknown request");
                    let reply = RpcMessage::Response {
                        id,
                        result: None,
                        error: Some(RpcError {
                            code: -32601,
                            message: format!("method not found: {method}"),
                            data: None,
                        }),
                    };
                    if let Ok(line) = reply.encode() {
                        let _ = write_line(&writer, &line).await;
                    }
                }
            }

            RpcMessage::Response { id, result, error } => {
                let Some(id) = id.as_i64() else {
                    debug!(target: "swb.acp", session_id, "response with non-numeric id");
                    continue;
                };
                let entry = pending.lock().expect("pending lock poisoned").remove(&id);
                match entry {
                    Some(Pending::AwaitReply(tx)) => {
                        let outcome = match error {
                            Some(error) => Err(error),
                            None => Ok(result.unwrap_or(Value::Null)),
                        };
                        let _ = tx.send(outcome);
                    }
                    Some(Pending::EmitTurnResult) => {
                        let canonical = match (&result, &error) {
                            (_, Some(error)) => {
                                translate_prompt_result(Err(error), classifier.as_ref())
                            }
                            (Some(result), None) => {
                                translate_prompt_result(Ok(result), classifier.as_ref())
                            }
                            (None, None) => {
                                translate_prompt_result(Ok(&Value::Null), classifier.as_ref())
                            }
                        };
                        if !send_shared(&msg_tx, Ok(canonical)).await {
                            return;
                        }
                    }
                    None => {
                        debug!(target: "swb.acp", session_id, id, "response for unknown request");
                    }
                }
            }
        }
    }
    // Clean EOF: emptying the slot drops the last sender and closes the
    // canonical stream.
    msg_tx.lock().expect("stream slot lock poisoned").take();
}
