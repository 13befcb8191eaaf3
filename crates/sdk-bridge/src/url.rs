// SPDX-License-Identifier: MIT OR Apache-2.0
//! The `sdk-url` driver: no spawn, just a local endpoint an external process
//! connects to, with raw NDJSON proxied in both directions.

use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use swb_adapter::{
    AdapterCapabilities, AdapterError, Availability, BackendAdapter, BackendSession,
    ConnectOptions, MESSAGE_CHANNEL_CAPACITY, MessageStream, PassthroughHandler,
};
use swb_core::{MessageType, UnifiedMessage};

use crate::translate::{native_control_request, native_user_message, translate_sdk_event};

type MessageTx = mpsc::Sender<Result<UnifiedMessage, AdapterError>>;
type SharedTx = Arc<Mutex<Option<MessageTx>>>;

async fn send_shared(slot: &SharedTx, item: Result<UnifiedMessage, AdapterError>) -> bool {
    let tx = slot.lock().expect("stream slot lock poisoned").clone();
    match tx {
        Some(tx) => tx.send(item).await.is_ok(),
        None => false,
    }
}

/// Driver that waits for an external NDJSON peer instead of spawning one.
pub struct UrlForwardAdapter {
    listener: TcpListener,
    accept_timeout: Duration,
}

impl UrlForwardAdapter {
    /// Bind the local endpoint (e.g. `"127.0.0.1:0"`).
    ///
    /// # Errors
    ///
    /// Propagates the bind failure.
    pub async fn bind(addr: &str) -> Result<Self, AdapterError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            accept_timeout: Duration::from_secs(30),
        })
    }

    /// Override how long `connect` waits for the external process.
    #[must_use]
    pub fn accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    /// The bound local address (port is allocated at bind time).
    ///
    /// # Errors
    ///
    /// Propagates the lookup failure.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, AdapterError> {
        Ok(self.listener.local_addr()?)
    }
}

#[async_trait::async_trait]
impl BackendAdapter for UrlForwardAdapter {
    fn name(&self) -> &str {
        "sdk-url"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            permissions: true,
            slash_commands: true,
            availability: Availability::Remote,
            teams: false,
        }
    }

    async fn connect(&self, opts: ConnectOptions) -> Result<Box<dyn BackendSession>, AdapterError> {
        let accepted = timeout(self.accept_timeout, self.listener.accept())
            .await
            .map_err(|_| AdapterError::Connect("no process connected to the endpoint".into()))?
            .map_err(|e| AdapterError::Connect(e.to_string()))?;
        let (stream, peer) = accepted;
        debug!(target: "swb.sdk_url", session_id = %opts.session_id, %peer, "peer connected");

        let (read_half, write_half) = stream.into_split();
        let (msg_tx, msg_rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        let msg_tx: SharedTx = Arc::new(Mutex::new(Some(msg_tx)));
        let passthrough: Arc<Mutex<Option<PassthroughHandler>>> = Arc::new(Mutex::new(None));
        let backend_session_id = Arc::new(Mutex::new(opts.resume.clone()));

        tokio::spawn(read_loop(
            read_half,
            Arc::clone(&msg_tx),
            Arc::clone(&passthrough),
            Arc::clone(&backend_session_id),
        ));

        Ok(Box::new(UrlForwardSession {
            session_id: opts.session_id,
            backend_session_id,
            rx: Some(msg_rx),
            writer: Arc::new(tokio::sync::Mutex::new(write_half)),
            ids: AtomicU64::new(0),
            msg_tx,
            passthrough,
            closed: AtomicBool::new(false),
        }))
    }
}

async fn read_loop(
    read_half: OwnedReadHalf,
    slot: SharedTx,
    passthrough: Arc<Mutex<Option<PassthroughHandler>>>,
    backend_session_id: Arc<Mutex<Option<String>>>,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                send_shared(&slot, Err(AdapterError::Io(e))).await;
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let raw: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                warn!(target: "swb.sdk_url", "unparseable line: {e}");
                continue;
            }
        };

        if raw.get("type").and_then(Value::as_str) == Some("user") {
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

        if let Some(canonical) = translate_sdk_event(&raw) {
            if canonical.kind == MessageType::SessionInit
                && let Some(id) = canonical.meta_str("session_id")
            {
                *backend_session_id
                    .lock()
                    .expect("backend id lock poisoned") = Some(id.to_string());
            }
            if !send_shared(&slot, Ok(canonical)).await {
                break;
            }
        }
    }
    slot.lock().expect("stream slot lock poisoned").take();
}

struct UrlForwardSession {
    session_id: String,
    backend_session_id: Arc<Mutex<Option<String>>>,
    rx: Option<MessageStream>,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    ids: AtomicU64,
    msg_tx: SharedTx,
    passthrough: Arc<Mutex<Option<PassthroughHandler>>>,
    closed: AtomicBool,
}

impl UrlForwardSession {
    async fn write_value(&self, value: &Value) -> Result<(), AdapterError> {
        let mut line = serde_json::to_string(value)?;
        line.push('\n');
        self.write_line(&line).await
    }

    async fn write_line(&self, line: &str) -> Result<(), AdapterError> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AdapterError::Send(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| AdapterError::Send(e.to_string()))
    }
}

#[async_trait::async_trait]
impl BackendSession for UrlForwardSession {
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
        match msg.kind {
            MessageType::UserMessage => self.write_value(&native_user_message(&msg)).await,
            MessageType::Interrupt => {
                let id = self.ids.fetch_add(1, Ordering::Relaxed);
                self.write_value(&json!({
                    "type": "control_request",
                    "request_id": format!("int-{id}"),
                    "request": {"subtype": "interrupt"},
                }))
                .await
            }
            MessageType::PermissionResponse => {
                let request_id = msg
                    .metadata
                    .get("request_id")
                    .cloned()
                    .ok_or_else(|| {
                        AdapterError::Send("permission_response without request_id".into())
                    })?;
                let response = match msg.meta_str("behavior") {
                    Some("allow") | Some("always") => json!({
                        "behavior": "allow",
                        "updatedInput": msg.metadata.get("updated_input").cloned(),
                    }),
                    _ => json!({
                        "behavior": "deny",
                        "message": msg.meta_str("message"),
                    }),
                };
                self.write_value(&json!({
                    "type": "control_response",
                    "response": {
                        "subtype": "success",
                        "request_id": request_id,
                        "response": response,
                    },
                }))
                .await
            }
            MessageType::Unknown if msg.meta_str("control") == Some("initialize") => {
                let request_id = msg
                    .metadata
                    .get("request_id")
                    .cloned()
                    .unwrap_or(Value::Null);
                self.write_value(&native_control_request(&request_id)).await
            }
            other => Err(AdapterError::Untranslatable(format!("{other:?}"))),
        }
    }

    fn send_raw(&self, line: &str) -> Result<(), AdapterError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AdapterError::Closed);
        }
        let mut owned = line.trim_end().to_string();
        owned.push('\n');
        let writer = Arc::clone(&self.writer);
        tokio::spawn(async move {
            let mut writer = writer.lock().await;
            if writer.write_all(owned.as_bytes()).await.is_ok() {
                let _ = writer.flush().await;
            }
        });
        Ok(())
    }

    fn set_passthrough_handler(&mut self, handler: Option<PassthroughHandler>) -> bool {
        *self.passthrough.lock().expect("passthrough lock poisoned") = handler;
        true
    }

    async fn close(&mut self) -> Result<(), AdapterError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.msg_tx.lock().expect("stream slot lock poisoned").take();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        Ok(())
    }
}
