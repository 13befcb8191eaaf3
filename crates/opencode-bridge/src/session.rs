// SPDX-License-Identifier: MIT OR Apache-2.0
//! The bound opencode session: SSE consumption task and HTTP outbound calls.

use futures::StreamExt;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use swb_adapter::{
    AdapterError, BackendSession, MESSAGE_CHANNEL_CAPACITY, MessageStream, OutboundAction,
};
use swb_core::{MessageBuilder, MessageType, Role, UnifiedMessage};

use crate::inbound::OpencodeTranslator;
use crate::outbound::translate_outbound;
use crate::sse::SseParser;

type MessageTx = mpsc::Sender<Result<UnifiedMessage, AdapterError>>;
type SharedTx = Arc<Mutex<Option<MessageTx>>>;

async fn send_shared(slot: &SharedTx, item: Result<UnifiedMessage, AdapterError>) -> bool {
    let tx = slot.lock().expect("stream slot lock poisoned").clone();
    match tx {
        Some(tx) => tx.send(item).await.is_ok(),
        None => false,
    }
}

/// A bound HTTP+SSE backend session.
pub struct OpencodeBackendSession {
    session_id: String,
    backend_session_id: String,
    base_url: String,
    http: reqwest::Client,
    rx: Option<MessageStream>,
    msg_tx: SharedTx,
    closed: Arc<AtomicBool>,
}

impl OpencodeBackendSession {
    /// Start the SSE consumption task and emit `session_init`.
    pub(crate) async fn start(
        http: reqwest::Client,
        base_url: String,
        session_id: String,
        backend_session_id: String,
        cwd: Option<String>,
        model: Option<String>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        let init_tx = tx.clone();
        let msg_tx: SharedTx = Arc::new(Mutex::new(Some(tx)));

        // session_init first, then the event stream: consumers always see
        // the handshake before any translated traffic.
        let mut builder = MessageBuilder::new(MessageType::SessionInit, Role::System)
            .meta("session_id", json!(backend_session_id));
        if let Some(cwd) = &cwd {
            builder = builder.meta("cwd", json!(cwd));
        }
        if let Some(model) = &model {
            builder = builder.meta("model", json!(model));
        }
        let _ = init_tx.send(Ok(builder.build())).await;

        tokio::spawn(sse_loop(
            http.clone(),
            base_url.clone(),
            backend_session_id.clone(),
            Arc::clone(&msg_tx),
        ));

        Self {
            session_id,
            backend_session_id,
            base_url,
            http,
            rx: Some(rx),
            msg_tx,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn post(&self, path: &str, body: Value) -> Result<(), AdapterError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AdapterError::Send(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AdapterError::Send(format!(
                "POST {path} returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn answer_control_request(&self, msg: &UnifiedMessage) {
        let mut builder = MessageBuilder::new(MessageType::ControlResponse, Role::System)
            .meta("subtype", json!("success"))
            .meta(
                "response",
                json!({"commands": [], "models": [], "account": null}),
            );
        if let Some(request_id) = msg.metadata.get("request_id") {
            builder = builder.meta("request_id", request_id.clone());
        }
        send_shared(&self.msg_tx, Ok(builder.build())).await;
    }
}

#[async_trait::async_trait]
impl BackendSession for OpencodeBackendSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn backend_session_id(&self) -> Option<String> {
        Some(self.backend_session_id.clone())
    }

    fn take_messages(&mut self) -> Option<MessageStream> {
        self.rx.take()
    }

    async fn send(&self, msg: UnifiedMessage) -> Result<(), AdapterError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AdapterError::Closed);
        }
        if msg.kind == MessageType::Unknown && msg.meta_str("control") == Some("initialize") {
            self.answer_control_request(&msg).await;
            return Ok(());
        }

        match translate_outbound(&msg, &self.backend_session_id)? {
            OutboundAction::Prompt { payload } => {
                self.post(
                    &format!("/session/{}/prompt_async", self.backend_session_id),
                    payload,
                )
                .await
            }
            OutboundAction::Abort => {
                self.post(
                    &format!("/session/{}/abort", self.backend_session_id),
                    json!({}),
                )
                .await
            }
            OutboundAction::PermissionReply {
                request_id,
                payload,
            } => {
                let id = request_id.as_str().map(str::to_string).unwrap_or_else(|| {
                    request_id.to_string()
                });
                self.post(
                    &format!("/session/{}/permission/{id}", self.backend_session_id),
                    payload,
                )
                .await
            }
            OutboundAction::Noop => Ok(()),
            other => {
                debug!(target: "swb.opencode", "unroutable action {other:?}");
                Ok(())
            }
        }
    }

    async fn close(&mut self) -> Result<(), AdapterError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Closing the stream slot ends the consumer loop; the SSE task dies
        // with its next failed send.
        self.msg_tx.lock().expect("stream slot lock poisoned").take();
        Ok(())
    }
}

async fn sse_loop(http: reqwest::Client, base_url: String, backend_id: String, slot: SharedTx) {
    let url = format!("{base_url}/event");
    let response = match http
        .get(&url)
        .header("accept", "text/event-stream")
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => response,
        Ok(response) => {
            send_shared(
                &slot,
                Err(AdapterError::Connect(format!(
                    "event stream returned {}",
                    response.status()
                ))),
            )
            .await;
            slot.lock().expect("stream slot lock poisoned").take();
            return;
        }
        Err(e) => {
            send_shared(&slot, Err(AdapterError::Connect(e.to_string()))).await;
            slot.lock().expect("stream slot lock poisoned").take();
            return;
        }
    };

    let mut translator = OpencodeTranslator::new(&backend_id);
    let mut parser = SseParser::new();
    let mut pending = String::new();
    let mut stream = response.bytes_stream();

    'outer: while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                send_shared(&slot, Err(AdapterError::Send(e.to_string()))).await;
                break;
            }
        };
        pending.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(newline) = pending.find('\n') {
            let line: String = pending.drain(..=newline).collect();
            let Some(data) = parser.push_line(line.trim_end_matches('\n')) else {
                continue;
            };
            let event: Value = match serde_json::from_str(&data) {
                Ok(v) => v,
                Err(e) => {
                    warn!(target: "swb.opencode", "bad SSE payload: {e}");
                    continue;
                }
            };
            if let Some(canonical) = translator.translate(&event)
                && !send_shared(&slot, Ok(canonical)).await
            {
                break 'outer;
            }
        }
    }
    slot.lock().expect("stream slot lock poisoned").take();
}
