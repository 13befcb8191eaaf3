// SPDX-License-Identifier: MIT OR Apache-2.0
//! The in-process Agent SDK driver.

use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use swb_adapter::{
    AdapterCapabilities, AdapterError, Availability, BackendAdapter, BackendSession,
    ConnectOptions, MESSAGE_CHANNEL_CAPACITY, MessageStream, PassthroughHandler,
};
use swb_core::{MessageBuilder, MessageType, Role, UnifiedMessage};

use crate::query::{PermissionDecision, QueryFn, QueryHandle, QueryOptions, ToolUseContext};
use crate::translate::{native_control_request, native_user_message, translate_sdk_event};

type MessageTx = mpsc::Sender<Result<UnifiedMessage, AdapterError>>;
type SharedTx = Arc<Mutex<Option<MessageTx>>>;
type PendingPermissions = Arc<Mutex<HashMap<String, oneshot::Sender<PermissionDecision>>>>;

async fn send_shared(slot: &SharedTx, item: Result<UnifiedMessage, AdapterError>) -> bool {
    let tx = slot.lock().expect("stream slot lock poisoned").clone();
    match tx {
        Some(tx) => tx.send(item).await.is_ok(),
        None => false,
    }
}

/// Adapter running Agent SDK queries inside the broker process.
pub struct AgentSdkAdapter {
    query: QueryFn,
}

impl AgentSdkAdapter {
    /// Create an adapter around the embedding application's query function.
    #[must_use]
    pub fn new(query: QueryFn) -> Self {
        Self { query }
    }
}

#[async_trait::async_trait]
impl BackendAdapter for AgentSdkAdapter {
    fn name(&self) -> &str {
        "agent-sdk"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            streaming: true,
            permissions: true,
            slash_commands: true,
            availability: Availability::Local,
            teams: true,
        }
    }

    async fn connect(&self, opts: ConnectOptions) -> Result<Box<dyn BackendSession>, AdapterError> {
        let (prompt_tx, prompt_rx) = mpsc::channel::<Value>(64);
        let (msg_tx, msg_rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        let msg_tx: SharedTx = Arc::new(Mutex::new(Some(msg_tx)));
        let pending: PendingPermissions = Arc::new(Mutex::new(HashMap::new()));
        let passthrough: Arc<Mutex<Option<PassthroughHandler>>> = Arc::new(Mutex::new(None));

        let can_use_tool = {
            let slot = Arc::clone(&msg_tx);
            let pending = Arc::clone(&pending);
            Arc::new(
                move |tool_name: String, input: Value, ctx: ToolUseContext| {
                    let slot = Arc::clone(&slot);
                    let pending = Arc::clone(&pending);
                    Box::pin(async move {
                        let (tx, rx) = oneshot::channel();
                        pending
                            .lock()
                            .expect("pending permissions lock poisoned")
                            .insert(ctx.tool_use_id.clone(), tx);

                        let request = MessageBuilder::new(
                            MessageType::PermissionRequest,
                            Role::System,
                        )
                        .meta("request_id", json!(ctx.tool_use_id))
                        .meta("tool_name", json!(tool_name))
                        .meta("input", input)
                        .build();
                        send_shared(&slot, Ok(request)).await;

                        // Sender dropped (disconnect, cancellation): deny.
                        rx.await.unwrap_or(PermissionDecision::Deny {
                            message: Some("permission request cancelled".into()),
                        })
                    }) as futures::future::BoxFuture<'static, PermissionDecision>
                },
            )
        };

        let handle = (self.query)(
            prompt_rx,
            QueryOptions {
                cwd: opts.cwd.clone(),
                model: opts.model.clone(),
                resume: opts.resume.clone(),
                can_use_tool: Some(can_use_tool),
            },
        )
        .await?;

        let QueryHandle {
            events,
            interrupt,
            close,
        } = handle;

        let backend_session_id = Arc::new(Mutex::new(opts.resume.clone()));
        tokio::spawn(pump_events(
            events,
            Arc::clone(&msg_tx),
            Arc::clone(&passthrough),
            Arc::clone(&backend_session_id),
            Arc::clone(&pending),
        ));

        Ok(Box::new(AgentSdkSession {
            session_id: opts.session_id,
            backend_session_id,
            rx: Some(msg_rx),
            prompt_tx,
            interrupt,
            close,
            pending,
            msg_tx,
            passthrough,
            closed: AtomicBool::new(false),
        }))
    }
}

async fn pump_events(
    mut events: mpsc::Receiver<Value>,
    slot: SharedTx,
    passthrough: Arc<Mutex<Option<PassthroughHandler>>>,
    backend_session_id: Arc<Mutex<Option<String>>>,
    pending: PendingPermissions,
) {
    while let Some(event) = events.recv().await {
        // CLI-echo interception on the raw native event.
        if event.get("type").and_then(Value::as_str) == Some("user") {
            let handler = passthrough
                .lock()
                .expect("passthrough lock poisoned")
                .clone();
            if let Some(handler) = handler
                && handler(&event)
            {
                continue;
            }
        }

        if let Some(canonical) = translate_sdk_event(&event) {
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
    // Generator finished: close the stream and fail outstanding permission
    // gates so no tool hangs forever.
    slot.lock().expect("stream slot lock poisoned").take();
    pending
        .lock()
        .expect("pending permissions lock poisoned")
        .clear();
}

struct AgentSdkSession {
    session_id: String,
    backend_session_id: Arc<Mutex<Option<String>>>,
    rx: Option<MessageStream>,
    prompt_tx: mpsc::Sender<Value>,
    interrupt: Arc<dyn Fn() + Send + Sync>,
    close: Arc<dyn Fn() + Send + Sync>,
    pending: PendingPermissions,
    msg_tx: SharedTx,
    passthrough: Arc<Mutex<Option<PassthroughHandler>>>,
    closed: AtomicBool,
}

impl AgentSdkSession {
    fn resolve_permission(&self, msg: &UnifiedMessage) {
        let Some(request_id) = msg.meta_str("request_id") else {
            debug!(target: "swb.sdk", "permission_response without request_id");
            return;
        };
        let entry = self
            .pending
            .lock()
            .expect("pending permissions lock poisoned")
            .remove(request_id);
        let Some(tx) = entry else {
            debug!(target: "swb.sdk", request_id, "no pending permission");
            return;
        };
        let decision = match msg.meta_str("behavior") {
            Some("allow") | Some("always") => PermissionDecision::Allow {
                updated_input: msg.metadata.get("updated_input").cloned(),
            },
            _ => PermissionDecision::Deny {
                message: msg.meta_str("message").map(str::to_string),
            },
        };
        let _ = tx.send(decision);
    }
}

#[async_trait::async_trait]
impl BackendSession for AgentSdkSession {
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
            MessageType::UserMessage => self
                .prompt_tx
                .send(native_user_message(&msg))
                .await
                .map_err(|_| AdapterError::Closed),
            MessageType::Interrupt => {
                (self.interrupt)();
                Ok(())
            }
            MessageType::PermissionResponse => {
                self.resolve_permission(&msg);
                Ok(())
            }
            MessageType::Unknown if msg.meta_str("control") == Some("initialize") => {
                let request_id = msg
                    .metadata
                    .get("request_id")
                    .cloned()
                    .unwrap_or(Value::Null);
                self.prompt_tx
                    .send(native_control_request(&request_id))
                    .await
                    .map_err(|_| AdapterError::Closed)
            }
            other => Err(AdapterError::Untranslatable(format!("{other:?}"))),
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
        (self.close)();
        self.msg_tx.lock().expect("stream slot lock poisoned").take();
        self.pending
            .lock()
            .expect("pending permissions lock poisoned")
            .clear();
        Ok(())
    }
}
