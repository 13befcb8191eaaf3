// SPDX-License-Identifier: MIT OR Apache-2.0
//! Scriptable mock adapter.
//!
//! Used across the workspace's tests to drive the bridge and manager without
//! real backends: each `connect` hands back a session whose inbound stream
//! the test feeds through a [`MockSessionHandle`].

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use swb_core::{MessageBuilder, MessageType, Role, UnifiedMessage};

use crate::{
    AdapterCapabilities, AdapterError, BackendAdapter, BackendSession, ConnectOptions,
    MESSAGE_CHANNEL_CAPACITY, MessageStream, PassthroughHandler, SlashContext, SlashExecutor,
    SlashOutput,
};

// ---------------------------------------------------------------------------
// Session handle (test side)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SharedState {
    sent: Mutex<Vec<UnifiedMessage>>,
    raw_sent: Mutex<Vec<String>>,
    passthrough: Mutex<Option<PassthroughHandler>>,
    closed: AtomicBool,
    backend_session_id: Mutex<Option<String>>,
}

/// Test-side controller for one mock backend session.
#[derive(Clone)]
pub struct MockSessionHandle {
    session_id: String,
    tx: Arc<Mutex<Option<mpsc::Sender<Result<UnifiedMessage, AdapterError>>>>>,
    state: Arc<SharedState>,
}

impl MockSessionHandle {
    /// Broker-side session id this handle drives.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Emit a canonical message from the backend.
    pub async fn emit(&self, msg: UnifiedMessage) {
        let tx = self.tx.lock().expect("mock tx lock poisoned").clone();
        if let Some(tx) = tx {
            let _ = tx.send(Ok(msg)).await;
        }
    }

    /// Emit a stream error, ending the stream on the consumer side.
    pub async fn fail(&self, message: impl Into<String>) {
        let tx = self.tx.lock().expect("mock tx lock poisoned").take();
        if let Some(tx) = tx {
            let _ = tx.send(Err(AdapterError::Send(message.into()))).await;
        }
    }

    /// End the stream cleanly (backend disconnect).
    pub fn finish(&self) {
        self.tx.lock().expect("mock tx lock poisoned").take();
    }

    /// Present a raw native user-echo to the installed passthrough handler.
    ///
    /// Returns `true` when a handler claimed the echo. When unclaimed, the
    /// echo is translated into a canonical `user_message` and emitted, like
    /// a driver that does not understand slash round-trips would do.
    pub async fn present_user_echo(&self, raw: &Value) -> bool {
        let handler = self
            .state
            .passthrough
            .lock()
            .expect("mock passthrough lock poisoned")
            .clone();
        if let Some(handler) = handler
            && handler(raw)
        {
            return true;
        }
        let text = raw
            .pointer("/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.emit(
            MessageBuilder::new(MessageType::UserMessage, Role::User)
                .text(text)
                .build(),
        )
        .await;
        false
    }

    /// Everything the bridge sent to this backend, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<UnifiedMessage> {
        self.state.sent.lock().expect("mock sent lock poisoned").clone()
    }

    /// Raw NDJSON lines the bridge sent.
    #[must_use]
    pub fn raw_sent(&self) -> Vec<String> {
        self.state
            .raw_sent
            .lock()
            .expect("mock raw lock poisoned")
            .clone()
    }

    /// Whether the session has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Whether a passthrough handler is currently installed.
    #[must_use]
    pub fn passthrough_installed(&self) -> bool {
        self.state
            .passthrough
            .lock()
            .expect("mock passthrough lock poisoned")
            .is_some()
    }

    /// Set the backend-assigned session id reported to the bridge.
    pub fn set_backend_session_id(&self, id: impl Into<String>) {
        *self
            .state
            .backend_session_id
            .lock()
            .expect("mock id lock poisoned") = Some(id.into());
    }
}

// ---------------------------------------------------------------------------
// Session (bridge side)
// ---------------------------------------------------------------------------

struct MockBackendSession {
    session_id: String,
    rx: Option<MessageStream>,
    tx: Arc<Mutex<Option<mpsc::Sender<Result<UnifiedMessage, AdapterError>>>>>,
    state: Arc<SharedState>,
    echo_capable: bool,
    executor: Option<Arc<dyn SlashExecutor>>,
}

#[async_trait]
impl BackendSession for MockBackendSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn backend_session_id(&self) -> Option<String> {
        self.state
            .backend_session_id
            .lock()
            .expect("mock id lock poisoned")
            .clone()
    }

    fn take_messages(&mut self) -> Option<MessageStream> {
        self.rx.take()
    }

    async fn send(&self, msg: UnifiedMessage) -> Result<(), AdapterError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(AdapterError::Closed);
        }
        self.state
            .sent
            .lock()
            .expect("mock sent lock poisoned")
            .push(msg);
        Ok(())
    }

    fn send_raw(&self, line: &str) -> Result<(), AdapterError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(AdapterError::Closed);
        }
        self.state
            .raw_sent
            .lock()
            .expect("mock raw lock poisoned")
            .push(line.to_string());
        Ok(())
    }

    fn set_passthrough_handler(&mut self, handler: Option<PassthroughHandler>) -> bool {
        if !self.echo_capable {
            return false;
        }
        *self
            .state
            .passthrough
            .lock()
            .expect("mock passthrough lock poisoned") = handler;
        true
    }

    fn slash_executor(&self) -> Option<Arc<dyn SlashExecutor>> {
        self.executor.clone()
    }

    async fn close(&mut self) -> Result<(), AdapterError> {
        self.state.closed.store(true, Ordering::SeqCst);
        self.tx.lock().expect("mock tx lock poisoned").take();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Slash executor
// ---------------------------------------------------------------------------

/// Mock slash executor answering every supported command with a canned body.
pub struct MockSlashExecutor {
    commands: Vec<String>,
}

#[async_trait]
impl SlashExecutor for MockSlashExecutor {
    fn supported_commands(&self) -> Vec<String> {
        self.commands.clone()
    }

    async fn execute(
        &self,
        _ctx: &SlashContext,
        command: &str,
    ) -> Result<SlashOutput, AdapterError> {
        Ok(SlashOutput {
            content: format!("executed {command}"),
        })
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Scriptable mock [`BackendAdapter`].
pub struct MockAdapter {
    name: String,
    capabilities: AdapterCapabilities,
    echo_capable: bool,
    executor_commands: Option<Vec<String>>,
    fail_connect: AtomicBool,
    connections: Mutex<Vec<MockSessionHandle>>,
}

impl MockAdapter {
    /// Create a mock adapter with the given name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capabilities: AdapterCapabilities {
                permissions: true,
                ..AdapterCapabilities::default()
            },
            echo_capable: false,
            executor_commands: None,
            fail_connect: AtomicBool::new(false),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Make sessions accept a passthrough handler (CLI echo capture).
    #[must_use]
    pub fn echo_capable(mut self) -> Self {
        self.echo_capable = true;
        self.capabilities.slash_commands = true;
        self
    }

    /// Attach a slash executor serving the given commands to every session.
    #[must_use]
    pub fn with_slash_executor(mut self, commands: &[&str]) -> Self {
        self.executor_commands = Some(commands.iter().map(|s| s.to_string()).collect());
        self.capabilities.slash_commands = true;
        self
    }

    /// Make the next `connect` call fail.
    pub fn fail_next_connect(&self) {
        self.fail_connect.store(true, Ordering::SeqCst);
    }

    /// Handles for every session this adapter has produced, in connect order.
    #[must_use]
    pub fn connections(&self) -> Vec<MockSessionHandle> {
        self.connections
            .lock()
            .expect("mock connections lock poisoned")
            .clone()
    }

    /// The handle for the most recent connection.
    #[must_use]
    pub fn last_connection(&self) -> Option<MockSessionHandle> {
        self.connections
            .lock()
            .expect("mock connections lock poisoned")
            .last()
            .cloned()
    }
}

#[async_trait]
impl BackendAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> AdapterCapabilities {
        self.capabilities
    }

    async fn connect(&self, opts: ConnectOptions) -> Result<Box<dyn BackendSession>, AdapterError> {
        if self.fail_connect.swap(false, Ordering::SeqCst) {
            return Err(AdapterError::Connect("mock connect failure".into()));
        }

        let (tx, rx) = mpsc::channel(MESSAGE_CHANNEL_CAPACITY);
        let tx = Arc::new(Mutex::new(Some(tx)));
        let state = Arc::new(SharedState::default());

        let handle = MockSessionHandle {
            session_id: opts.session_id.clone(),
            tx: Arc::clone(&tx),
            state: Arc::clone(&state),
        };
        self.connections
            .lock()
            .expect("mock connections lock poisoned")
            .push(handle);

        let executor = self.executor_commands.as_ref().map(|commands| {
            Arc::new(MockSlashExecutor {
                commands: commands.clone(),
            }) as Arc<dyn SlashExecutor>
        });

        Ok(Box::new(MockBackendSession {
            session_id: opts.session_id,
            rx: Some(rx),
            tx,
            state,
            echo_capable: self.echo_capable,
            executor,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitted_messages_reach_the_stream() {
        let adapter = MockAdapter::named("mock");
        let mut session = adapter
            .connect(ConnectOptions::new("s-1"))
            .await
            .expect("connect");
        let mut rx = session.take_messages().expect("stream");
        let handle = adapter.last_connection().expect("handle");

        handle.emit(UnifiedMessage::assistant_text("hi")).await;
        let msg = rx.recv().await.unwrap().unwrap();
        assert_eq!(msg.text_content(), "hi");

        handle.finish();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn take_messages_is_single_consumer() {
        let adapter = MockAdapter::named("mock");
        let mut session = adapter
            .connect(ConnectOptions::new("s-1"))
            .await
            .expect("connect");
        assert!(session.take_messages().is_some());
        assert!(session.take_messages().is_none());
    }

    #[tokio::test]
    async fn send_after_close_errors() {
        let adapter = MockAdapter::named("mock");
        let mut session = adapter
            .connect(ConnectOptions::new("s-1"))
            .await
            .expect("connect");
        session.close().await.expect("close");
        let err = session
            .send(UnifiedMessage::user_text("late"))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Closed));
    }

    #[tokio::test]
    async fn echo_claims_only_when_capable_and_installed() {
        let adapter = MockAdapter::named("mock").echo_capable();
        let mut session = adapter
            .connect(ConnectOptions::new("s-1"))
            .await
            .expect("connect");
        let handle = adapter.last_connection().expect("handle");

        let raw = serde_json::json!({"type": "user", "message": {"content": "/help"}});
        // No handler installed yet: unclaimed.
        let mut rx = session.take_messages().expect("stream");
        assert!(!handle.present_user_echo(&raw).await);
        // The unclaimed echo surfaced as a canonical user message.
        let echoed = rx.recv().await.unwrap().unwrap();
        assert_eq!(echoed.text_content(), "/help");

        let installed = session.set_passthrough_handler(Some(Arc::new(|_| true)));
        assert!(installed);
        assert!(handle.present_user_echo(&raw).await);
    }

    #[tokio::test]
    async fn fail_next_connect_fails_once() {
        let adapter = MockAdapter::named("mock");
        adapter.fail_next_connect();
        assert!(adapter.connect(ConnectOptions::new("s-1")).await.is_err());
        assert!(adapter.connect(ConnectOptions::new("s-2")).await.is_ok());
    }
}
