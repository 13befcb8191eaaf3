// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! swb-adapter
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Scriptable mock adapter for tests across the workspace.
pub mod mock;
/// Typed registry of named adapters.
pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use swb_core::UnifiedMessage;

pub use registry::AdapterRegistry;

/// Default bound for the per-session canonical message channel.
pub const MESSAGE_CHANNEL_CAPACITY: usize = 256;

/// The single-consumer canonical message stream of a [`BackendSession`].
///
/// `Ok` items are translated envelopes in backend order. An `Err` item is a
/// stream error: the consumer runs its error path and stops. Channel close
/// without an error is a clean disconnect.
pub type MessageStream = mpsc::Receiver<Result<UnifiedMessage, AdapterError>>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by adapters and backend sessions.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// Connecting to the backend failed (spawn, transport, or handshake).
    #[error("backend connect failed: {0}")]
    Connect(String),

    /// The protocol handshake failed after the transport came up.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The backend session is closed.
    #[error("backend session is closed")]
    Closed,

    /// A send to the backend failed.
    #[error("send failed: {0}")]
    Send(String),

    /// This adapter does not support raw NDJSON sends.
    #[error("raw send not supported by this adapter")]
    RawNotSupported,

    /// Outbound translation had no native representation for the message.
    #[error("cannot translate `{0}` for this backend")]
    Untranslatable(String),

    /// Underlying IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

/// Where the backend runs relative to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    /// Same host (subprocess or in-process).
    Local,
    /// Reached over the network.
    Remote,
}

/// Static capability flags advertised by an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterCapabilities {
    /// Emits incremental `stream_event` messages.
    pub streaming: bool,
    /// Surfaces in-flight permission requests.
    pub permissions: bool,
    /// Round-trips slash commands through its own prompt.
    pub slash_commands: bool,
    /// Where the backend runs.
    pub availability: Availability,
    /// Supports inter-agent team traffic.
    pub teams: bool,
}

impl Default for AdapterCapabilities {
    fn default() -> Self {
        Self {
            streaming: true,
            permissions: false,
            slash_commands: false,
            availability: Availability::Local,
            teams: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Connect options
// ---------------------------------------------------------------------------

/// Options passed to [`BackendAdapter::connect`].
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Broker-side session identifier.
    pub session_id: String,
    /// Working directory for the backend.
    pub cwd: Option<String>,
    /// Backend session id to resume, when reattaching.
    pub resume: Option<String>,
    /// Preferred model identifier.
    pub model: Option<String>,
    /// Adapter-specific extras (passed through untouched).
    pub extra: BTreeMap<String, Value>,
}

impl ConnectOptions {
    /// Options for a fresh session with the given id.
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound actions
// ---------------------------------------------------------------------------

/// What an outbound translator turned a canonical message into.
///
/// Payloads are native (`Value`) because the wire shape belongs to the
/// adapter; the tag is what the driver dispatches on.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundAction {
    /// Send a protocol request expecting a response.
    Request {
        /// Native method name.
        method: String,
        /// Native parameters.
        params: Value,
    },
    /// Reply to a protocol request the backend made earlier.
    Response {
        /// The request id being answered.
        id: Value,
        /// Native result payload.
        result: Value,
    },
    /// Fire-and-forget notification.
    Notification {
        /// Native method name.
        method: String,
        /// Native parameters.
        params: Value,
    },
    /// Submit a user prompt turn.
    Prompt {
        /// Native prompt payload.
        payload: Value,
    },
    /// Answer an in-flight permission request.
    PermissionReply {
        /// Correlation id of the permission request.
        request_id: Value,
        /// Native reply payload.
        payload: Value,
    },
    /// Cancel the in-flight turn.
    Abort,
    /// Nothing to send (message is consumer-plane only).
    Noop,
}

// ---------------------------------------------------------------------------
// Passthrough handler
// ---------------------------------------------------------------------------

/// Capture function for CLI-echoed slash commands.
///
/// A driver that round-trips slash commands through the backend prompt calls
/// the installed handler with each raw native user-echo message *before*
/// translation. Returning `true` claims the echo: the driver must then
/// suppress it from the canonical stream.
pub type PassthroughHandler = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

// ---------------------------------------------------------------------------
// Slash executor capability
// ---------------------------------------------------------------------------

/// Execution context handed to a [`SlashExecutor`].
#[derive(Debug, Clone, Default)]
pub struct SlashContext {
    /// Broker-side session identifier.
    pub session_id: String,
    /// Session working directory, if known.
    pub cwd: Option<String>,
}

/// Output of an explicitly executed backend slash command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlashOutput {
    /// Rendered command output.
    pub content: String,
}

/// Adapter-provided service for executing backend-native slash commands
/// without the user-message forwarding path.
#[async_trait]
pub trait SlashExecutor: Send + Sync {
    /// Names of the commands this executor services (no leading slash).
    fn supported_commands(&self) -> Vec<String>;

    /// Execute `command` (with leading slash) in `ctx`.
    async fn execute(&self, ctx: &SlashContext, command: &str)
    -> Result<SlashOutput, AdapterError>;
}

// ---------------------------------------------------------------------------
// The session contract
// ---------------------------------------------------------------------------

/// A bound backend conduit for one session.
///
/// The canonical message stream is produced by a driver task pushing into a
/// bounded channel; taking the receiver is a single-consumer operation. The
/// stream is finite: it ends when the backend disconnects or the session is
/// closed.
#[async_trait]
pub trait BackendSession: Send {
    /// Broker-side session identifier.
    fn session_id(&self) -> &str;

    /// Backend-assigned session identifier, once the handshake reported one.
    fn backend_session_id(&self) -> Option<String>;

    /// Take the canonical message stream.
    ///
    /// Returns `None` on every call after the first.
    fn take_messages(&mut self) -> Option<MessageStream>;

    /// Send a canonical message to the backend.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Closed`] after close, or a transport error.
    async fn send(&self, msg: UnifiedMessage) -> Result<(), AdapterError>;

    /// Send a raw NDJSON line, bypassing translation.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::RawNotSupported`] unless the driver proxies
    /// raw traffic.
    fn send_raw(&self, line: &str) -> Result<(), AdapterError> {
        let _ = line;
        Err(AdapterError::RawNotSupported)
    }

    /// Install (or clear) the CLI-echo capture function.
    ///
    /// Returns `false` when the driver has no echo to capture; the connector
    /// then relies on envelope-based passthrough matching alone.
    fn set_passthrough_handler(&mut self, handler: Option<PassthroughHandler>) -> bool {
        let _ = handler;
        false
    }

    /// The slash executor bound to this session, if the adapter has one.
    fn slash_executor(&self) -> Option<Arc<dyn SlashExecutor>> {
        None
    }

    /// Close the session, releasing transport resources.
    ///
    /// Idempotent. Completes when resources are released.
    async fn close(&mut self) -> Result<(), AdapterError>;
}

// ---------------------------------------------------------------------------
// The adapter contract
// ---------------------------------------------------------------------------

/// A protocol driver exposing the uniform session contract.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Symbolic adapter name (`"acp"`, `"opencode"`, ...).
    fn name(&self) -> &str;

    /// Static capability flags.
    fn capabilities(&self) -> AdapterCapabilities;

    /// Establish a backend session.
    ///
    /// # Errors
    ///
    /// Propagates transport, spawn, and handshake failures; the caller owns
    /// cleanup of any session bookkeeping it did beforehand.
    async fn connect(&self, opts: ConnectOptions) -> Result<Box<dyn BackendSession>, AdapterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn availability_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Availability::Local).unwrap(),
            "\"local\""
        );
        assert_eq!(
            serde_json::to_string(&Availability::Remote).unwrap(),
            "\"remote\""
        );
    }

    #[test]
    fn default_capabilities_are_conservative() {
        let caps = AdapterCapabilities::default();
        assert!(caps.streaming);
        assert!(!caps.permissions);
        assert!(!caps.slash_commands);
        assert!(!caps.teams);
    }

    #[test]
    fn outbound_action_variants_compare() {
        let a = OutboundAction::Abort;
        assert_eq!(a, OutboundAction::Abort);
        assert_ne!(a, OutboundAction::Noop);
    }
}
