// SPDX-License-Identifier: MIT OR Apache-2.0
//! The in-process query contract: what the embedding application supplies
//! to run an Agent SDK session inside the broker process.

use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use swb_adapter::AdapterError;

/// Outcome of a `can_use_tool` permission check.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionDecision {
    /// Run the tool, optionally with rewritten input.
    Allow {
        /// Replacement input, if the consumer edited it.
        updated_input: Option<Value>,
    },
    /// Refuse the tool.
    Deny {
        /// Reason shown to the model.
        message: Option<String>,
    },
}

/// Context for one `can_use_tool` invocation.
#[derive(Debug, Clone)]
pub struct ToolUseContext {
    /// Identifier of the tool-use block awaiting permission.
    pub tool_use_id: String,
}

/// Callback the SDK invokes before running a tool. Resolves only when the
/// broker's consumer answers the surfaced permission request.
pub type CanUseTool = Arc<
    dyn Fn(String, Value, ToolUseContext) -> BoxFuture<'static, PermissionDecision> + Send + Sync,
>;

/// Options handed to the query function.
pub struct QueryOptions {
    /// Working directory for the session.
    pub cwd: Option<String>,
    /// Preferred model identifier.
    pub model: Option<String>,
    /// Backend session id to resume.
    pub resume: Option<String>,
    /// Permission gate; `None` auto-allows.
    pub can_use_tool: Option<CanUseTool>,
}

/// A running query: its native event stream and its control handles.
pub struct QueryHandle {
    /// SDK-native events, in emission order. Closing ends the session.
    pub events: mpsc::Receiver<Value>,
    /// Interrupt the in-flight turn.
    pub interrupt: Arc<dyn Fn() + Send + Sync>,
    /// Release resources. Idempotent.
    pub close: Arc<dyn Fn() + Send + Sync>,
}

/// The query entry point supplied by the embedding application.
///
/// `prompt` is an async sequence of SDK-native user messages the driver
/// pushes turns into; the function returns the event stream plus handles.
pub type QueryFn = Arc<
    dyn Fn(mpsc::Receiver<Value>, QueryOptions) -> BoxFuture<'static, Result<QueryHandle, AdapterError>>
        + Send
        + Sync,
>;
