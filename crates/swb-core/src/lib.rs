// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! swb-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable contract for Agent Switchboard.

/// Deterministic JSON canonicalization and envelope digests.
pub mod canonical;
/// Session lifecycle state machine and transition rules.
pub mod lifecycle;
/// Session-level derived state and the pure state reducer.
pub mod state;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Current contract version string embedded in consumer-facing frames.
///
/// # Examples
///
/// ```
/// assert_eq!(swb_core::CONTRACT_VERSION, "swb/v0.1");
/// ```
pub const CONTRACT_VERSION: &str = "swb/v0.1";

// ── Roles ───────────────────────────────────────────────────────────────

/// Author role carried by every canonical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Consumer / human turn.
    User,
    /// Backend / model turn.
    Assistant,
    /// Broker- or backend-originated system traffic.
    System,
    /// Tool result turn.
    Tool,
}

// ── Message types ───────────────────────────────────────────────────────

/// Closed enumeration of canonical message types.
///
/// Translators map every native backend message onto one of these; anything
/// a translator cannot classify becomes [`MessageType::Unknown`] rather than
/// an error, so new backend message kinds degrade gracefully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Backend handshake completed; carries `model`, `cwd`, `tools`,
    /// `permissionMode`, `session_id` in metadata.
    SessionInit,
    /// Backend busy/idle/retry status flip.
    StatusChange,
    /// A complete assistant message (content blocks populated).
    Assistant,
    /// Turn terminal marker; carries `is_error`, `error_code`,
    /// `error_message` in metadata.
    Result,
    /// Incremental streaming event (deltas live in `metadata.event`).
    StreamEvent,
    /// Backend asks for permission to run a tool; carries `request_id`,
    /// `tool_name`, `input`, `description`.
    PermissionRequest,
    /// Consumer's answer to a permission request.
    PermissionResponse,
    /// Response to a control request (capabilities handshake).
    ControlResponse,
    /// Incremental progress for a long-running tool call.
    ToolProgress,
    /// Post-hoc summary of a completed tool call.
    ToolUseSummary,
    /// Backend authentication status report.
    AuthStatus,
    /// Consumer-originated user input.
    UserMessage,
    /// Consumer-originated interrupt / cancel.
    Interrupt,
    /// Model / permission-mode / settings change.
    ConfigurationChange,
    /// Session lifecycle signal (created, closing, ...).
    SessionLifecycle,
    /// Inter-agent team chat traffic.
    TeamMessage,
    /// Team task state update.
    TeamTaskUpdate,
    /// Team membership / state change.
    TeamStateChange,
    /// Forward-compatibility catch-all; raw payload preserved in metadata.
    Unknown,
}

// ── Canonical error codes ───────────────────────────────────────────────

/// Closed error-code taxonomy set by translators on error results.
///
/// Lives in `result.metadata.error_code`. Free text goes in `error_message`,
/// structured payloads in `error_data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Backend cannot authenticate with its model provider.
    ProviderAuth,
    /// Upstream API returned an error.
    ApiError,
    /// Conversation exceeded the context window.
    ContextOverflow,
    /// Output truncated at the length limit.
    OutputLength,
    /// The turn was aborted by an interrupt.
    Aborted,
    /// Provider rate limit hit.
    RateLimit,
    /// Configured turn cap reached.
    MaxTurns,
    /// Configured budget cap reached.
    MaxBudget,
    /// A tool or subprocess failed during execution.
    ExecutionError,
    /// Unclassifiable failure.
    Unknown,
}

impl ErrorCode {
    /// The wire (snake_case) spelling of this code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProviderAuth => "provider_auth",
            Self::ApiError => "api_error",
            Self::ContextOverflow => "context_overflow",
            Self::OutputLength => "output_length",
            Self::Aborted => "aborted",
            Self::RateLimit => "rate_limit",
            Self::MaxTurns => "max_turns",
            Self::MaxBudget => "max_budget",
            Self::ExecutionError => "execution_error",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Content blocks ──────────────────────────────────────────────────────

/// A single content block inside a [`UnifiedMessage`].
///
/// Content is primarily for assistant payloads; most envelope types carry
/// their semantics in metadata instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text payload.
        text: String,
    },

    /// A tool invocation requested by the backend.
    ToolUse {
        /// Unique identifier for this tool invocation.
        id: String,
        /// Tool name.
        name: String,
        /// JSON input arguments.
        input: Value,
    },

    /// The result of a prior tool invocation.
    ToolResult {
        /// Identifier of the corresponding [`ContentBlock::ToolUse`].
        tool_use_id: String,
        /// Nested content blocks for the result payload.
        content: Vec<ContentBlock>,
        /// Whether the tool reported an error.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },

    /// A fenced code fragment.
    Code {
        /// The code text.
        code: String,
        /// Language hint, if known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },

    /// Base64-encoded image data.
    Image {
        /// Base64-encoded image bytes.
        base64: String,
        /// MIME type (e.g. `"image/png"`).
        media_type: String,
    },

    /// Extended thinking / reasoning text.
    Thinking {
        /// The thinking text.
        text: String,
    },

    /// The backend refused to answer.
    Refusal {
        /// Refusal text, as reported.
        text: String,
    },
}

impl ContentBlock {
    /// Shorthand for a [`ContentBlock::Text`] block.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

// ── The envelope ────────────────────────────────────────────────────────

/// The protocol-independent envelope every message in motion is wrapped in.
///
/// Immutable after construction. [`UnifiedMessage::new`] and
/// [`MessageBuilder`] assign `id` and `timestamp`; nothing else does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct UnifiedMessage {
    /// Globally unique message identifier.
    pub id: Uuid,

    /// Wall-clock creation time, serialized as epoch milliseconds.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    #[schemars(with = "i64")]
    pub timestamp: DateTime<Utc>,

    /// Canonical message type.
    #[serde(rename = "type")]
    pub kind: MessageType,

    /// Author role.
    pub role: Role,

    /// Ordered content blocks (assistant payloads; often empty elsewhere).
    #[serde(default)]
    pub content: Vec<ContentBlock>,

    /// Protocol-specific fields that do not belong in `content`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,

    /// Optional threading link to a parent message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
}

impl UnifiedMessage {
    /// Create a new envelope with a fresh id and the current wall-clock time.
    #[must_use]
    pub fn new(kind: MessageType, role: Role) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            role,
            content: Vec::new(),
            metadata: BTreeMap::new(),
            parent_id: None,
        }
    }

    /// Shorthand for a user message holding a single text block.
    #[must_use]
    pub fn user_text(text: impl Into<String>) -> Self {
        MessageBuilder::new(MessageType::UserMessage, Role::User)
            .text(text)
            .build()
    }

    /// Shorthand for a complete assistant message holding a single text block.
    #[must_use]
    pub fn assistant_text(text: impl Into<String>) -> Self {
        MessageBuilder::new(MessageType::Assistant, Role::Assistant)
            .text(text)
            .build()
    }

    /// Concatenate every [`ContentBlock::Text`] block into one string.
    #[must_use]
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Fetch a metadata value as a string slice.
    #[must_use]
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Fetch a metadata value as a boolean.
    #[must_use]
    pub fn meta_bool(&self, key: &str) -> Option<bool> {
        self.metadata.get(key).and_then(Value::as_bool)
    }

    /// Returns `true` for a `result` whose metadata marks an error.
    #[must_use]
    pub fn is_error_result(&self) -> bool {
        self.kind == MessageType::Result && self.meta_bool("is_error").unwrap_or(false)
    }
}

// ── Builder ─────────────────────────────────────────────────────────────

/// Builder for constructing [`UnifiedMessage`]s ergonomically.
///
/// # Examples
///
/// ```
/// use swb_core::{MessageBuilder, MessageType, Role};
///
/// let msg = MessageBuilder::new(MessageType::Result, Role::System)
///     .meta("is_error", serde_json::json!(false))
///     .meta("result", serde_json::json!("done"))
///     .build();
///
/// assert_eq!(msg.kind, MessageType::Result);
/// assert_eq!(msg.meta_str("result"), Some("done"));
/// ```
#[derive(Debug)]
pub struct MessageBuilder {
    kind: MessageType,
    role: Role,
    content: Vec<ContentBlock>,
    metadata: BTreeMap<String, Value>,
    parent_id: Option<Uuid>,
}

impl MessageBuilder {
    /// Start a builder for the given type and role.
    #[must_use]
    pub fn new(kind: MessageType, role: Role) -> Self {
        Self {
            kind,
            role,
            content: Vec::new(),
            metadata: BTreeMap::new(),
            parent_id: None,
        }
    }

    /// Append a content block.
    #[must_use]
    pub fn block(mut self, block: ContentBlock) -> Self {
        self.content.push(block);
        self
    }

    /// Append a text content block.
    #[must_use]
    pub fn text(self, text: impl Into<String>) -> Self {
        self.block(ContentBlock::text(text))
    }

    /// Set a metadata key.
    #[must_use]
    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Merge a whole metadata map.
    #[must_use]
    pub fn metadata(mut self, map: BTreeMap<String, Value>) -> Self {
        self.metadata.extend(map);
        self
    }

    /// Set the parent message id.
    #[must_use]
    pub fn parent(mut self, id: Uuid) -> Self {
        self.parent_id = Some(id);
        self
    }

    /// Consume the builder, assigning a fresh id and the current time.
    #[must_use]
    pub fn build(self) -> UnifiedMessage {
        UnifiedMessage {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind: self.kind,
            role: self.role,
            content: self.content,
            metadata: self.metadata,
            parent_id: self.parent_id,
        }
    }
}

// ── Envelope validation ─────────────────────────────────────────────────

/// Why a raw JSON value is not a valid canonical envelope.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The value is not a JSON object.
    #[error("envelope must be an object")]
    NotAnObject,

    /// A required field is absent.
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    /// `type` is not a member of the closed enumeration.
    #[error("unknown message type `{0}`")]
    UnknownType(String),

    /// `role` is not a member of the closed enumeration.
    #[error("unknown role `{0}`")]
    UnknownRole(String),

    /// `content` is present but not an array.
    #[error("`content` must be an array")]
    ContentNotArray,

    /// `metadata` is present but not an object.
    #[error("`metadata` must be an object")]
    MetadataNotObject,

    /// `timestamp` is present but not a number.
    #[error("`timestamp` must be numeric")]
    TimestampNotNumeric,
}

/// Validate a raw JSON value against the envelope shape.
///
/// Accepts exactly what a [`UnifiedMessage`] serializes to: `id` and
/// `timestamp` present, `type`/`role` in their closed enumerations, `content`
/// an array, `metadata` (if present) an object.
///
/// # Errors
///
/// Returns the first [`EnvelopeError`] encountered, fields checked in
/// declaration order.
pub fn validate_envelope(value: &Value) -> Result<(), EnvelopeError> {
    let obj = value.as_object().ok_or(EnvelopeError::NotAnObject)?;

    if !obj.contains_key("id") {
        return Err(EnvelopeError::MissingField("id"));
    }

    match obj.get("timestamp") {
        None => return Err(EnvelopeError::MissingField("timestamp")),
        Some(ts) if !ts.is_number() => return Err(EnvelopeError::TimestampNotNumeric),
        Some(_) => {}
    }

    let kind = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or(EnvelopeError::MissingField("type"))?;
    if serde_json::from_value::<MessageType>(Value::String(kind.to_string())).is_err() {
        return Err(EnvelopeError::UnknownType(kind.to_string()));
    }

    let role = obj
        .get("role")
        .and_then(Value::as_str)
        .ok_or(EnvelopeError::MissingField("role"))?;
    if serde_json::from_value::<Role>(Value::String(role.to_string())).is_err() {
        return Err(EnvelopeError::UnknownRole(role.to_string()));
    }

    match obj.get("content") {
        None => return Err(EnvelopeError::MissingField("content")),
        Some(c) if !c.is_array() => return Err(EnvelopeError::ContentNotArray),
        Some(_) => {}
    }

    if let Some(meta) = obj.get("metadata")
        && !meta.is_object()
    {
        return Err(EnvelopeError::MetadataNotObject);
    }

    Ok(())
}
