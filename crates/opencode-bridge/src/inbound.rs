// SPDX-License-Identifier: MIT OR Apache-2.0
//! Inbound translation: opencode SSE events → canonical envelopes.
//!
//! Text streaming is stateful: `message.part.delta` appends to a buffer per
//! `partID`, `message.updated` materializes the assistant message from the
//! buffers in part order (reasoning excluded), and `session.status idle` /
//! `session.error` clear them.

use serde_json::{Value, json};
use std::collections::HashMap;

use swb_core::{ContentBlock, ErrorCode, MessageBuilder, MessageType, Role, UnifiedMessage};

/// Stateful translator for one backend session's event stream.
#[derive(Debug, Default)]
pub struct OpencodeTranslator {
    session_id: String,
    buffers: HashMap<String, String>,
    part_order: Vec<String>,
    reasoning_parts: HashMap<String, bool>,
}

impl OpencodeTranslator {
    /// Create a translator scoped to one backend session id; events for
    /// other sessions on the same server are dropped.
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    /// Translate one SSE event. `None` drops it.
    pub fn translate(&mut self, event: &Value) -> Option<UnifiedMessage> {
        let kind = event.get("type").and_then(Value::as_str)?;
        let props = event.get("properties").unwrap_or(&Value::Null);

        if !self.is_ours(props) {
            return None;
        }

        match kind {
            "message.part.updated" => self.on_part_updated(props),
            "message.part.delta" => self.on_part_delta(props),
            "message.updated" => self.on_message_updated(props),
            "session.status" => self.on_session_status(props),
            "session.error" => self.on_session_error(props),
            "permission.updated" => Some(translate_permission(props)),
            // Replied-permission echo, deletions, and diffs carry nothing
            // the consumer plane needs.
            "permission.replied" | "session.deleted" | "session.diff" => None,
            "session.compacted" => Some(
                MessageBuilder::new(MessageType::StatusChange, Role::System)
                    .meta("status", json!("compacted"))
                    .build(),
            ),
            _ => None,
        }
    }

    fn is_ours(&self, props: &Value) -> bool {
        let id = props
            .get("sessionID")
            .or_else(|| props.pointer("/part/sessionID"))
            .or_else(|| props.pointer("/info/sessionID"))
            .and_then(Value::as_str);
        // Events with no session scope (server chatter) are treated as ours.
        id.is_none_or(|id| id == self.session_id)
    }

    fn record_part(&mut self, part_id: &str, reasoning: bool) {
        if !self.part_order.iter().any(|p| p == part_id) {
            self.part_order.push(part_id.to_string());
        }
        self.reasoning_parts.insert(part_id.to_string(), reasoning);
    }

    fn on_part_updated(&mut self, props: &Value) -> Option<UnifiedMessage> {
        let part = props.get("part")?;
        let part_id = part.get("id").and_then(Value::as_str)?;
        match part.get("type").and_then(Value::as_str)? {
            // Snapshots replace the buffer; deltas stream the increments.
            "text" => {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    self.record_part(part_id, false);
                    self.buffers.insert(part_id.to_string(), text.to_string());
                }
                None
            }
            "reasoning" => {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    self.record_part(part_id, true);
                    self.buffers.insert(part_id.to_string(), text.to_string());
                }
                None
            }
            "tool" => {
                let status = part
                    .pointer("/state/status")
                    .and_then(Value::as_str)
                    .unwrap_or("pending");
                let kind = if matches!(status, "completed" | "error") {
                    MessageType::ToolUseSummary
                } else {
                    MessageType::ToolProgress
                };
                let mut builder = MessageBuilder::new(kind, Role::Assistant)
                    .meta("status", json!(status))
                    .meta("tool_call_id", json!(part_id));
                if let Some(tool) = part.get("tool") {
                    builder = builder.meta("tool_name", tool.clone());
                }
                if let Some(state) = part.get("state") {
                    builder = builder.meta("state", state.clone());
                }
                Some(builder.build())
            }
            "step-start" => Some(
                MessageBuilder::new(MessageType::StreamEvent, Role::Assistant)
                    .meta("event", json!({"type": "message_start"}))
                    .build(),
            ),
            "step-finish" => None,
            _ => None,
        }
    }

    fn on_part_delta(&mut self, props: &Value) -> Option<UnifiedMessage> {
        // Only the text field streams incrementally.
        if props.get("field").and_then(Value::as_str) != Some("text") {
            return None;
        }
        let part_id = props.get("partID").and_then(Value::as_str)?;
        let delta = props.get("delta").and_then(Value::as_str)?;

        let reasoning = self.reasoning_parts.get(part_id).copied().unwrap_or(false);
        if !self.buffers.contains_key(part_id) {
            self.record_part(part_id, reasoning);
        }
        self.buffers
            .entry(part_id.to_string())
            .or_default()
            .push_str(delta);

        let delta_payload = if reasoning {
            json!({"type": "thinking_delta", "thinking": delta})
        } else {
            json!({"type": "text_delta", "text": delta})
        };
        Some(
            MessageBuilder::new(MessageType::StreamEvent, Role::Assistant)
                .meta(
                    "event",
                    json!({"type": "content_block_delta", "delta": delta_payload}),
                )
                .build(),
        )
    }

    fn on_message_updated(&mut self, props: &Value) -> Option<UnifiedMessage> {
        let info = props.get("info")?;
        if info.get("role").and_then(Value::as_str) != Some("assistant") {
            return None;
        }

        let mut builder = MessageBuilder::new(MessageType::Assistant, Role::Assistant);
        for part_id in &self.part_order {
            if self.reasoning_parts.get(part_id).copied().unwrap_or(false) {
                continue;
            }
            if let Some(text) = self.buffers.get(part_id)
                && !text.is_empty()
            {
                builder = builder.block(ContentBlock::text(text.clone()));
            }
        }
        for (native, canonical) in [
            ("modelID", "model"),
            ("tokens", "usage"),
            ("cost", "total_cost_usd"),
        ] {
            if let Some(v) = info.get(native) {
                builder = builder.meta(canonical, v.clone());
            }
        }
        Some(builder.build())
    }

    fn on_session_status(&mut self, props: &Value) -> Option<UnifiedMessage> {
        let status = props
            .pointer("/status/type")
            .or_else(|| props.get("status"))
            .and_then(Value::as_str)?;
        if status == "idle" {
            self.clear_buffers();
        }
        let canonical = match status {
            "idle" => "idle",
            "busy" => "running",
            "retry" => "running",
            other => other,
        };
        Some(
            MessageBuilder::new(MessageType::StatusChange, Role::System)
                .meta("status", json!(canonical))
                .build(),
        )
    }

    fn on_session_error(&mut self, props: &Value) -> Option<UnifiedMessage> {
        self.clear_buffers();
        let error = props.get("error").unwrap_or(&Value::Null);
        let name = error.get("name").and_then(Value::as_str).unwrap_or("");
        let message = error
            .pointer("/data/message")
            .or_else(|| error.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("backend error");
        Some(
            MessageBuilder::new(MessageType::Result, Role::System)
                .meta("is_error", json!(true))
                .meta("error_code", json!(classify_error_name(name).as_str()))
                .meta("error_message", json!(message))
                .meta("result", json!(""))
                .build(),
        )
    }

    fn clear_buffers(&mut self) {
        self.buffers.clear();
        self.part_order.clear();
        self.reasoning_parts.clear();
    }
}

fn translate_permission(props: &Value) -> UnifiedMessage {
    MessageBuilder::new(MessageType::PermissionRequest, Role::System)
        .meta(
            "request_id",
            props.get("id").cloned().unwrap_or(Value::Null),
        )
        .meta(
            "tool_name",
            props
                .get("type")
                .or_else(|| props.get("title"))
                .cloned()
                .unwrap_or(json!("unknown")),
        )
        .meta(
            "input",
            props.get("metadata").cloned().unwrap_or(json!({})),
        )
        .meta(
            "description",
            props.get("title").cloned().unwrap_or(Value::Null),
        )
        .build()
}

fn classify_error_name(name: &str) -> ErrorCode {
    match name {
        "ProviderAuthError" => ErrorCode::ProviderAuth,
        "MessageOutputLengthError" => ErrorCode::OutputLength,
        "MessageAbortedError" => ErrorCode::Aborted,
        "ContextOverflowError" => ErrorCode::ContextOverflow,
        "UnknownError" => ErrorCode::Unknown,
        _ => ErrorCode::ApiError,
    }
}
