// SPDX-License-Identifier: MIT OR Apache-2.0
//! Translation between Agent SDK native messages and canonical envelopes.
//!
//! Shared by both drivers in this crate: the in-process generator yields the
//! same shapes the NDJSON forwarder reads off its socket.

use serde_json::{Value, json};

use swb_core::{ContentBlock, ErrorCode, MessageBuilder, MessageType, Role, UnifiedMessage};

/// Translate one SDK-native event. `None` drops it.
#[must_use]
pub fn translate_sdk_event(event: &Value) -> Option<UnifiedMessage> {
    let kind = event.get("type").and_then(Value::as_str)?;

    match kind {
        "system" => match event.get("subtype").and_then(Value::as_str) {
            Some("init") => {
                let mut builder = MessageBuilder::new(MessageType::SessionInit, Role::System);
                for key in ["model", "cwd", "tools", "permissionMode", "session_id",
                            "mcp_servers", "slash_commands", "skills"] {
                    if let Some(v) = event.get(key) {
                        builder = builder.meta(key, v.clone());
                    }
                }
                Some(builder.build())
            }
            Some("status") => Some(
                MessageBuilder::new(MessageType::StatusChange, Role::System)
                    .meta(
                        "status",
                        event.get("status").cloned().unwrap_or(Value::Null),
                    )
                    .build(),
            ),
            // Hook chatter, compact boundaries, task notifications: nothing
            // the consumer plane consumes.
            _ => None,
        },

        "stream_event" => {
            let mut builder = MessageBuilder::new(MessageType::StreamEvent, Role::Assistant)
                .meta("event", event.get("event").cloned().unwrap_or(Value::Null));
            if let Some(parent) = event.get("parent_tool_use_id")
                && !parent.is_null()
            {
                builder = builder.meta("parent_tool_use_id", parent.clone());
            }
            Some(builder.build())
        }

        "assistant" => {
            let blocks = event
                .pointer("/message/content")
                .and_then(Value::as_array)
                .map(|content| content.iter().filter_map(native_block).collect())
                .unwrap_or_default();
            let mut msg = MessageBuilder::new(MessageType::Assistant, Role::Assistant).build();
            msg.content = blocks;
            Some(msg)
        }

        "user" => {
            let text = event
                .pointer("/message/content")
                .map(|content| match content {
                    Value::String(s) => s.clone(),
                    Value::Array(blocks) => blocks
                        .iter()
                        .filter_map(|b| b.get("text").and_then(Value::as_str))
                        .collect::<Vec<_>>()
                        .join(""),
                    _ => String::new(),
                })
                .unwrap_or_default();
            Some(
                MessageBuilder::new(MessageType::UserMessage, Role::User)
                    .text(text)
                    .build(),
            )
        }

        "result" => {
            let is_error = event
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let mut builder = MessageBuilder::new(MessageType::Result, Role::System)
                .meta("is_error", json!(is_error))
                .meta("result", event.get("result").cloned().unwrap_or(json!("")));
            if is_error {
                let subtype = event.get("subtype").and_then(Value::as_str).unwrap_or("");
                builder = builder.meta(
                    "error_code",
                    json!(classify_result_subtype(subtype).as_str()),
                );
                if let Some(message) = event.get("error_message") {
                    builder = builder.meta("error_message", message.clone());
                }
            }
            for key in ["total_cost_usd", "usage", "num_turns", "duration_ms"] {
                if let Some(v) = event.get(key) {
                    builder = builder.meta(key, v.clone());
                }
            }
            Some(builder.build())
        }

        "control_response" => {
            let response = event.get("response").unwrap_or(&Value::Null);
            let mut builder = MessageBuilder::new(MessageType::ControlResponse, Role::System)
                .meta(
                    "subtype",
                    response.get("subtype").cloned().unwrap_or(Value::Null),
                )
                .meta(
                    "response",
                    response.get("response").cloned().unwrap_or(Value::Null),
                );
            if let Some(request_id) = response.get("request_id") {
                builder = builder.meta("request_id", request_id.clone());
            }
            Some(builder.build())
        }

        "auth_status" => Some(
            MessageBuilder::new(MessageType::AuthStatus, Role::System)
                .meta(
                    "status",
                    event.get("status").cloned().unwrap_or(Value::Null),
                )
                .build(),
        ),

        // Requests the external process makes of the broker. Only the
        // permission gate is meaningful on the consumer plane.
        "control_request" => {
            let request = event.get("request").unwrap_or(&Value::Null);
            match request.get("subtype").and_then(Value::as_str) {
                Some("can_use_tool") => Some(
                    MessageBuilder::new(MessageType::PermissionRequest, Role::System)
                        .meta(
                            "request_id",
                            event.get("request_id").cloned().unwrap_or(Value::Null),
                        )
                        .meta(
                            "tool_name",
                            request.get("tool_name").cloned().unwrap_or(json!("unknown")),
                        )
                        .meta("input", request.get("input").cloned().unwrap_or(json!({})))
                        .build(),
                ),
                _ => Some(
                    MessageBuilder::new(MessageType::Unknown, Role::System)
                        .meta("raw", event.clone())
                        .build(),
                ),
            }
        }

        _ => Some(
            MessageBuilder::new(MessageType::Unknown, Role::System)
                .meta("raw", event.clone())
                .build(),
        ),
    }
}

fn native_block(block: &Value) -> Option<ContentBlock> {
    match block.get("type").and_then(Value::as_str)? {
        "text" => Some(ContentBlock::text(
            block.get("text").and_then(Value::as_str)?,
        )),
        "thinking" => Some(ContentBlock::Thinking {
            text: block
                .get("thinking")
                .or_else(|| block.get("text"))
                .and_then(Value::as_str)?
                .to_string(),
        }),
        "tool_use" => Some(ContentBlock::ToolUse {
            id: block.get("id").and_then(Value::as_str)?.to_string(),
            name: block.get("name").and_then(Value::as_str)?.to_string(),
            input: block.get("input").cloned().unwrap_or(json!({})),
        }),
        "tool_result" => Some(ContentBlock::ToolResult {
            tool_use_id: block
                .get("tool_use_id")
                .and_then(Value::as_str)?
                .to_string(),
            content: vec![],
            is_error: block.get("is_error").and_then(Value::as_bool),
        }),
        _ => None,
    }
}

fn classify_result_subtype(subtype: &str) -> ErrorCode {
    match subtype {
        "error_max_turns" => ErrorCode::MaxTurns,
        "error_max_budget" => ErrorCode::MaxBudget,
        "error_during_execution" => ErrorCode::ExecutionError,
        "error_context_overflow" => ErrorCode::ContextOverflow,
        "error_output_length" => ErrorCode::OutputLength,
        "error_aborted" => ErrorCode::Aborted,
        _ => ErrorCode::Unknown,
    }
}

/// Build the native user-message line for an outbound canonical user turn.
#[must_use]
pub fn native_user_message(msg: &UnifiedMessage) -> Value {
    json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{"type": "text", "text": msg.text_content()}],
        },
    })
}

/// Build the native control request for the capabilities handshake.
#[must_use]
pub fn native_control_request(request_id: &Value) -> Value {
    json!({
        "type": "control_request",
        "request_id": request_id,
        "request": {"subtype": "initialize"},
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_init_maps_identity_metadata() {
        let event = json!({
            "type": "system", "subtype": "init",
            "model": "m-1", "cwd": "/work",
            "tools": ["Read"], "permissionMode": "default",
            "session_id": "be-1",
        });
        let msg = translate_sdk_event(&event).unwrap();
        assert_eq!(msg.kind, MessageType::SessionInit);
        assert_eq!(msg.meta_str("model"), Some("m-1"));
        assert_eq!(msg.meta_str("session_id"), Some("be-1"));
    }

    #[test]
    fn system_hook_chatter_is_dropped() {
        let event = json!({"type": "system", "subtype": "hook_started"});
        assert!(translate_sdk_event(&event).is_none());
    }

    #[test]
    fn stream_event_keeps_parent_tool_use() {
        let event = json!({
            "type": "stream_event",
            "event": {"type": "content_block_delta", "delta": {"type": "text_delta", "text": "x"}},
            "parent_tool_use_id": "t-1",
        });
        let msg = translate_sdk_event(&event).unwrap();
        assert_eq!(msg.metadata["parent_tool_use_id"], json!("t-1"));
    }

    #[test]
    fn assistant_content_blocks_convert() {
        let event = json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "text", "text": "hi"},
                {"type": "thinking", "thinking": "hm"},
                {"type": "tool_use", "id": "t-1", "name": "Bash", "input": {"command": "ls"}},
            ]},
        });
        let msg = translate_sdk_event(&event).unwrap();
        assert_eq!(msg.content.len(), 3);
        assert_eq!(msg.text_content(), "hi");
    }

    #[test]
    fn error_result_classifies_subtype() {
        let event = json!({
            "type": "result", "subtype": "error_max_turns",
            "is_error": true, "result": "",
        });
        let msg = translate_sdk_event(&event).unwrap();
        assert_eq!(msg.meta_str("error_code"), Some("max_turns"));
    }

    #[test]
    fn success_result_carries_usage() {
        let event = json!({
            "type": "result", "subtype": "success", "is_error": false,
            "result": "done", "total_cost_usd": 0.1,
            "usage": {"input_tokens": 10, "output_tokens": 5},
        });
        let msg = translate_sdk_event(&event).unwrap();
        assert!(!msg.is_error_result());
        assert_eq!(msg.metadata["usage"]["input_tokens"], json!(10));
    }

    #[test]
    fn control_response_flattens_inner_fields() {
        let event = json!({
            "type": "control_response",
            "response": {
                "subtype": "success",
                "request_id": "ctrl-1",
                "response": {"commands": []},
            },
        });
        let msg = translate_sdk_event(&event).unwrap();
        assert_eq!(msg.kind, MessageType::ControlResponse);
        assert_eq!(msg.meta_str("subtype"), Some("success"));
        assert_eq!(msg.meta_str("request_id"), Some("ctrl-1"));
    }

    #[test]
    fn unknown_type_is_preserved() {
        let event = json!({"type": "somewhere_new", "x": 1});
        let msg = translate_sdk_event(&event).unwrap();
        assert_eq!(msg.kind, MessageType::Unknown);
    }

    #[test]
    fn user_echo_translates_string_and_blocks() {
        let string_form = json!({"type": "user", "message": {"content": "/help"}});
        assert_eq!(
            translate_sdk_event(&string_form).unwrap().text_content(),
            "/help"
        );
        let block_form = json!({
            "type": "user",
            "message": {"content": [{"type": "text", "text": "/con"}, {"type": "text", "text": "text"}]},
        });
        assert_eq!(
            translate_sdk_event(&block_form).unwrap().text_content(),
            "/context"
        );
    }
}
