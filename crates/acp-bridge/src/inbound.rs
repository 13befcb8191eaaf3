// SPDX-License-Identifier: MIT OR Apache-2.0
//! Inbound translation: native JSON-RPC traffic → canonical envelopes.
//!
//! Classification is keyed on the `session/update` `sessionUpdate`
//! discriminant. Returning `None` drops the native message (echoes of the
//! user's own turn, unknown-but-ignorable chatter).

use serde_json::{Value, json};

use swb_core::{ErrorCode, MessageBuilder, MessageType, Role, UnifiedMessage};

use crate::classify::ErrorClassifier;
use crate::codec::RpcError;

/// Translate one `session/update` notification payload.
///
/// `update` is the object under `params.update`.
#[must_use]
pub fn translate_session_update(update: &Value) -> Option<UnifiedMessage> {
    let discriminant = update.get("sessionUpdate").and_then(Value::as_str)?;

    match discriminant {
        "agent_message_chunk" => {
            let text = chunk_text(update)?;
            Some(
                MessageBuilder::new(MessageType::StreamEvent, Role::Assistant)
                    .meta(
                        "event",
                        json!({
                            "type": "content_block_delta",
                            "delta": {"type": "text_delta", "text": text},
                        }),
                    )
                    .build(),
            )
        }

        "agent_thought_chunk" => {
            let text = chunk_text(update)?;
            Some(
                MessageBuilder::new(MessageType::StreamEvent, Role::Assistant)
                    .meta(
                        "event",
                        json!({
                            "type": "content_block_delta",
                            "delta": {"type": "thinking_delta", "thinking": text},
                        }),
                    )
                    .build(),
            )
        }

        // Echo of the consumer's own turn: the passthrough layer either
        // claimed it already or nobody wants it.
        "user_message_chunk" => None,

        "tool_call" => {
            let mut builder = MessageBuilder::new(MessageType::ToolProgress, Role::Assistant)
                .meta("status", update.get("status").cloned().unwrap_or(json!("pending")));
            for key in ["toolCallId", "title", "kind", "rawInput"] {
                if let Some(v) = update.get(key) {
                    builder = builder.meta(snake_key(key), v.clone());
                }
            }
            Some(builder.build())
        }

        "tool_call_update" => {
            let status = update.get("status").and_then(Value::as_str).unwrap_or("in_progress");
            let kind = if matches!(status, "completed" | "failed") {
                MessageType::ToolUseSummary
            } else {
                MessageType::ToolProgress
            };
            let mut builder =
                MessageBuilder::new(kind, Role::Assistant).meta("status", json!(status));
            for key in ["toolCallId", "title", "content", "rawOutput"] {
                if let Some(v) = update.get(key) {
                    builder = builder.meta(snake_key(key), v.clone());
                }
            }
            Some(builder.build())
        }

        "plan" => Some(
            MessageBuilder::new(MessageType::ToolProgress, Role::Assistant)
                .meta("kind", json!("plan"))
                .meta(
                    "entries",
                    update.get("entries").cloned().unwrap_or(json!([])),
                )
                .build(),
        ),

        "current_mode_update" => {
            let mode = update.get("currentModeId").and_then(Value::as_str)?;
            Some(
                MessageBuilder::new(MessageType::ConfigurationChange, Role::System)
                    .meta("permissionMode", json!(mode))
                    .build(),
            )
        }

        "available_commands_update" => {
            let commands = update
                .get("availableCommands")
                .and_then(Value::as_array)
                .map(|cmds| {
                    cmds.iter()
                        .filter_map(|c| {
                            let name = c.get("name").and_then(Value::as_str)?;
                            Some(json!({
                                "name": name,
                                "description": c.get("description").and_then(Value::as_str).unwrap_or(""),
                            }))
                        })
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            Some(
                MessageBuilder::new(MessageType::ConfigurationChange, Role::System)
                    .meta("slash_commands", Value::Array(commands))
                    .build(),
            )
        }

        // Forward-compat: preserve the payload, mark unknown.
        _ => Some(
            MessageBuilder::new(MessageType::Unknown, Role::System)
                .meta("raw", update.clone())
                .build(),
        ),
    }
}

fn chunk_text(update: &Value) -> Option<String> {
    let content = update.get("content")?;
    match content.get("type").and_then(Value::as_str) {
        Some("text") => content
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

fn snake_key(camel: &str) -> String {
    let mut out = String::with_capacity(camel.len() + 4);
    for c in camel.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Translate a `session/request_permission` RPC request into a
/// `permission_request` envelope. The RPC id becomes `metadata.request_id`
/// so the outbound reply can answer on the captured id.
#[must_use]
pub fn translate_permission_request(rpc_id: &Value, params: &Value) -> UnifiedMessage {
    let tool_call = params.get("toolCall").cloned().unwrap_or(Value::Null);
    MessageBuilder::new(MessageType::PermissionRequest, Role::System)
        .meta("request_id", rpc_id.clone())
        .meta(
            "tool_name",
            tool_call.get("title").cloned().unwrap_or(json!("unknown")),
        )
        .meta(
            "input",
            tool_call.get("rawInput").cloned().unwrap_or(json!({})),
        )
        .meta(
            "description",
            tool_call.get("kind").cloned().unwrap_or(Value::Null),
        )
        .meta(
            "options",
            params.get("options").cloned().unwrap_or(json!([])),
        )
        .build()
}

/// Build the `result` envelope for a finished prompt turn.
#[must_use]
pub fn translate_prompt_result(
    outcome: Result<&Value, &RpcError>,
    classifier: &dyn ErrorClassifier,
) -> UnifiedMessage {
    match outcome {
        Ok(result) => {
            let mut builder = MessageBuilder::new(MessageType::Result, Role::System)
                .meta("is_error", json!(false))
                .meta(
                    "result",
                    result.get("result").cloned().unwrap_or(json!("")),
                );
            if let Some(stop) = result.get("stopReason") {
                builder = builder.meta("stop_reason", stop.clone());
            }
            if let Some(usage) = result.get("usage") {
                builder = builder.meta("usage", usage.clone());
            }
            builder.build()
        }
        Err(error) => {
            let code = classifier.classify(error);
            let mut builder = MessageBuilder::new(MessageType::Result, Role::System)
                .meta("is_error", json!(true))
                .meta("error_code", json!(code.as_str()))
                .meta("error_message", json!(error.message));
            if let Some(data) = &error.data {
                builder = builder.meta("error_data", data.clone());
            }
            builder.build()
        }
    }
}

/// Build the `session_init` envelope emitted after a successful handshake.
#[must_use]
pub fn session_init_message(
    backend_session_id: &str,
    cwd: Option<&str>,
    model: Option<&str>,
    agent_info: Option<&Value>,
    current_mode: Option<&str>,
) -> UnifiedMessage {
    let mut builder = MessageBuilder::new(MessageType::SessionInit, Role::System)
        .meta("session_id", json!(backend_session_id));
    if let Some(cwd) = cwd {
        builder = builder.meta("cwd", json!(cwd));
    }
    if let Some(model) = model {
        builder = builder.meta("model", json!(model));
    }
    if let Some(info) = agent_info {
        builder = builder.meta("agent", info.clone());
    }
    if let Some(mode) = current_mode {
        builder = builder.meta("permissionMode", json!(mode));
    }
    builder.build()
}

/// Whether a raw native value looks like a CLI user-echo
/// (`{type: "user", message: {content: ...}}`).
#[must_use]
pub fn is_user_echo(raw: &Value) -> bool {
    raw.get("type").and_then(Value::as_str) == Some("user")
        && raw.pointer("/message/content").is_some()
}

/// The default error envelope for a turn that died without an RPC error.
#[must_use]
pub fn stream_failure_result(message: &str) -> UnifiedMessage {
    MessageBuilder::new(MessageType::Result, Role::System)
        .meta("is_error", json!(true))
        .meta("error_code", json!(ErrorCode::ExecutionError.as_str()))
        .meta("error_message", json!(message))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::AcpClassifier;

    #[test]
    fn message_chunk_becomes_text_delta_stream_event() {
        let update = json!({
            "sessionUpdate": "agent_message_chunk",
            "content": {"type": "text", "text": "Hi"},
        });
        let msg = translate_session_update(&update).unwrap();
        assert_eq!(msg.kind, MessageType::StreamEvent);
        assert_eq!(msg.role, Role::Assistant);
        assert_eq!(
            msg.metadata["event"],
            json!({
                "type": "content_block_delta",
                "delta": {"type": "text_delta", "text": "Hi"},
            })
        );
    }

    #[test]
    fn thought_chunk_becomes_thinking_delta() {
        let update = json!({
            "sessionUpdate": "agent_thought_chunk",
            "content": {"type": "text", "text": "pondering"},
        });
        let msg = translate_session_update(&update).unwrap();
        assert_eq!(
            msg.metadata["event"]["delta"]["type"],
            json!("thinking_delta")
        );
    }

    #[test]
    fn user_echo_chunk_is_dropped() {
        let update = json!({
            "sessionUpdate": "user_message_chunk",
            "content": {"type": "text", "text": "hello"},
        });
        assert!(translate_session_update(&update).is_none());
    }

    #[test]
    fn tool_call_starts_as_pending_progress() {
        let update = json!({
            "sessionUpdate": "tool_call",
            "toolCallId": "t-1",
            "title": "Read file",
            "kind": "read",
        });
        let msg = translate_session_update(&update).unwrap();
        assert_eq!(msg.kind, MessageType::ToolProgress);
        assert_eq!(msg.metadata["status"], json!("pending"));
        assert_eq!(msg.metadata["tool_call_id"], json!("t-1"));
    }

    #[test]
    fn tool_call_update_terminal_states_summarize() {
        for status in ["completed", "failed"] {
            let update = json!({
                "sessionUpdate": "tool_call_update",
                "toolCallId": "t-1",
                "status": status,
            });
            let msg = translate_session_update(&update).unwrap();
            assert_eq!(msg.kind, MessageType::ToolUseSummary, "{status}");
        }
        let update = json!({
            "sessionUpdate": "tool_call_update",
            "toolCallId": "t-1",
            "status": "in_progress",
        });
        assert_eq!(
            translate_session_update(&update).unwrap().kind,
            MessageType::ToolProgress
        );
    }

    #[test]
    fn mode_update_becomes_configuration_change() {
        let update = json!({
            "sessionUpdate": "current_mode_update",
            "currentModeId": "acceptEdits",
        });
        let msg = translate_session_update(&update).unwrap();
        assert_eq!(msg.kind, MessageType::ConfigurationChange);
        assert_eq!(msg.metadata["permissionMode"], json!("acceptEdits"));
    }

    #[test]
    fn available_commands_surface_for_registration() {
        let update = json!({
            "sessionUpdate": "available_commands_update",
            "availableCommands": [
                {"name": "compact", "description": "Compact context"},
                {"name": "model"},
            ],
        });
        let msg = translate_session_update(&update).unwrap();
        let commands = msg.metadata["slash_commands"].as_array().unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0]["name"], "compact");
        assert_eq!(commands[1]["description"], "");
    }

    #[test]
    fn unknown_update_is_preserved_not_dropped() {
        let update = json!({"sessionUpdate": "novel_thing", "x": 1});
        let msg = translate_session_update(&update).unwrap();
        assert_eq!(msg.kind, MessageType::Unknown);
        assert_eq!(msg.metadata["raw"]["x"], json!(1));
    }

    #[test]
    fn permission_request_captures_rpc_id() {
        let params = json!({
            "sessionId": "be-1",
            "toolCall": {"toolCallId": "t-9", "title": "Bash", "rawInput": {"command": "ls"}},
            "options": [{"optionId": "allow-once", "name": "Allow"}],
        });
        let msg = translate_permission_request(&json!(42), &params);
        assert_eq!(msg.kind, MessageType::PermissionRequest);
        assert_eq!(msg.metadata["request_id"], json!(42));
        assert_eq!(msg.metadata["tool_name"], json!("Bash"));
        assert_eq!(msg.metadata["input"], json!({"command": "ls"}));
    }

    #[test]
    fn prompt_error_is_classified() {
        let error = RpcError {
            code: 401,
            message: "no credentials".into(),
            data: None,
        };
        let msg = translate_prompt_result(Err(&error), &AcpClassifier);
        assert!(msg.is_error_result());
        assert_eq!(msg.metadata["error_code"], json!("provider_auth"));
        assert_eq!(msg.metadata["error_message"], json!("no credentials"));
    }

    #[test]
    fn prompt_success_carries_stop_reason() {
        let result = json!({"stopReason": "end_turn"});
        let msg = translate_prompt_result(Ok(&result), &AcpClassifier);
        assert!(!msg.is_error_result());
        assert_eq!(msg.metadata["stop_reason"], json!("end_turn"));
    }

    #[test]
    fn user_echo_detection() {
        assert!(is_user_echo(
            &json!({"type": "user", "message": {"content": "/help"}})
        ));
        assert!(!is_user_echo(&json!({"type": "assistant"})));
    }
}
