// SPDX-License-Identifier: MIT OR Apache-2.0
//! Outbound translation: canonical envelopes → native JSON-RPC actions.

use serde_json::{Value, json};

use swb_adapter::{AdapterError, OutboundAction};
use swb_core::{MessageType, UnifiedMessage};

/// Translate a consumer-originated canonical message into a native action.
///
/// # Errors
///
/// Returns [`AdapterError::Untranslatable`] for message types that have no
/// outbound representation on this protocol; the caller treats that as a
/// hard error, not a drop.
pub fn translate_outbound(
    msg: &UnifiedMessage,
    backend_session_id: &str,
) -> Result<OutboundAction, AdapterError> {
    match msg.kind {
        MessageType::UserMessage => {
            let text = msg.text_content();
            Ok(OutboundAction::Request {
                method: "session/prompt".into(),
                params: json!({
                    "sessionId": backend_session_id,
                    "prompt": [{"type": "text", "text": text}],
                }),
            })
        }

        MessageType::Interrupt => Ok(OutboundAction::Notification {
            method: "session/cancel".into(),
            params: json!({"sessionId": backend_session_id}),
        }),

        MessageType::PermissionResponse => {
            let request_id = msg
                .metadata
                .get("request_id")
                .cloned()
                .ok_or_else(|| AdapterError::Send("permission_response without request_id".into()))?;
            Ok(OutboundAction::PermissionReply {
                request_id,
                payload: permission_outcome(msg),
            })
        }

        // Consumer presence, lifecycle chatter, and backend-originated kinds
        // have no outbound shape here.
        other => Err(AdapterError::Untranslatable(
            serde_json::to_value(other)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| format!("{other:?}")),
        )),
    }
}

/// Build the `session/request_permission` reply payload.
///
/// Behavior mapping: `allow` → `allow-once`, `always` → `allow-always`,
/// `deny` → `reject-once`; a missing behavior cancels. An explicit
/// `option_id` in metadata wins over the mapping.
fn permission_outcome(msg: &UnifiedMessage) -> Value {
    if let Some(option_id) = msg.meta_str("option_id") {
        return json!({"outcome": {"outcome": "selected", "optionId": option_id}});
    }
    match msg.meta_str("behavior") {
        Some("allow") => json!({"outcome": {"outcome": "selected", "optionId": "allow-once"}}),
        Some("always") => json!({"outcome": {"outcome": "selected", "optionId": "allow-always"}}),
        Some("deny") => json!({"outcome": {"outcome": "selected", "optionId": "reject-once"}}),
        _ => json!({"outcome": {"outcome": "cancelled"}}),
    }
}
