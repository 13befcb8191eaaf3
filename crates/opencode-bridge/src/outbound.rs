// SPDX-License-Identifier: MIT OR Apache-2.0
//! Outbound translation: canonical envelopes → opencode HTTP actions.

use serde_json::{Value, json};

use swb_adapter::{AdapterError, OutboundAction};
use swb_core::{MessageType, UnifiedMessage};

/// Translate a consumer-originated canonical message into a native action.
///
/// # Errors
///
/// Returns [`AdapterError::Untranslatable`] for message types with no HTTP
/// representation.
pub fn translate_outbound(
    msg: &UnifiedMessage,
    _backend_session_id: &str,
) -> Result<OutboundAction, AdapterError> {
    match msg.kind {
        MessageType::UserMessage => {
            let mut payload = json!({
                "parts": [{"type": "text", "text": msg.text_content()}],
            });
            if let Some(model) = msg.meta_str("model")
                && let Some((provider, model)) = model.split_once('/')
            {
                payload["model"] = json!({"providerID": provider, "modelID": model});
            }
            Ok(OutboundAction::Prompt { payload })
        }

        MessageType::Interrupt => Ok(OutboundAction::Abort),

        MessageType::PermissionResponse => {
            let request_id = msg
                .metadata
                .get("request_id")
                .cloned()
                .ok_or_else(|| AdapterError::Send("permission_response without request_id".into()))?;
            let response = match msg.meta_str("behavior") {
                Some("allow") => "once",
                Some("always") => "always",
                // deny and anything unrecognized both reject.
                _ => "reject",
            };
            Ok(OutboundAction::PermissionReply {
                request_id,
                payload: json!({"response": response}),
            })
        }

        other => Err(AdapterError::Untranslatable(format!("{other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swb_core::{MessageBuilder, Role};

    #[test]
    fn user_message_becomes_prompt_with_parts() {
        let msg = UnifiedMessage::user_text("Hi");
        match translate_outbound(&msg, "oc-1").unwrap() {
            OutboundAction::Prompt { payload } => {
                assert_eq!(payload["parts"][0]["text"], json!("Hi"));
                assert!(payload.get("model").is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn model_splits_into_provider_and_model() {
        let msg = MessageBuilder::new(MessageType::UserMessage, Role::User)
            .text("Hi")
            .meta("model", json!("anthropic/some-model"))
            .build();
        match translate_outbound(&msg, "oc-1").unwrap() {
            OutboundAction::Prompt { payload } => {
                assert_eq!(payload["model"]["providerID"], json!("anthropic"));
                assert_eq!(payload["model"]["modelID"], json!("some-model"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn interrupt_becomes_abort() {
        let msg = MessageBuilder::new(MessageType::Interrupt, Role::User).build();
        assert_eq!(translate_outbound(&msg, "oc-1").unwrap(), OutboundAction::Abort);
    }

    #[test]
    fn permission_behaviors_map_to_reply_values() {
        for (behavior, expected) in [
            (Some("allow"), "once"),
            (Some("always"), "always"),
            (Some("deny"), "reject"),
            (None, "reject"),
        ] {
            let mut builder = MessageBuilder::new(MessageType::PermissionResponse, Role::User)
                .meta("request_id", json!("perm-1"));
            if let Some(b) = behavior {
                builder = builder.meta("behavior", json!(b));
            }
            match translate_outbound(&builder.build(), "oc-1").unwrap() {
                OutboundAction::PermissionReply { payload, .. } => {
                    assert_eq!(payload["response"], json!(expected), "{behavior:?}");
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn assistant_is_untranslatable() {
        let msg = UnifiedMessage::assistant_text("no");
        assert!(translate_outbound(&msg, "oc-1").is_err());
    }
}
