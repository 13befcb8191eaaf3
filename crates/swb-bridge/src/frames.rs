// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bridge-originated consumer frames.
//!
//! Everything written to a consumer socket is a JSON object with a `type`
//! field: either a canonical envelope relayed verbatim, or one of these
//! bridge frames.

use serde_json::{Value, json};

use swb_core::state::SessionState;

use crate::consumer::Identity;

/// First frame after successful authentication.
#[must_use]
pub fn identity_frame(identity: &Identity) -> Value {
    json!({
        "type": "identity",
        "identity": {
            "subject": identity.subject,
            "role": identity.role.as_str(),
        },
    })
}

/// Session snapshot sent right after the identity frame.
#[must_use]
pub fn session_init_frame(session_id: &str, state: &SessionState) -> Value {
    json!({
        "type": "session_init",
        "session_id": session_id,
        "state": state,
    })
}

/// Inbound rejection or local failure surfaced to one socket.
#[must_use]
pub fn error_frame(message: &str) -> Value {
    json!({"type": "error", "message": message})
}

/// A backend session was bound.
#[must_use]
pub fn cli_connected_frame(adapter: &str) -> Value {
    json!({"type": "cli_connected", "adapter": adapter})
}

/// The backend session ended.
#[must_use]
pub fn cli_disconnected_frame() -> Value {
    json!({"type": "cli_disconnected"})
}

/// Capabilities handshake finished; snapshot attached.
#[must_use]
pub fn capabilities_ready_frame(capabilities: &Value) -> Value {
    json!({"type": "capabilities_ready", "capabilities": capabilities})
}

/// A pending permission died with its backend. Participant-only.
#[must_use]
pub fn permission_cancelled_frame(request_id: &Value) -> Value {
    json!({"type": "permission_cancelled", "request_id": request_id})
}

/// A slash command completed.
#[must_use]
pub fn slash_command_result_frame(
    command: &str,
    request_id: &str,
    content: &str,
    source: &str,
) -> Value {
    json!({
        "type": "slash_command_result",
        "command": command,
        "request_id": request_id,
        "content": content,
        "source": source,
    })
}

/// A slash command failed.
#[must_use]
pub fn slash_command_error_frame(command: &str, request_id: &str, error: &str) -> Value {
    json!({
        "type": "slash_command_error",
        "command": command,
        "request_id": request_id,
        "error": error,
    })
}

/// Reply to `presence_query`: who is attached.
#[must_use]
pub fn presence_frame(consumers: &[Identity]) -> Value {
    json!({
        "type": "presence",
        "consumers": consumers
            .iter()
            .map(|i| json!({"subject": i.subject, "role": i.role.as_str()}))
            .collect::<Vec<_>>(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::ConsumerRole;

    #[test]
    fn frames_carry_type_discriminants() {
        let identity = Identity {
            subject: "u-1".into(),
            role: ConsumerRole::Observer,
        };
        assert_eq!(identity_frame(&identity)["type"], "identity");
        assert_eq!(identity_frame(&identity)["identity"]["role"], "observer");
        assert_eq!(error_frame("x")["type"], "error");
        assert_eq!(cli_connected_frame("acp")["adapter"], "acp");
        assert_eq!(
            permission_cancelled_frame(&json!("r1"))["request_id"],
            "r1"
        );
        assert_eq!(
            slash_command_result_frame("/x", "r", "out", "cli")["source"],
            "cli"
        );
    }
}
