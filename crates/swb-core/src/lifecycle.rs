// SPDX-License-Identifier: MIT OR Apache-2.0
//! Session lifecycle state machine.
//!
//! Transitions are driven from three directions: explicit lifecycle signals
//! (backend bind/loss, close), inbound consumer messages, and translated
//! backend messages. All three funnel through the same allowed-edge set;
//! a proposal that is not a valid edge is discarded.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{MessageType, UnifiedMessage};

/// Where a session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Created, backend not yet requested.
    Starting,
    /// Backend connect in flight.
    AwaitingBackend,
    /// Backend bound and working.
    Active,
    /// Backend bound, no turn in flight.
    Idle,
    /// Backend lost; reconnect possible.
    Degraded,
    /// Teardown in progress.
    Closing,
    /// Terminal. No transitions out.
    Closed,
}

impl Lifecycle {
    /// Returns `true` if this is the terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// The set of states reachable from `self` in one step.
    #[must_use]
    pub fn valid_transitions(&self) -> &'static [Lifecycle] {
        match self {
            Self::Starting => &[Self::AwaitingBackend, Self::Degraded, Self::Closing],
            Self::AwaitingBackend => &[Self::Active, Self::Degraded, Self::Closing],
            Self::Active => &[Self::Idle, Self::Degraded, Self::Closing],
            Self::Idle => &[Self::Active, Self::Degraded, Self::Closing],
            Self::Degraded => &[Self::AwaitingBackend, Self::Closing],
            Self::Closing => &[Self::Closed],
            Self::Closed => &[],
        }
    }

    /// Returns `true` if moving from `self` to `next` is a valid edge.
    #[must_use]
    pub fn can_transition_to(&self, next: Lifecycle) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::AwaitingBackend => "awaiting_backend",
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Degraded => "degraded",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Explicit lifecycle signals raised by the bridge and connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleSignal {
    /// A session entry was created.
    SessionCreated,
    /// A backend session was bound.
    BackendConnected,
    /// The backend session ended or errored.
    BackendDisconnected,
    /// Close requested.
    Closing,
    /// Close finished.
    Closed,
}

/// Map an explicit signal to the state it targets from `current`.
///
/// Returns `None` when the signal proposes no valid edge (including signals
/// received in the terminal state).
#[must_use]
pub fn apply_signal(current: Lifecycle, signal: LifecycleSignal) -> Option<Lifecycle> {
    let target = match signal {
        LifecycleSignal::SessionCreated => Lifecycle::Starting,
        LifecycleSignal::BackendConnected => Lifecycle::Active,
        LifecycleSignal::BackendDisconnected => Lifecycle::Degraded,
        LifecycleSignal::Closing => Lifecycle::Closing,
        LifecycleSignal::Closed => Lifecycle::Closed,
    };
    // BackendConnected from starting/degraded passes through awaiting_backend.
    if signal == LifecycleSignal::BackendConnected
        && matches!(current, Lifecycle::Starting | Lifecycle::Degraded)
    {
        return Some(Lifecycle::AwaitingBackend);
    }
    current.can_transition_to(target).then_some(target)
}

/// Map an inbound consumer message to a lifecycle proposal.
///
/// Today a single rule: a `user_message` wakes an idle session.
#[must_use]
pub fn transition_for_consumer_message(
    current: Lifecycle,
    msg: &UnifiedMessage,
) -> Option<Lifecycle> {
    if msg.kind == MessageType::UserMessage && current == Lifecycle::Idle {
        return Some(Lifecycle::Active);
    }
    None
}

/// Map a translated backend message to a lifecycle proposal.
///
/// Rules:
/// - `status_change` with `status: "idle"` → idle
/// - `status_change` with `status: "running" | "compacting"` → active
/// - `result` → idle
/// - `stream_event` whose event is a `message_start` with no
///   `parent_tool_use_id` → active
///
/// Proposals that are not valid edges from `current` are discarded.
#[must_use]
pub fn transition_for_backend_message(
    current: Lifecycle,
    msg: &UnifiedMessage,
) -> Option<Lifecycle> {
    let target = match msg.kind {
        MessageType::StatusChange => match msg.meta_str("status") {
            Some("idle") => Some(Lifecycle::Idle),
            Some("running") | Some("compacting") => Some(Lifecycle::Active),
            _ => None,
        },
        MessageType::Result => Some(Lifecycle::Idle),
        MessageType::StreamEvent => {
            let event = msg.metadata.get("event");
            let is_message_start = event
                .and_then(|e| e.get("type"))
                .and_then(serde_json::Value::as_str)
                == Some("message_start");
            let has_parent = event
                .and_then(|e| e.get("parent_tool_use_id"))
                .is_some_and(|v| !v.is_null());
            (is_message_start && !has_parent).then_some(Lifecycle::Active)
        }
        _ => None,
    }?;

    if target == current {
        return None;
    }
    current.can_transition_to(target).then_some(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MessageBuilder, Role};
    use serde_json::json;

    #[test]
    fn enumerated_edges_hold() {
        assert!(Lifecycle::Starting.can_transition_to(Lifecycle::AwaitingBackend));
        assert!(Lifecycle::AwaitingBackend.can_transition_to(Lifecycle::Active));
        assert!(Lifecycle::Active.can_transition_to(Lifecycle::Idle));
        assert!(Lifecycle::Idle.can_transition_to(Lifecycle::Active));
        assert!(Lifecycle::Degraded.can_transition_to(Lifecycle::AwaitingBackend));
        assert!(Lifecycle::Closing.can_transition_to(Lifecycle::Closed));
    }

    #[test]
    fn closed_is_terminal() {
        assert!(Lifecycle::Closed.is_terminal());
        assert!(Lifecycle::Closed.valid_transitions().is_empty());
        assert!(!Lifecycle::Closed.can_transition_to(Lifecycle::Starting));
    }

    #[test]
    fn invalid_edges_rejected() {
        assert!(!Lifecycle::Starting.can_transition_to(Lifecycle::Idle));
        assert!(!Lifecycle::Degraded.can_transition_to(Lifecycle::Active));
        assert!(!Lifecycle::Idle.can_transition_to(Lifecycle::Starting));
    }

    #[test]
    fn backend_connected_routes_through_awaiting() {
        assert_eq!(
            apply_signal(Lifecycle::Starting, LifecycleSignal::BackendConnected),
            Some(Lifecycle::AwaitingBackend)
        );
        assert_eq!(
            apply_signal(Lifecycle::Degraded, LifecycleSignal::BackendConnected),
            Some(Lifecycle::AwaitingBackend)
        );
        assert_eq!(
            apply_signal(Lifecycle::AwaitingBackend, LifecycleSignal::BackendConnected),
            Some(Lifecycle::Active)
        );
    }

    #[test]
    fn signals_in_closed_are_discarded() {
        for signal in [
            LifecycleSignal::SessionCreated,
            LifecycleSignal::BackendConnected,
            LifecycleSignal::BackendDisconnected,
            LifecycleSignal::Closing,
            LifecycleSignal::Closed,
        ] {
            assert_eq!(apply_signal(Lifecycle::Closed, signal), None);
        }
    }

    #[test]
    fn user_message_wakes_idle_session() {
        let msg = crate::UnifiedMessage::user_text("hi");
        assert_eq!(
            transition_for_consumer_message(Lifecycle::Idle, &msg),
            Some(Lifecycle::Active)
        );
        assert_eq!(transition_for_consumer_message(Lifecycle::Active, &msg), None);
    }

    #[test]
    fn status_change_drives_lifecycle() {
        let idle = MessageBuilder::new(MessageType::StatusChange, Role::System)
            .meta("status", json!("idle"))
            .build();
        let busy = MessageBuilder::new(MessageType::StatusChange, Role::System)
            .meta("status", json!("running"))
            .build();
        assert_eq!(
            transition_for_backend_message(Lifecycle::Active, &idle),
            Some(Lifecycle::Idle)
        );
        assert_eq!(
            transition_for_backend_message(Lifecycle::Idle, &busy),
            Some(Lifecycle::Active)
        );
    }

    #[test]
    fn result_proposes_idle() {
        let result = MessageBuilder::new(MessageType::Result, Role::System).build();
        assert_eq!(
            transition_for_backend_message(Lifecycle::Active, &result),
            Some(Lifecycle::Idle)
        );
        // Already idle: no-op.
        assert_eq!(transition_for_backend_message(Lifecycle::Idle, &result), None);
    }

    #[test]
    fn message_start_without_parent_activates() {
        let top_level = MessageBuilder::new(MessageType::StreamEvent, Role::Assistant)
            .meta("event", json!({"type": "message_start"}))
            .build();
        let nested = MessageBuilder::new(MessageType::StreamEvent, Role::Assistant)
            .meta(
                "event",
                json!({"type": "message_start", "parent_tool_use_id": "t-1"}),
            )
            .build();
        assert_eq!(
            transition_for_backend_message(Lifecycle::Idle, &top_level),
            Some(Lifecycle::Active)
        );
        assert_eq!(transition_for_backend_message(Lifecycle::Idle, &nested), None);
    }

    #[test]
    fn proposals_respect_edge_set() {
        // Degraded cannot go idle even though a result proposes it.
        let result = MessageBuilder::new(MessageType::Result, Role::System).build();
        assert_eq!(transition_for_backend_message(Lifecycle::Degraded, &result), None);
    }
}
