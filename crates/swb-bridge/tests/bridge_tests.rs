// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bridge behavior: consumer plane, buffering, permissions, lifecycle.

mod common;

use serde_json::{Value, json};
use std::sync::Arc;

use common::{StallingAuth, StaticAuth, TestSocket, wait_until};
use swb_adapter::AdapterRegistry;
use swb_adapter::mock::MockAdapter;
use swb_bridge::{
    AuthContext, BridgeConfig, ConnectBackendOptions, ConsumerRole, Identity, SessionBridge,
};
use swb_core::{MessageBuilder, MessageType, Role, UnifiedMessage};

fn bridge_with(adapter: Arc<MockAdapter>) -> SessionBridge {
    let mut registry = AdapterRegistry::new();
    registry.register(adapter);
    SessionBridge::new(
        Arc::new(registry),
        BridgeConfig {
            default_adapter: "mock".into(),
            ..Default::default()
        },
    )
}

async fn open_participant(bridge: &SessionBridge, session: &str, socket_id: &str) -> Arc<TestSocket> {
    let socket = TestSocket::new(socket_id);
    bridge
        .handle_consumer_open(session, socket.clone(), AuthContext::default())
        .await;
    socket
}

#[tokio::test]
async fn open_sends_identity_then_session_init() {
    let bridge = bridge_with(Arc::new(MockAdapter::named("mock")));
    let socket = open_participant(&bridge, "s-1", "c-1").await;

    let sent = socket.sent();
    assert_eq!(sent[0]["type"], "identity");
    assert_eq!(sent[0]["identity"]["role"], "participant");
    assert_eq!(sent[1]["type"], "session_init");
    assert_eq!(sent[1]["session_id"], "s-1");
}

#[tokio::test]
async fn observer_cannot_send_user_messages() {
    let adapter = Arc::new(MockAdapter::named("mock"));
    let bridge = bridge_with(Arc::clone(&adapter)).with_authenticator(Arc::new(StaticAuth {
        identity: Identity {
            subject: "watcher".into(),
            role: ConsumerRole::Observer,
        },
    }));
    bridge
        .connect_backend("s-1", ConnectBackendOptions::default())
        .await
        .expect("connect");

    let socket = TestSocket::new("c-obs");
    bridge
        .handle_consumer_open("s-1", socket.clone(), AuthContext::default())
        .await;

    bridge
        .handle_consumer_message("s-1", "c-obs", r#"{"type":"user_message","content":"hi"}"#)
        .await;

    // The backend observed nothing.
    let handle = adapter.last_connection().expect("handle");
    assert!(handle.sent().is_empty());

    // The socket received the exact rejection.
    let errors = socket.frames_of_type("error");
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0]["message"],
        "Observers cannot send user_message messages"
    );
}

#[tokio::test]
async fn observer_may_query_presence() {
    let bridge = bridge_with(Arc::new(MockAdapter::named("mock"))).with_authenticator(Arc::new(
        StaticAuth {
            identity: Identity {
                subject: "watcher".into(),
                role: ConsumerRole::Observer,
            },
        },
    ));
    let socket = TestSocket::new("c-obs");
    bridge
        .handle_consumer_open("s-1", socket.clone(), AuthContext::default())
        .await;
    bridge
        .handle_consumer_message("s-1", "c-obs", r#"{"type":"presence_query"}"#)
        .await;

    let presence = socket.frames_of_type("presence");
    assert_eq!(presence.len(), 1);
    assert_eq!(presence[0]["consumers"][0]["role"], "observer");
}

#[tokio::test]
async fn unregistered_socket_messages_are_dropped_silently() {
    let adapter = Arc::new(MockAdapter::named("mock"));
    let bridge = bridge_with(Arc::clone(&adapter));
    bridge.get_or_create_session("s-1");
    bridge
        .connect_backend("s-1", ConnectBackendOptions::default())
        .await
        .expect("connect");

    bridge
        .handle_consumer_message("s-1", "ghost", r#"{"type":"user_message","content":"x"}"#)
        .await;
    let handle = adapter.last_connection().expect("handle");
    assert!(handle.sent().is_empty());
}

#[tokio::test]
async fn auth_timeout_closes_with_4001() {
    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(MockAdapter::named("mock")));
    let bridge = SessionBridge::new(
        Arc::new(registry),
        BridgeConfig {
            default_adapter: "mock".into(),
            auth_timeout: std::time::Duration::from_millis(50),
            ..Default::default()
        },
    )
    .with_authenticator(Arc::new(StallingAuth));

    let socket = TestSocket::new("c-1");
    bridge
        .handle_consumer_open("s-1", socket.clone(), AuthContext::default())
        .await;

    let (code, reason) = socket.closed_with().expect("closed");
    assert_eq!(code, 4001);
    assert_eq!(reason, "Authentication failed");
}

#[tokio::test]
async fn messages_buffer_fifo_until_backend_binds() {
    let adapter = Arc::new(MockAdapter::named("mock"));
    let bridge = bridge_with(Arc::clone(&adapter));
    let _socket = open_participant(&bridge, "s-1", "c-1").await;

    for text in ["one", "two", "three"] {
        bridge
            .handle_consumer_message(
                "s-1",
                "c-1",
                &json!({"type": "user_message", "content": text}).to_string(),
            )
            .await;
    }

    bridge
        .connect_backend("s-1", ConnectBackendOptions::default())
        .await
        .expect("connect");

    let handle = adapter.last_connection().expect("handle");
    let texts: Vec<String> = handle
        .sent()
        .iter()
        .filter(|m| m.kind == MessageType::UserMessage)
        .map(UnifiedMessage::text_content)
        .collect();
    assert_eq!(texts, vec!["one", "two", "three"]);
}

#[tokio::test]
async fn fan_out_preserves_backend_order() {
    let adapter = Arc::new(MockAdapter::named("mock"));
    let bridge = bridge_with(Arc::clone(&adapter));
    let socket = open_participant(&bridge, "s-1", "c-1").await;
    bridge
        .connect_backend("s-1", ConnectBackendOptions::default())
        .await
        .expect("connect");

    let handle = adapter.last_connection().expect("handle");
    for i in 0..10 {
        handle
            .emit(UnifiedMessage::assistant_text(format!("msg-{i}")))
            .await;
    }

    wait_until(|| socket.frames_of_type("assistant").len() == 10).await;
    let texts: Vec<String> = socket
        .frames_of_type("assistant")
        .iter()
        .map(|v| v["content"][0]["text"].as_str().unwrap_or("").to_string())
        .collect();
    let expected: Vec<String> = (0..10).map(|i| format!("msg-{i}")).collect();
    assert_eq!(texts, expected);
}

#[tokio::test]
async fn permission_cancelled_reaches_participants_only() {
    let adapter = Arc::new(MockAdapter::named("mock"));
    let bridge =
        bridge_with(Arc::clone(&adapter)).with_authenticator(Arc::new(common::QueryRoleAuth));

    let participant = TestSocket::new("c-p");
    bridge
        .handle_consumer_open("s-1", participant.clone(), common::auth_as("participant"))
        .await;
    let observer = TestSocket::new("c-o");
    bridge
        .handle_consumer_open("s-1", observer.clone(), common::auth_as("observer"))
        .await;

    bridge
        .connect_backend("s-1", ConnectBackendOptions::default())
        .await
        .expect("connect");
    let handle = adapter.last_connection().expect("handle");

    let request = MessageBuilder::new(MessageType::PermissionRequest, Role::System)
        .meta("request_id", json!("r1"))
        .meta("tool_name", json!("Bash"))
        .meta("input", json!({"command": "ls"}))
        .build();
    handle.emit(request).await;
    wait_until(|| !participant.frames_of_type("permission_request").is_empty()).await;
    // The request itself fans out to everyone.
    wait_until(|| !observer.frames_of_type("permission_request").is_empty()).await;

    // Backend dies with the permission pending.
    handle.finish();
    wait_until(|| !participant.frames_of_type("permission_cancelled").is_empty()).await;
    let cancelled = participant.frames_of_type("permission_cancelled");
    assert_eq!(cancelled[0]["request_id"], "r1");

    // The observer never sees the cancellation.
    assert!(observer.frames_of_type("permission_cancelled").is_empty());
}

#[tokio::test]
async fn disconnect_backend_clears_session_state() {
    let adapter = Arc::new(MockAdapter::named("mock"));
    let bridge = bridge_with(Arc::clone(&adapter));
    let _socket = open_participant(&bridge, "s-1", "c-1").await;
    bridge
        .connect_backend("s-1", ConnectBackendOptions::default())
        .await
        .expect("connect");

    let handle = adapter.last_connection().expect("handle");
    let init = MessageBuilder::new(MessageType::SessionInit, Role::System)
        .meta("session_id", json!("be-9"))
        .build();
    handle.emit(init).await;
    let request = MessageBuilder::new(MessageType::PermissionRequest, Role::System)
        .meta("request_id", json!("r1"))
        .build();
    handle.emit(request).await;

    let session = bridge.session("s-1").expect("session");
    wait_until(|| session.cli_connected()).await;
    loop {
        if session.core.lock().await.backend_session_id.is_some() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    bridge.disconnect_backend("s-1").await;

    let core = session.core.lock().await;
    assert!(core.backend.is_none());
    assert!(core.backend_session_id.is_none());
    drop(core);
    assert!(session.pending_permissions_empty());
    assert_eq!(session.consumer_identities().len(), 1);
    assert!(!session.cli_connected());
}

#[tokio::test]
async fn post_close_sends_are_refused() {
    let adapter = Arc::new(MockAdapter::named("mock"));
    let bridge = bridge_with(Arc::clone(&adapter));
    let _socket = open_participant(&bridge, "s-1", "c-1").await;
    bridge
        .connect_backend("s-1", ConnectBackendOptions::default())
        .await
        .expect("connect");
    bridge.close_session("s-1").await;

    // Binding again is refused.
    let err = bridge
        .connect_backend("s-1", ConnectBackendOptions::default())
        .await;
    assert!(err.is_err());

    // And buffered sends are dropped.
    bridge
        .send_to_backend("s-1", UnifiedMessage::user_text("late"))
        .await;
    let session = bridge.session("s-1").expect("session");
    assert!(session.core.lock().await.pending_messages.is_empty());
}

#[tokio::test]
async fn capabilities_handshake_round_trip() {
    let adapter = Arc::new(MockAdapter::named("mock"));
    let bridge = bridge_with(Arc::clone(&adapter));
    let socket = open_participant(&bridge, "s-1", "c-1").await;
    bridge
        .connect_backend("s-1", ConnectBackendOptions::default())
        .await
        .expect("connect");

    let handle = adapter.last_connection().expect("handle");
    handle
        .emit(
            MessageBuilder::new(MessageType::SessionInit, Role::System)
                .meta("session_id", json!("be-1"))
                .meta("model", json!("m-1"))
                .build(),
        )
        .await;

    // The bridge issues exactly one control request.
    wait_until(|| {
        handle
            .sent()
            .iter()
            .any(|m| m.meta_str("control") == Some("initialize"))
    })
    .await;
    handle
        .emit(
            MessageBuilder::new(MessageType::SessionInit, Role::System)
                .meta("session_id", json!("be-1"))
                .build(),
        )
        .await;
    // One bridge frame from open plus two relayed canonical envelopes.
    wait_until(|| socket.frames_of_type("session_init").len() >= 3).await;
    let control_requests = handle
        .sent()
        .iter()
        .filter(|m| m.meta_str("control") == Some("initialize"))
        .count();
    assert_eq!(control_requests, 1, "handshake is deduplicated");

    handle
        .emit(
            MessageBuilder::new(MessageType::ControlResponse, Role::System)
                .meta("subtype", json!("success"))
                .meta(
                    "response",
                    json!({
                        "commands": [{"name": "compact", "description": "Compact context"}],
                        "models": [{"id": "m-1"}],
                        "account": {"email": "dev@example.com"},
                    }),
                )
                .build(),
        )
        .await;

    wait_until(|| !socket.frames_of_type("capabilities_ready").is_empty()).await;
    let ready = socket.frames_of_type("capabilities_ready");
    assert_eq!(ready[0]["capabilities"]["commands"][0]["name"], "compact");

    // The shared registry learned the CLI command.
    let compact = bridge.slash_registry().get("compact").expect("registered");
    assert_eq!(compact.description, "Compact context");

    // A late joiner replays capabilities on open.
    let late = open_participant(&bridge, "s-1", "c-2").await;
    assert!(!late.frames_of_type("capabilities_ready").is_empty());
}

#[tokio::test]
async fn connect_failure_propagates() {
    let adapter = Arc::new(MockAdapter::named("mock"));
    adapter.fail_next_connect();
    let bridge = bridge_with(Arc::clone(&adapter));
    let err = bridge
        .connect_backend("s-1", ConnectBackendOptions::default())
        .await;
    assert!(err.is_err());
}

#[tokio::test]
async fn unknown_adapter_falls_back_to_default() {
    let adapter = Arc::new(MockAdapter::named("mock"));
    let bridge = bridge_with(Arc::clone(&adapter));
    bridge
        .connect_backend(
            "s-1",
            ConnectBackendOptions {
                adapter_name: Some("definitely-not-registered".into()),
                ..Default::default()
            },
        )
        .await
        .expect("fallback connect");
    assert_eq!(adapter.connections().len(), 1);
}

#[tokio::test]
async fn reconnect_closes_previous_backend() {
    let adapter = Arc::new(MockAdapter::named("mock"));
    let bridge = bridge_with(Arc::clone(&adapter));
    bridge
        .connect_backend("s-1", ConnectBackendOptions::default())
        .await
        .expect("first connect");
    let first = adapter.last_connection().expect("first handle");

    bridge
        .connect_backend("s-1", ConnectBackendOptions::default())
        .await
        .expect("second connect");
    wait_until(|| first.is_closed()).await;
    assert_eq!(adapter.connections().len(), 2);
}
