// SPDX-License-Identifier: MIT OR Apache-2.0
//! Slash-command routing and passthrough interception, end to end.

mod common;

use serde_json::json;
use std::sync::Arc;

use common::{TestSocket, wait_until};
use swb_adapter::AdapterRegistry;
use swb_adapter::mock::MockAdapter;
use swb_bridge::{AuthContext, BridgeConfig, ConnectBackendOptions, SessionBridge};
use swb_core::{MessageBuilder, MessageType, Role, UnifiedMessage};
use swb_telemetry::RecordingTracer;

struct Harness {
    bridge: SessionBridge,
    adapter: Arc<MockAdapter>,
    tracer: RecordingTracer,
    socket: Arc<TestSocket>,
}

async fn harness(adapter: MockAdapter) -> Harness {
    let adapter = Arc::new(adapter);
    let mut registry = AdapterRegistry::new();
    registry.register(Arc::clone(&adapter) as Arc<dyn swb_adapter::BackendAdapter>);
    let tracer = RecordingTracer::new();
    let bridge = SessionBridge::new(
        Arc::new(registry),
        BridgeConfig {
            default_adapter: "mock".into(),
            ..Default::default()
        },
    )
    .with_tracer(Arc::new(tracer.clone()));

    let socket = TestSocket::new("c-1");
    bridge
        .handle_consumer_open("s-1", socket.clone(), AuthContext::default())
        .await;
    bridge
        .connect_backend("s-1", ConnectBackendOptions::default())
        .await
        .expect("connect");
    Harness {
        bridge,
        adapter,
        tracer,
        socket,
    }
}

async fn send_slash(h: &Harness, command: &str, request_id: &str) {
    h.bridge
        .handle_consumer_message(
            "s-1",
            "c-1",
            &json!({"type": "slash_command", "command": command, "request_id": request_id})
                .to_string(),
        )
        .await;
}

fn result_message(field: &str) -> UnifiedMessage {
    MessageBuilder::new(MessageType::Result, Role::System)
        .meta("is_error", json!(false))
        .meta("result", json!(field))
        .build()
}

fn delta_message(text: &str) -> UnifiedMessage {
    MessageBuilder::new(MessageType::StreamEvent, Role::Assistant)
        .meta(
            "event",
            json!({
                "type": "content_block_delta",
                "delta": {"type": "text_delta", "text": text},
            }),
        )
        .build()
}

#[tokio::test]
async fn local_help_is_emulated() {
    let h = harness(MockAdapter::named("mock")).await;
    send_slash(&h, "/help", "req-1").await;

    let results = h.socket.frames_of_type("slash_command_result");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["source"], "emulated");
    assert_eq!(results[0]["request_id"], "req-1");
    assert!(results[0]["content"].as_str().unwrap().contains("/help"));

    // Nothing was forwarded.
    let handle = h.adapter.last_connection().expect("handle");
    assert!(handle.sent().is_empty());
}

#[tokio::test]
async fn empty_context_passthrough_errors() {
    let h = harness(MockAdapter::named("mock")).await;
    send_slash(&h, "/context", "req-ctx").await;

    // The command was forwarded as a user message.
    let handle = h.adapter.last_connection().expect("handle");
    wait_until(|| {
        handle
            .sent()
            .iter()
            .any(|m| m.kind == MessageType::UserMessage && m.text_content() == "/context")
    })
    .await;

    // Backend answers with an empty result only.
    handle.emit(result_message("")).await;

    wait_until(|| !h.socket.frames_of_type("slash_command_error").is_empty()).await;
    let errors = h.socket.frames_of_type("slash_command_error");
    assert_eq!(errors[0]["command"], "/context");
    assert_eq!(errors[0]["request_id"], "req-ctx");
    assert_eq!(
        errors[0]["error"],
        "Pending passthrough \"/context\" produced empty output"
    );

    let summaries = h.tracer.of_type("slash_decision_summary");
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].ctx.outcome.as_deref(), Some("empty_result"));
    assert_eq!(summaries[0].body["matched_path"], "none");
}

#[tokio::test]
async fn stream_buffer_path_produces_result() {
    let h = harness(MockAdapter::named("mock")).await;
    send_slash(&h, "/context", "req-ctx").await;

    let handle = h.adapter.last_connection().expect("handle");
    wait_until(|| !handle.sent().is_empty()).await;

    handle
        .emit(delta_message("Context Usage\nTokens: 43.5k / 200k (22%)"))
        .await;
    handle.emit(result_message("")).await;

    wait_until(|| !h.socket.frames_of_type("slash_command_result").is_empty()).await;
    let results = h.socket.frames_of_type("slash_command_result");
    assert_eq!(results[0]["command"], "/context");
    assert_eq!(
        results[0]["content"],
        "Context Usage\nTokens: 43.5k / 200k (22%)"
    );
    assert_eq!(results[0]["source"], "cli");

    let summaries = h.tracer.of_type("slash_decision_summary");
    assert_eq!(summaries[0].body["matched_path"], "stream_buffer");
    assert_eq!(summaries[0].ctx.outcome.as_deref(), Some("success"));
}

#[tokio::test]
async fn result_field_path_wins_over_buffer() {
    let h = harness(MockAdapter::named("mock")).await;
    send_slash(&h, "/usage", "req-1").await;
    let handle = h.adapter.last_connection().expect("handle");
    wait_until(|| !handle.sent().is_empty()).await;

    handle.emit(delta_message("ignored buffer")).await;
    handle.emit(result_message("final output")).await;

    wait_until(|| !h.socket.frames_of_type("slash_command_result").is_empty()).await;
    let results = h.socket.frames_of_type("slash_command_result");
    assert_eq!(results[0]["content"], "final output");

    let summaries = h.tracer.of_type("slash_decision_summary");
    assert_eq!(summaries[0].body["matched_path"], "result_field");
}

#[tokio::test]
async fn claimed_echo_suppresses_and_resolves() {
    let h = harness(MockAdapter::named("mock").echo_capable()).await;
    send_slash(&h, "/status", "req-1").await;
    let handle = h.adapter.last_connection().expect("handle");
    wait_until(|| !handle.sent().is_empty()).await;

    let raw = json!({
        "type": "user",
        "message": {"content": "<local-command-stdout>All systems go</local-command-stdout>"},
    });
    let claimed = handle.present_user_echo(&raw).await;
    assert!(claimed, "handler claims the echo while a command is pending");

    wait_until(|| !h.socket.frames_of_type("slash_command_result").is_empty()).await;
    let results = h.socket.frames_of_type("slash_command_result");
    assert_eq!(results[0]["content"], "All systems go");
    assert_eq!(results[0]["source"], "cli");

    // The echo never surfaced as a canonical user message.
    assert!(h.socket.frames_of_type("user_message").is_empty());

    let summaries = h.tracer.of_type("slash_decision_summary");
    assert_eq!(summaries[0].body["matched_path"], "intercepted_user_echo");
    assert_eq!(
        summaries[0].ctx.outcome.as_deref(),
        Some("intercepted_user_echo")
    );
}

#[tokio::test]
async fn unclaimed_echo_flows_to_consumers() {
    let h = harness(MockAdapter::named("mock").echo_capable()).await;
    let handle = h.adapter.last_connection().expect("handle");

    // No pending passthrough: the handler declines and the echo is
    // translated like any other backend message.
    let raw = json!({"type": "user", "message": {"content": "plain echo"}});
    let claimed = handle.present_user_echo(&raw).await;
    assert!(!claimed);

    wait_until(|| !h.socket.frames_of_type("user_message").is_empty()).await;
}

#[tokio::test]
async fn executor_services_supported_commands() {
    let h = harness(MockAdapter::named("mock").with_slash_executor(&["context"])).await;
    send_slash(&h, "/context", "req-1").await;

    wait_until(|| !h.socket.frames_of_type("slash_command_result").is_empty()).await;
    let results = h.socket.frames_of_type("slash_command_result");
    assert_eq!(results[0]["content"], "executed /context");
    assert_eq!(results[0]["source"], "cli");

    // Nothing went through the forwarding path.
    let handle = h.adapter.last_connection().expect("handle");
    assert!(
        handle
            .sent()
            .iter()
            .all(|m| m.kind != MessageType::UserMessage)
    );
}

#[tokio::test]
async fn backend_loss_cancels_pending_passthroughs() {
    let h = harness(MockAdapter::named("mock")).await;
    send_slash(&h, "/context", "req-1").await;
    let handle = h.adapter.last_connection().expect("handle");
    wait_until(|| !handle.sent().is_empty()).await;

    handle.fail("backend blew up").await;

    wait_until(|| !h.socket.frames_of_type("slash_command_error").is_empty()).await;
    let summaries = h.tracer.of_type("slash_decision_summary");
    assert_eq!(summaries[0].ctx.outcome.as_deref(), Some("backend_error"));
}

#[tokio::test]
async fn concurrent_permission_request_is_not_contaminated() {
    let h = harness(MockAdapter::named("mock")).await;
    send_slash(&h, "/context", "req-1").await;
    let handle = h.adapter.last_connection().expect("handle");
    wait_until(|| !handle.sent().is_empty()).await;

    // A permission request arrives while the passthrough is pending.
    handle
        .emit(
            MessageBuilder::new(MessageType::PermissionRequest, Role::System)
                .meta("request_id", json!("p-1"))
                .meta("tool_name", json!("Bash"))
                .build(),
        )
        .await;
    wait_until(|| !h.socket.frames_of_type("permission_request").is_empty()).await;

    // Still pending; the eventual result resolves normally.
    handle.emit(result_message("ctx")).await;
    wait_until(|| !h.socket.frames_of_type("slash_command_result").is_empty()).await;
    let results = h.socket.frames_of_type("slash_command_result");
    assert_eq!(results[0]["content"], "ctx");
}

#[tokio::test]
async fn each_forwarded_command_resolves_exactly_once() {
    let h = harness(MockAdapter::named("mock")).await;
    send_slash(&h, "/one", "req-1").await;
    send_slash(&h, "/two", "req-2").await;
    let handle = h.adapter.last_connection().expect("handle");
    wait_until(|| handle.sent().len() >= 2).await;

    handle.emit(result_message("first")).await;
    handle.emit(result_message("second")).await;

    wait_until(|| h.socket.frames_of_type("slash_command_result").len() == 2).await;
    let results = h.socket.frames_of_type("slash_command_result");
    assert_eq!(results[0]["request_id"], "req-1");
    assert_eq!(results[0]["content"], "first");
    assert_eq!(results[1]["request_id"], "req-2");
    assert_eq!(results[1]["content"], "second");
    assert!(h.socket.frames_of_type("slash_command_error").is_empty());
}
