// SPDX-License-Identifier: MIT OR Apache-2.0
//! Driver tests against a mocked opencode HTTP server.

use std::time::Duration;
use tokio::time::timeout;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use opencode_bridge::OpencodeAdapter;
use swb_adapter::{BackendAdapter, BackendSession, ConnectOptions};
use swb_core::{MessageType, UnifiedMessage};

const EVENT_BODY: &str = concat!(
    "data: {\"type\":\"session.status\",\"properties\":{\"sessionID\":\"oc-1\",\"status\":{\"type\":\"busy\"}}}\n\n",
    "data: {\"type\":\"message.part.delta\",\"properties\":{\"sessionID\":\"oc-1\",\"partID\":\"p-1\",\"field\":\"text\",\"delta\":\"Hel\"}}\n\n",
    "data: {\"type\":\"message.part.delta\",\"properties\":{\"sessionID\":\"oc-1\",\"partID\":\"p-1\",\"field\":\"text\",\"delta\":\"lo\"}}\n\n",
    "data: {\"type\":\"message.updated\",\"properties\":{\"sessionID\":\"oc-1\",\"info\":{\"role\":\"assistant\",\"modelID\":\"m-1\",\"cost\":0.02}}}\n\n",
    "data: {\"type\":\"session.status\",\"properties\":{\"sessionID\":\"oc-1\",\"status\":{\"type\":\"idle\"}}}\n\n",
);

async fn mock_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "oc-1"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/event"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(EVENT_BODY),
        )
        .mount(&server)
        .await;
    server
}

async fn collect_stream(
    rx: &mut swb_adapter::MessageStream,
) -> Vec<swb_core::UnifiedMessage> {
    let mut out = Vec::new();
    timeout(Duration::from_secs(5), async {
        while let Some(item) = rx.recv().await {
            out.push(item.expect("stream error"));
        }
    })
    .await
    .expect("stream ends");
    out
}

#[tokio::test]
async fn full_stream_translates_and_materializes() {
    let server = mock_server().await;
    let adapter = OpencodeAdapter::attach(server.uri());

    let mut session = adapter
        .connect(ConnectOptions::new("s-1"))
        .await
        .expect("connect");
    assert_eq!(session.backend_session_id().as_deref(), Some("oc-1"));

    let mut rx = session.take_messages().expect("stream");
    let msgs = collect_stream(&mut rx).await;

    let kinds: Vec<MessageType> = msgs.iter().map(|m| m.kind).collect();
    assert_eq!(
        kinds,
        vec![
            MessageType::SessionInit,
            MessageType::StatusChange,
            MessageType::StreamEvent,
            MessageType::StreamEvent,
            MessageType::Assistant,
            MessageType::StatusChange,
        ]
    );

    let assistant = &msgs[4];
    assert_eq!(assistant.text_content(), "Hello");
    assert_eq!(assistant.meta_str("model"), Some("m-1"));

    assert_eq!(msgs[1].meta_str("status"), Some("running"));
    assert_eq!(msgs[5].meta_str("status"), Some("idle"));
}

#[tokio::test]
async fn prompt_posts_to_prompt_async() {
    let server = mock_server().await;
    Mock::given(method("POST"))
        .and(path("/session/oc-1/prompt_async"))
        .and(body_partial_json(
            serde_json::json!({"parts": [{"type": "text", "text": "Hello agent"}]}),
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = OpencodeAdapter::attach(server.uri());
    let session = adapter
        .connect(ConnectOptions::new("s-1"))
        .await
        .expect("connect");

    session
        .send(UnifiedMessage::user_text("Hello agent"))
        .await
        .expect("send");
    // Expectation verified when `server` drops.
}

#[tokio::test]
async fn interrupt_posts_abort() {
    let server = mock_server().await;
    Mock::given(method("POST"))
        .and(path("/session/oc-1/abort"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = OpencodeAdapter::attach(server.uri());
    let session = adapter
        .connect(ConnectOptions::new("s-1"))
        .await
        .expect("connect");

    let interrupt =
        swb_core::MessageBuilder::new(MessageType::Interrupt, swb_core::Role::User).build();
    session.send(interrupt).await.expect("send");
}

#[tokio::test]
async fn permission_reply_maps_behavior() {
    let server = mock_server().await;
    Mock::given(method("POST"))
        .and(path("/session/oc-1/permission/perm-9"))
        .and(body_partial_json(serde_json::json!({"response": "once"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = OpencodeAdapter::attach(server.uri());
    let session = adapter
        .connect(ConnectOptions::new("s-1"))
        .await
        .expect("connect");

    let response =
        swb_core::MessageBuilder::new(MessageType::PermissionResponse, swb_core::Role::User)
            .meta("request_id", serde_json::json!("perm-9"))
            .meta("behavior", serde_json::json!("allow"))
            .build();
    session.send(response).await.expect("send");
}

#[tokio::test]
async fn resume_skips_session_creation() {
    let server = MockServer::start().await;
    // No POST /session mock mounted: creation would 404.
    Mock::given(method("GET"))
        .and(path("/event"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(""),
        )
        .mount(&server)
        .await;

    let adapter = OpencodeAdapter::attach(server.uri());
    let mut opts = ConnectOptions::new("s-1");
    opts.resume = Some("oc-resumed".into());
    let session = adapter.connect(opts).await.expect("connect");
    assert_eq!(session.backend_session_id().as_deref(), Some("oc-resumed"));
}

#[tokio::test]
async fn failed_session_create_propagates() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let adapter = OpencodeAdapter::attach(server.uri());
    assert!(adapter.connect(ConnectOptions::new("s-1")).await.is_err());
}
