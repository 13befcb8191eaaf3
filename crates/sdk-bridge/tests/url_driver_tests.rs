// SPDX-License-Identifier: MIT OR Apache-2.0
//! Forwarding driver tests with a real TCP peer.

use serde_json::{Value, json};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use sdk_bridge::UrlForwardAdapter;
use swb_adapter::{BackendAdapter, BackendSession, ConnectOptions};
use swb_core::{MessageBuilder, MessageType, Role, UnifiedMessage};

async fn connect_pair() -> (
    Box<dyn swb_adapter::BackendSession>,
    tokio::net::tcp::OwnedReadHalf,
    tokio::net::tcp::OwnedWriteHalf,
) {
    let adapter = UrlForwardAdapter::bind("127.0.0.1:0")
        .await
        .expect("bind")
        .accept_timeout(Duration::from_secs(5));
    let addr = adapter.local_addr().expect("addr");

    let peer = tokio::spawn(async move { TcpStream::connect(addr).await.expect("peer connect") });
    let session = adapter
        .connect(ConnectOptions::new("s-1"))
        .await
        .expect("connect");
    let stream = peer.await.expect("join");
    let (read_half, write_half) = stream.into_split();
    (session, read_half, write_half)
}

#[tokio::test]
async fn inbound_lines_translate_to_canonical() {
    let (mut session, _peer_read, mut peer_write) = connect_pair().await;
    let mut rx = session.take_messages().expect("stream");

    peer_write
        .write_all(
            concat!(
                "{\"type\":\"system\",\"subtype\":\"init\",\"model\":\"m\",\"session_id\":\"ext-1\"}\n",
                "{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"hello\"}]}}\n",
            )
            .as_bytes(),
        )
        .await
        .expect("write");

    let init = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("bounded")
        .unwrap()
        .unwrap();
    assert_eq!(init.kind, MessageType::SessionInit);
    assert_eq!(session.backend_session_id().as_deref(), Some("ext-1"));

    let assistant = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("bounded")
        .unwrap()
        .unwrap();
    assert_eq!(assistant.kind, MessageType::Assistant);
    assert_eq!(assistant.text_content(), "hello");
}

#[tokio::test]
async fn outbound_user_message_is_ndjson() {
    let (session, peer_read, _peer_write) = connect_pair().await;
    session
        .send(UnifiedMessage::user_text("ping"))
        .await
        .expect("send");

    let mut lines = BufReader::new(peer_read).lines();
    let line = timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("bounded")
        .expect("read")
        .expect("line");
    let v: Value = serde_json::from_str(&line).expect("json");
    assert_eq!(v["type"], json!("user"));
    assert_eq!(v["message"]["content"][0]["text"], json!("ping"));
}

#[tokio::test]
async fn raw_lines_forward_verbatim() {
    let (session, peer_read, _peer_write) = connect_pair().await;
    session
        .send_raw("{\"type\":\"custom\",\"x\":1}")
        .expect("send_raw");

    let mut lines = BufReader::new(peer_read).lines();
    let line = timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("bounded")
        .expect("read")
        .expect("line");
    assert_eq!(line, "{\"type\":\"custom\",\"x\":1}");
}

#[tokio::test]
async fn permission_reply_writes_control_response() {
    let (session, peer_read, mut peer_write) = connect_pair().await;

    // External process asks for permission.
    peer_write
        .write_all(
            concat!(
                "{\"type\":\"control_request\",\"request_id\":\"r1\",",
                "\"request\":{\"subtype\":\"can_use_tool\",\"tool_name\":\"Bash\",",
                "\"input\":{\"command\":\"ls\"}}}\n",
            )
            .as_bytes(),
        )
        .await
        .expect("write");

    let mut session = session;
    let mut rx = session.take_messages().expect("stream");
    let request = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("bounded")
        .unwrap()
        .unwrap();
    assert_eq!(request.kind, MessageType::PermissionRequest);
    assert_eq!(request.meta_str("request_id"), Some("r1"));

    let response = MessageBuilder::new(MessageType::PermissionResponse, Role::User)
        .meta("request_id", json!("r1"))
        .meta("behavior", json!("allow"))
        .build();
    session.send(response).await.expect("send");

    let mut lines = BufReader::new(peer_read).lines();
    let line = timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("bounded")
        .expect("read")
        .expect("line");
    let v: Value = serde_json::from_str(&line).expect("json");
    assert_eq!(v["type"], json!("control_response"));
    assert_eq!(v["response"]["request_id"], json!("r1"));
    assert_eq!(v["response"]["response"]["behavior"], json!("allow"));
}

#[tokio::test]
async fn peer_disconnect_ends_stream_cleanly() {
    let (mut session, peer_read, peer_write) = connect_pair().await;
    let mut rx = session.take_messages().expect("stream");
    drop(peer_read);
    drop(peer_write);

    let end = timeout(Duration::from_secs(5), rx.recv()).await.expect("bounded");
    assert!(end.is_none());
}

#[tokio::test]
async fn connect_times_out_without_peer() {
    let adapter = UrlForwardAdapter::bind("127.0.0.1:0")
        .await
        .expect("bind")
        .accept_timeout(Duration::from_millis(200));
    let err = adapter.connect(ConnectOptions::new("s-x")).await;
    assert!(err.is_err());
}
