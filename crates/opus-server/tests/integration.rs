//! End-to-end tests against a real listener using a WebSocket client.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use opus_server::{Frame, GatewayServer};
use opus_settings::ServerSettings;
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn test_settings() -> ServerSettings {
    ServerSettings {
        host: "127.0.0.1".into(),
        port: 0,
        ..ServerSettings::default()
    }
}

/// Boot a server on an ephemeral port and return its WS URL.
async fn boot_with(settings: ServerSettings) -> (String, Arc<GatewayServer>) {
    let server = Arc::new(GatewayServer::new(settings, None));
    let (addr, _handle) = server.listen().await.unwrap();
    (format!("ws://{addr}/ws"), server)
}

async fn boot_server() -> (String, Arc<GatewayServer>) {
    boot_with(test_settings()).await
}

async fn connect(url: &str) -> WsStream {
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

/// Connect and consume the greeting; returns the socket and its session id.
async fn connect_client(url: &str) -> (WsStream, String) {
    let mut ws = connect(url).await;
    let hello = read_json(&mut ws).await;
    assert_eq!(hello["type"], "connected");
    let id = hello["from"].as_str().unwrap().to_string();
    (ws, id)
}

/// Read the next text message as JSON.
async fn read_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream closed")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Round-trip a `ping`; every frame queued for `ws` before the pong is returned.
async fn drain_until_pong(ws: &mut WsStream) -> Vec<Value> {
    send_json(ws, json!({"type": "ping"})).await;
    let mut seen = Vec::new();
    loop {
        let frame = read_json(ws).await;
        if frame["type"] == "pong" {
            return seen;
        }
        seen.push(frame);
    }
}

async fn wait_for_sessions(server: &GatewayServer, expected: usize) {
    timeout(TIMEOUT, async {
        loop {
            if server.hub().stats().await.unwrap().sessions == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session count never reached expected value");
}

/// Wait until the server closes `ws`.
async fn expect_closed(ws: &mut WsStream) {
    timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_) | Ok(Message::Close(_))) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await
    .expect("connection was not closed");
}

#[tokio::test]
async fn greeting_carries_session_id() {
    let (url, server) = boot_server().await;
    let (_ws, id) = connect_client(&url).await;
    assert!(id.starts_with("client_"));
    assert_eq!(server.hub().stats().await.unwrap().sessions, 1);
}

#[tokio::test]
async fn ping_is_answered_only_to_sender() {
    let (url, _server) = boot_server().await;
    let (mut a, _) = connect_client(&url).await;
    let (mut b, _) = connect_client(&url).await;

    send_json(&mut a, json!({"type": "ping"})).await;
    assert_eq!(read_json(&mut a).await, json!({"type": "pong"}));
    assert!(drain_until_pong(&mut b).await.is_empty());
}

#[tokio::test]
async fn channel_chat_reaches_members_only() {
    let (url, _server) = boot_server().await;
    let (mut a, a_id) = connect_client(&url).await;
    let (mut b, _) = connect_client(&url).await;

    send_json(&mut a, json!({"type": "join", "channel": "dairy"})).await;
    send_json(
        &mut a,
        json!({"type": "chat", "channel": "dairy", "from": "forged", "content": "milk low", "data": {"sku": 7}}),
    )
    .await;

    let got = read_json(&mut a).await;
    assert_eq!(got["type"], "chat");
    assert_eq!(got["from"], a_id.as_str());
    assert_eq!(got["content"], "milk low");
    assert_eq!(got["data"], json!({"sku": 7}));

    assert!(drain_until_pong(&mut b).await.is_empty());
}

#[tokio::test]
async fn non_member_chat_is_relayed_under_open_policy() {
    let (url, _server) = boot_server().await;
    let (mut a, _) = connect_client(&url).await;
    let (mut b, b_id) = connect_client(&url).await;

    send_json(&mut a, json!({"type": "join", "channel": "dairy"})).await;
    let _ = drain_until_pong(&mut a).await;

    send_json(&mut b, json!({"type": "chat", "channel": "dairy", "content": "hello"})).await;
    let got = read_json(&mut a).await;
    assert_eq!(got["from"], b_id.as_str());
    assert!(drain_until_pong(&mut b).await.is_empty());
}

#[tokio::test]
async fn members_only_policy_blocks_outsiders() {
    let settings = ServerSettings {
        chat_policy: opus_settings::ChatPolicy::MembersOnly,
        ..test_settings()
    };
    let (url, _server) = boot_with(settings).await;
    let (mut a, _) = connect_client(&url).await;
    let (mut b, _) = connect_client(&url).await;

    send_json(&mut a, json!({"type": "join", "channel": "dairy"})).await;
    let _ = drain_until_pong(&mut a).await;

    send_json(&mut b, json!({"type": "chat", "channel": "dairy", "content": "sneaky"})).await;
    let _ = drain_until_pong(&mut b).await;
    assert!(drain_until_pong(&mut a).await.is_empty());
}

#[tokio::test]
async fn channelless_chat_reaches_everyone() {
    let (url, _server) = boot_server().await;
    let (mut a, a_id) = connect_client(&url).await;
    let (mut b, _) = connect_client(&url).await;

    send_json(&mut a, json!({"type": "chat", "content": "store closing"})).await;
    for ws in [&mut a, &mut b] {
        let got = read_json(ws).await;
        assert_eq!(got["content"], "store closing");
        assert_eq!(got["from"], a_id.as_str());
    }
}

#[tokio::test]
async fn malformed_and_unknown_frames_keep_connection_open() {
    let (url, server) = boot_server().await;
    let (mut a, _) = connect_client(&url).await;

    a.send(Message::Text("{broken".into())).await.unwrap();
    send_json(&mut a, json!({"channel": "no type"})).await;
    send_json(&mut a, json!({"type": "typing"})).await;
    assert!(drain_until_pong(&mut a).await.is_empty());
    assert_eq!(server.hub().stats().await.unwrap().sessions, 1);
}

#[tokio::test]
async fn server_originated_broadcast_reaches_channel() {
    let (url, server) = boot_server().await;
    let (mut a, _) = connect_client(&url).await;
    let (mut b, _) = connect_client(&url).await;

    send_json(&mut a, json!({"type": "join", "channel": "produce"})).await;
    let _ = drain_until_pong(&mut a).await;

    server
        .hub()
        .broadcast(Frame::new("chat").with_channel("produce").with_content("restock aisle 4"))
        .await
        .unwrap();

    let got = read_json(&mut a).await;
    assert_eq!(got["content"], "restock aisle 4");
    assert!(got.get("from").is_none());
    assert!(drain_until_pong(&mut b).await.is_empty());
}

#[tokio::test]
async fn disconnect_unregisters_and_leaves_channels() {
    let (url, server) = boot_server().await;
    let (mut a, _) = connect_client(&url).await;
    let (b, _) = connect_client(&url).await;

    send_json(&mut a, json!({"type": "join", "channel": "dairy"})).await;
    let _ = drain_until_pong(&mut a).await;
    assert_eq!(server.hub().members("dairy").await.unwrap().len(), 1);

    drop(b);
    a.close(None).await.unwrap();
    wait_for_sessions(&server, 0).await;
    assert!(server.hub().members("dairy").await.unwrap().is_empty());
    assert_eq!(server.hub().stats().await.unwrap().channels, 1);
}

#[tokio::test]
async fn disallowed_origin_is_forbidden() {
    let settings = ServerSettings {
        allowed_origins: vec!["https://shop.example".into()],
        ..test_settings()
    };
    let (url, server) = boot_with(settings).await;

    let mut request = url.as_str().into_client_request().unwrap();
    let _ = request
        .headers_mut()
        .insert("Origin", HeaderValue::from_static("https://evil.example"));
    match connect_async(request).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 403),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("upgrade should have been refused"),
    }

    let mut request = url.as_str().into_client_request().unwrap();
    let _ = request
        .headers_mut()
        .insert("Origin", HeaderValue::from_static("https://shop.example"));
    let (_ws, _) = connect_async(request).await.unwrap();
    wait_for_sessions(&server, 1).await;
}

#[tokio::test]
async fn oversized_frame_closes_connection() {
    let settings = ServerSettings {
        max_message_size: 1024,
        ..test_settings()
    };
    let (url, server) = boot_with(settings).await;
    let (mut a, _) = connect_client(&url).await;

    let content = "x".repeat(4096);
    send_json(&mut a, json!({"type": "chat", "content": content})).await;
    expect_closed(&mut a).await;
    wait_for_sessions(&server, 0).await;
}

#[tokio::test]
async fn shutdown_closes_every_client() {
    let server = Arc::new(GatewayServer::new(test_settings(), None));
    let (addr, handle) = server.listen().await.unwrap();
    let url = format!("ws://{addr}/ws");
    let (mut a, _) = connect_client(&url).await;
    let (mut b, _) = connect_client(&url).await;

    server.shutdown().shutdown();
    expect_closed(&mut a).await;
    expect_closed(&mut b).await;

    let served = timeout(TIMEOUT, handle).await.expect("server did not stop");
    assert!(served.unwrap().is_ok());
    let hub_task = server.take_hub_task().unwrap();
    timeout(TIMEOUT, hub_task).await.unwrap().unwrap();
}
