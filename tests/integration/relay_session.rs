//! End-to-end relay session tests.
//!
//! Each test starts a real in-process relay server and drives it with
//! `tokio-tungstenite` WebSocket clients speaking the JSON wire protocol,
//! covering the full register / join / route / depart lifecycle plus the
//! room provisioning endpoint.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_tungstenite::tungstenite;

type WsClient =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Start the relay server in-process on an OS-assigned port.
async fn start_relay() -> std::net::SocketAddr {
    let (addr, _handle) = pqchat_relay::relay::start_server("127.0.0.1:0")
        .await
        .expect("failed to start relay server");
    addr
}

async fn connect(addr: std::net::SocketAddr) -> WsClient {
    let url = format!("ws://{addr}/ws");
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("failed to connect");
    ws
}

async fn send_frame(ws: &mut WsClient, frame: &Value) {
    ws.send(tungstenite::Message::Text(frame.to_string().into()))
        .await
        .expect("failed to send frame");
}

/// Receive the next JSON frame, skipping protocol-level ping/pong.
async fn recv_frame(ws: &mut WsClient) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .expect("WebSocket error");
        match msg {
            tungstenite::Message::Text(text) => {
                return serde_json::from_str(text.as_str()).expect("invalid JSON frame");
            }
            tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) => {}
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

/// Assert that no frame arrives within a short window.
async fn assert_silent(ws: &mut WsClient) {
    let result = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
    assert!(result.is_err(), "expected silence, got {result:?}");
}

/// Connect a client and register it under the given id.
async fn connect_and_register(addr: std::net::SocketAddr, client_id: &str, key: &[u8]) -> WsClient {
    let mut ws = connect(addr).await;
    send_frame(
        &mut ws,
        &json!({"type": "register", "clientId": client_id, "kyberPublicKey": key}),
    )
    .await;
    let reply = recv_frame(&mut ws).await;
    assert_eq!(reply["type"], "registered");
    assert_eq!(reply["clientId"], client_id);
    ws
}

/// Register, join a room, and swallow the `room_joined` confirmation.
async fn join_room(ws: &mut WsClient, room_id: &str) -> Value {
    send_frame(
        ws,
        &json!({"type": "join_room", "roomId": room_id, "authToken": "x"}),
    )
    .await;
    let reply = recv_frame(ws).await;
    assert_eq!(reply["type"], "room_joined");
    reply
}

#[tokio::test]
async fn full_session_scenario() {
    let addr = start_relay().await;

    // Alice registers; the confirmation is her only reply.
    let mut alice = connect_and_register(addr, "alice", &[1, 2, 3]).await;

    // Bob registers with his own id.
    let mut bob = connect_and_register(addr, "bob", &[4, 5, 6]).await;

    // Alice joins r1 and sees only herself in the member list.
    let joined = join_room(&mut alice, "r1").await;
    assert_eq!(joined["roomId"], "r1");
    assert_eq!(joined["users"], json!([{"id": "alice", "publicKey": [1, 2, 3]}]));

    // Bob joins the same room and sees both members.
    let joined = join_room(&mut bob, "r1").await;
    let users = joined["users"].as_array().expect("users array");
    assert_eq!(users.len(), 2);

    // Alice is notified of bob's arrival, key material included.
    let notice = recv_frame(&mut alice).await;
    assert_eq!(notice["type"], "user_joined");
    assert_eq!(notice["userId"], "bob");
    assert_eq!(notice["publicKey"], json!([4, 5, 6]));

    // Bob sends a batch addressed to alice and (mistakenly) himself.
    send_frame(
        &mut bob,
        &json!({
            "type": "message",
            "roomId": "r1",
            "timestamp": "2024-01-01T00:00:00.000Z",
            "messages": [
                {"recipientId": "alice", "encryptedData": {"ciphertext": [9], "iv": [1], "salt": [2]}},
                {"recipientId": "bob", "encryptedData": {"ciphertext": [8], "iv": [1], "salt": [2]}}
            ]
        }),
    )
    .await;

    // Only alice receives a message frame; bob gets nothing back.
    let msg = recv_frame(&mut alice).await;
    assert_eq!(msg["type"], "message");
    assert_eq!(msg["senderId"], "bob");
    assert_eq!(msg["encryptedData"], json!({"ciphertext": [9], "iv": [1], "salt": [2]}));
    assert_eq!(msg["timestamp"], "2024-01-01T00:00:00.000Z");
    assert_eq!(msg["publicKey"], json!([4, 5, 6]));
    assert_silent(&mut bob).await;
}

#[tokio::test]
async fn register_without_id_gets_generated_one() {
    let addr = start_relay().await;
    let mut ws = connect(addr).await;

    send_frame(&mut ws, &json!({"type": "register", "kyberPublicKey": [7]})).await;
    let reply = recv_frame(&mut ws).await;
    assert_eq!(reply["type"], "registered");
    let id = reply["clientId"].as_str().expect("clientId string");
    assert!(!id.is_empty());
}

#[tokio::test]
async fn frames_before_registration_are_rejected() {
    let addr = start_relay().await;
    let mut ws = connect(addr).await;

    send_frame(
        &mut ws,
        &json!({"type": "join_room", "roomId": "r1", "authToken": "x"}),
    )
    .await;
    let reply = recv_frame(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["message"], "Not registered");
}

#[tokio::test]
async fn empty_auth_token_is_rejected() {
    let addr = start_relay().await;
    let mut ws = connect_and_register(addr, "alice", &[1]).await;

    send_frame(
        &mut ws,
        &json!({"type": "join_room", "roomId": "r1", "authToken": ""}),
    )
    .await;
    let reply = recv_frame(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["message"], "Invalid room password");
}

#[tokio::test]
async fn malformed_frame_gets_error_and_connection_survives() {
    let addr = start_relay().await;
    let mut ws = connect(addr).await;

    ws.send(tungstenite::Message::Text("{not json".into()))
        .await
        .expect("send failed");
    let reply = recv_frame(&mut ws).await;
    assert_eq!(reply["type"], "error");
    let message = reply["message"].as_str().expect("message string");
    assert!(message.starts_with("Failed to process message:"));

    // The same connection can still register afterwards.
    send_frame(
        &mut ws,
        &json!({"type": "register", "clientId": "alice", "kyberPublicKey": []}),
    )
    .await;
    let reply = recv_frame(&mut ws).await;
    assert_eq!(reply["type"], "registered");
}

#[tokio::test]
async fn key_exchange_routes_point_to_point() {
    let addr = start_relay().await;
    let mut alice = connect_and_register(addr, "alice", &[1]).await;
    let mut bob = connect_and_register(addr, "bob", &[2]).await;

    send_frame(
        &mut alice,
        &json!({"type": "key_exchange", "recipientId": "bob", "publicKey": [10, 20, 30]}),
    )
    .await;

    let forwarded = recv_frame(&mut bob).await;
    assert_eq!(forwarded["type"], "key_exchange");
    assert_eq!(forwarded["senderId"], "alice");
    assert_eq!(forwarded["publicKey"], json!([10, 20, 30]));
    assert_silent(&mut alice).await;
}

#[tokio::test]
async fn key_exchange_to_disconnected_id_is_silently_dropped() {
    let addr = start_relay().await;
    let mut alice = connect_and_register(addr, "alice", &[1]).await;

    send_frame(
        &mut alice,
        &json!({"type": "key_exchange", "recipientId": "gone", "publicKey": [1]}),
    )
    .await;
    assert_silent(&mut alice).await;
}

#[tokio::test]
async fn switching_rooms_announces_departure_to_old_room() {
    let addr = start_relay().await;
    let mut alice = connect_and_register(addr, "alice", &[1]).await;
    let mut bob = connect_and_register(addr, "bob", &[2]).await;

    join_room(&mut alice, "r1").await;
    join_room(&mut bob, "r1").await;
    let _ = recv_frame(&mut alice).await; // user_joined bob

    join_room(&mut alice, "r2").await;

    let notice = recv_frame(&mut bob).await;
    assert_eq!(notice["type"], "user_left");
    assert_eq!(notice["userId"], "alice");
}

#[tokio::test]
async fn disconnect_broadcasts_departure() {
    let addr = start_relay().await;
    let mut alice = connect_and_register(addr, "alice", &[1]).await;
    let mut bob = connect_and_register(addr, "bob", &[2]).await;

    join_room(&mut alice, "r1").await;
    join_room(&mut bob, "r1").await;
    let _ = recv_frame(&mut alice).await; // user_joined bob

    alice.close(None).await.expect("close failed");

    let notice = recv_frame(&mut bob).await;
    assert_eq!(notice["type"], "user_left");
    assert_eq!(notice["userId"], "alice");
}

// --- Room provisioning endpoint ---

/// Minimal HTTP/1.1 POST helper; returns the status code and JSON body.
async fn http_post_json(addr: std::net::SocketAddr, path: &str, body: &Value) -> (u16, Value) {
    let body = body.to_string();
    let request = format!(
        "POST {path} HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let mut stream = tokio::net::TcpStream::connect(addr)
        .await
        .expect("failed to connect");
    stream
        .write_all(request.as_bytes())
        .await
        .expect("failed to write request");

    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .await
        .expect("failed to read response");

    let status: u16 = response
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("missing status code");
    let json_body = response
        .split("\r\n\r\n")
        .nth(1)
        .map(|b| serde_json::from_str(b.trim()).expect("invalid JSON body"))
        .expect("missing body");
    (status, json_body)
}

#[tokio::test]
async fn provisioning_endpoint_validates_and_echoes() {
    let addr = start_relay().await;

    let (status, body) =
        http_post_json(addr, "/api/rooms", &json!({"roomId": "r1", "password": "pw"})).await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({"success": true, "roomId": "r1"}));

    let (status, body) = http_post_json(addr, "/api/rooms", &json!({"roomId": "r1"})).await;
    assert_eq!(status, 400);
    assert_eq!(body, json!({"error": "Room ID and password are required"}));
}
