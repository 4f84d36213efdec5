//! Integration tests for the presence channel.
//!
//! These tests start a real server and connect raw WebSocket clients
//! speaking the JSON presence protocol, verifying registration, cursor
//! broadcast, page moves and cleanup on disconnect.

use futures_util::{SinkExt, StreamExt};
use pagesync_collab::config::ServerConfig;
use pagesync_collab::presence::{user_color, PresenceMessage, PresenceRecord};
use pagesync_collab::server::SyncServer;
use pagesync_collab::storage::FsSessions;
use pagesync_core::SessionId;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

/// Start a server with session `sess1`; returns its presence URL.
async fn start_test_server() -> (Arc<SyncServer>, String, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig::for_testing(dir.path());
    FsSessions::new(&config.sessions_root)
        .create(&SessionId::new("sess1").unwrap())
        .unwrap();

    let server = Arc::new(SyncServer::open(config).unwrap());
    let listener = server.bind().await.unwrap();
    let port = listener.local_addr().unwrap().port();
    {
        let server = server.clone();
        tokio::spawn(async move {
            server.serve(listener).await.unwrap();
        });
    }
    (server, format!("ws://127.0.0.1:{port}/presence/sess1"), dir)
}

async fn connect(url: &str) -> RawSocket {
    tokio_tungstenite::connect_async(url).await.unwrap().0
}

async fn send_json(ws: &mut RawSocket, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

fn user_info(user: &str, filename: &str) -> serde_json::Value {
    json!({
        "type": "user-info",
        "userId": user,
        "userName": user.to_uppercase(),
        "filename": filename,
    })
}

fn cursor(user: &str, filename: &str, position: i64) -> serde_json::Value {
    json!({
        "type": "cursor-update",
        "userId": user,
        "filename": filename,
        "cursorPosition": position,
    })
}

/// Next presence set received on `ws`.
async fn next_presence(ws: &mut RawSocket) -> Vec<PresenceRecord> {
    loop {
        match timeout(WAIT, ws.next()).await.unwrap() {
            Some(Ok(Message::Text(text))) => match PresenceMessage::decode(text.as_str()).unwrap() {
                PresenceMessage::Presence { users } => return users,
                other => panic!("unexpected {other:?}"),
            },
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            other => panic!("expected a presence frame, got {other:?}"),
        }
    }
}

fn ids(users: &[PresenceRecord]) -> Vec<&str> {
    users.iter().map(|u| u.user_id.as_str()).collect()
}

async fn expect_close(ws: &mut RawSocket) -> CloseCode {
    loop {
        match timeout(WAIT, ws.next()).await.unwrap() {
            Some(Ok(Message::Close(Some(frame)))) => return frame.code,
            Some(Ok(_)) => continue,
            other => panic!("expected a close frame, got {other:?}"),
        }
    }
}

// ─── Registration and broadcast ─────────────────────────────────────

#[tokio::test]
async fn test_presence_broadcast_includes_originator() {
    let (_server, url, _dir) = start_test_server().await;
    let mut bob = connect(&url).await;
    let mut alice = connect(&url).await;

    send_json(&mut bob, user_info("bob", "page.hml")).await;
    assert_eq!(ids(&next_presence(&mut bob).await), vec!["bob"]);

    send_json(&mut alice, user_info("alice", "page.hml")).await;
    let seen_by_alice = next_presence(&mut alice).await;
    let seen_by_bob = next_presence(&mut bob).await;
    assert_eq!(ids(&seen_by_alice), vec!["alice", "bob"]);
    assert_eq!(seen_by_alice, seen_by_bob);
    assert_eq!(seen_by_alice[0].user_name, "ALICE");
    assert_eq!(seen_by_alice[0].filename, "page.hml");
}

#[tokio::test]
async fn test_missing_color_is_derived_from_user_id() {
    let (_server, url, _dir) = start_test_server().await;
    let mut ws = connect(&url).await;

    send_json(&mut ws, user_info("carol", "page.hml")).await;
    let users = next_presence(&mut ws).await;
    assert_eq!(users[0].color, user_color("carol"));

    let mut explicit = user_info("dave", "other.hml");
    explicit["color"] = json!("#00ff00");
    let mut other = connect(&url).await;
    send_json(&mut other, explicit).await;
    assert_eq!(next_presence(&mut other).await[0].color, "#00ff00");
}

#[tokio::test]
async fn test_cursor_position_is_not_clamped() {
    let (_server, url, _dir) = start_test_server().await;
    let mut ws = connect(&url).await;
    let mut watcher = connect(&url).await;

    send_json(&mut watcher, user_info("watcher", "page.hml-details")).await;
    next_presence(&mut watcher).await;
    send_json(&mut ws, user_info("u1", "page.hml-details")).await;
    next_presence(&mut ws).await;
    next_presence(&mut watcher).await;

    send_json(&mut ws, cursor("u1", "page.hml-details", 1000)).await;
    let users = next_presence(&mut watcher).await;
    let u1 = users.iter().find(|u| u.user_id == "u1").unwrap();
    assert_eq!(u1.cursor_position, Some(1000));
    assert_eq!(u1.user_name, "U1");
}

#[tokio::test]
async fn test_cursor_update_before_user_info_is_ignored() {
    let (_server, url, _dir) = start_test_server().await;
    let mut ws = connect(&url).await;

    send_json(&mut ws, cursor("u1", "page.hml", 5)).await;
    send_json(&mut ws, user_info("u1", "page.hml")).await;

    let users = next_presence(&mut ws).await;
    assert_eq!(ids(&users), vec!["u1"]);
    assert_eq!(users[0].cursor_position, None);
}

#[tokio::test]
async fn test_cursor_update_for_other_page_moves_registration() {
    let (_server, url, _dir) = start_test_server().await;
    let mut mover = connect(&url).await;
    let mut stayer = connect(&url).await;

    send_json(&mut stayer, user_info("stayer", "a.hml")).await;
    next_presence(&mut stayer).await;
    send_json(&mut mover, user_info("mover", "a.hml")).await;
    next_presence(&mut mover).await;
    assert_eq!(ids(&next_presence(&mut stayer).await), vec!["mover", "stayer"]);

    send_json(&mut mover, cursor("mover", "b.hml", 3)).await;

    assert_eq!(ids(&next_presence(&mut stayer).await), vec!["stayer"]);
    let on_b = next_presence(&mut mover).await;
    assert_eq!(ids(&on_b), vec!["mover"]);
    assert_eq!(on_b[0].filename, "b.hml");
    assert_eq!(on_b[0].user_name, "MOVER");
    assert_eq!(on_b[0].cursor_position, Some(3));
}

// ─── Cleanup ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_closed_connection_leaves_presence() {
    let (server, url, _dir) = start_test_server().await;
    let mut leaver = connect(&url).await;
    let mut stayer = connect(&url).await;

    send_json(&mut stayer, user_info("stayer", "page.hml")).await;
    next_presence(&mut stayer).await;
    send_json(&mut leaver, user_info("leaver", "page.hml")).await;
    next_presence(&mut leaver).await;
    next_presence(&mut stayer).await;

    leaver.close(None).await.unwrap();

    assert_eq!(ids(&next_presence(&mut stayer).await), vec!["stayer"]);
    let name = pagesync_core::DocumentName::parse("sess1/page.hml").unwrap();
    let remaining = server.registry().presence(&name).await;
    assert_eq!(ids(&remaining), vec!["stayer"]);
}

// ─── Malformed frames ───────────────────────────────────────────────

#[tokio::test]
async fn test_malformed_json_closes_with_protocol_code() {
    let (_server, url, _dir) = start_test_server().await;
    let mut ws = connect(&url).await;
    ws.send(Message::Text("{not json".to_string().into())).await.unwrap();
    assert_eq!(expect_close(&mut ws).await, CloseCode::Protocol);
}

#[tokio::test]
async fn test_binary_frame_on_presence_channel_closes() {
    let (_server, url, _dir) = start_test_server().await;
    let mut ws = connect(&url).await;
    ws.send(Message::Binary(vec![1, 2, 3].into())).await.unwrap();
    assert_eq!(expect_close(&mut ws).await, CloseCode::Protocol);
}

#[tokio::test]
async fn test_unknown_session_on_presence_closes_with_policy_code() {
    let (_server, url, _dir) = start_test_server().await;
    let mut ws = connect(&url.replace("sess1", "missing")).await;
    assert_eq!(expect_close(&mut ws).await, CloseCode::Policy);
}
