//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server (RocksDB op log, JSON page files) and
//! connect real clients, verifying the full sync pipeline.

use futures_util::{SinkExt, StreamExt};
use pagesync_collab::client::{ConnectionState, SyncClient, SyncEvent};
use pagesync_collab::config::ServerConfig;
use pagesync_collab::protocol::{Catchup, ErrorCode, MessageType, SyncMessage};
use pagesync_collab::server::SyncServer;
use pagesync_collab::storage::FsSessions;
use pagesync_core::{DocumentName, Field, Operation, SessionId, TextOp};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type RawSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    server: Arc<SyncServer>,
    url: String,
    sessions_root: PathBuf,
    _dir: TempDir,
}

fn session() -> SessionId {
    SessionId::new("sess1").unwrap()
}

/// Start a server on a free port with session `sess1` created.
async fn start_test_server_with(configure: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ServerConfig::for_testing(dir.path());
    configure(&mut config);
    FsSessions::new(&config.sessions_root).create(&session()).unwrap();
    let sessions_root = config.sessions_root.clone();

    let server = Arc::new(SyncServer::open(config).unwrap());
    let listener = server.bind().await.unwrap();
    let port = listener.local_addr().unwrap().port();
    {
        let server = server.clone();
        tokio::spawn(async move {
            server.serve(listener).await.unwrap();
        });
    }

    TestServer {
        server,
        url: format!("ws://127.0.0.1:{port}"),
        sessions_root,
        _dir: dir,
    }
}

async fn start_test_server() -> TestServer {
    start_test_server_with(|_| {}).await
}

async fn connect_client(url: &str, doc: &str) -> SyncClient {
    let client = SyncClient::connect(url, &session(), doc).await.unwrap();
    timeout(WAIT, client.wait_synchronized()).await.unwrap().unwrap();
    client
}

async fn wait_version(client: &SyncClient, version: u64) {
    timeout(WAIT, client.wait_until(|s| s.version >= version && s.settled))
        .await
        .unwrap()
        .unwrap();
}

async fn raw_connect(url: &str) -> RawSocket {
    tokio_tungstenite::connect_async(url).await.unwrap().0
}

async fn send_raw(ws: &mut RawSocket, msg: &SyncMessage) {
    ws.send(Message::Binary(msg.encode().unwrap().into())).await.unwrap();
}

/// Next sync message, skipping control frames.
async fn next_sync(ws: &mut RawSocket) -> SyncMessage {
    loop {
        match timeout(WAIT, ws.next()).await.unwrap() {
            Some(Ok(Message::Binary(data))) => return SyncMessage::decode(&data).unwrap(),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            other => panic!("expected a binary frame, got {other:?}"),
        }
    }
}

async fn next_of_type(ws: &mut RawSocket, msg_type: MessageType) -> SyncMessage {
    loop {
        let msg = next_sync(ws).await;
        if msg.msg_type == msg_type {
            return msg;
        }
    }
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

/// Raw handshake on `doc` from `version`. Returns the server's version.
async fn raw_handshake(ws: &mut RawSocket, doc: &str, version: u64) -> u64 {
    send_raw(ws, &SyncMessage::sync_step1(Uuid::new_v4(), doc, version)).await;
    let step1 = next_of_type(ws, MessageType::SyncStep1).await;
    next_of_type(ws, MessageType::SyncStep2).await;
    send_raw(ws, &SyncMessage::sync_done(Uuid::new_v4(), doc, step1.version, None).unwrap()).await;
    step1.version
}

// ─── Handshake and editing ──────────────────────────────────────────

#[tokio::test]
async fn test_new_document_insert_persists_definition_field() {
    let test = start_test_server().await;
    let client = connect_client(&test.url, "page.hml-definition").await;
    assert_eq!(client.version().await, 0);
    assert_eq!(client.content().await, "");

    client
        .submit(Operation::insert(Field::Definition, 0, "Hi"))
        .await
        .unwrap();
    wait_version(&client, 1).await;
    assert_eq!(client.content().await, "Hi");

    let name = DocumentName::parse("sess1/page.hml-definition").unwrap();
    test.server.cache().flush(&name).await;

    let page = std::fs::read_to_string(test.sessions_root.join("sess1/pages/page.hml.json")).unwrap();
    let fields: serde_json::Value = serde_json::from_str(&page).unwrap();
    assert_eq!(fields["definition"], "Hi");
    assert!(fields.get("content").is_none());
}

#[tokio::test]
async fn test_concurrent_replaces_converge() {
    let test = start_test_server().await;
    let a = connect_client(&test.url, "page.hml").await;
    let b = connect_client(&test.url, "page.hml").await;

    a.submit(Operation::replace(Field::Content, "", "hello")).await.unwrap();
    wait_version(&a, 1).await;
    wait_version(&b, 1).await;
    assert_eq!(b.content().await, "hello");

    // Both based on v1
    a.submit(Operation::replace(Field::Content, "hello", "hello world"))
        .await
        .unwrap();
    b.submit(Operation::replace(Field::Content, "hello", "goodbye"))
        .await
        .unwrap();

    wait_version(&a, 3).await;
    wait_version(&b, 3).await;

    let expected = test
        .server
        .cache()
        .snapshot(&DocumentName::parse("sess1/page.hml").unwrap())
        .await
        .unwrap();
    assert_eq!(expected.version, 3);
    assert_eq!(a.content().await, expected.content);
    assert_eq!(b.content().await, expected.content);
    assert!(
        expected.content == "hello worldgoodbye" || expected.content == "goodbyehello world",
        "unexpected merge {:?}",
        expected.content
    );
}

#[tokio::test]
async fn test_interleaved_typing_converges() {
    let test = start_test_server().await;
    let a = connect_client(&test.url, "notes").await;
    let b = connect_client(&test.url, "notes").await;

    for i in 0..10 {
        a.edit(TextOp::insertion(0, "a")).await.unwrap();
        let len = b.content().await.chars().count();
        b.edit(TextOp::insertion(len, &i.to_string())).await.unwrap();
    }

    wait_version(&a, 20).await;
    wait_version(&b, 20).await;
    let content = a.content().await;
    assert_eq!(content, b.content().await);
    assert_eq!(content.chars().filter(|c| *c == 'a').count(), 10);
    assert_eq!(content.chars().count(), 20);
}

#[tokio::test]
async fn test_late_joiner_catches_up() {
    let test = start_test_server().await;
    let a = connect_client(&test.url, "page.hml-details").await;
    for word in ["one ", "two ", "three"] {
        let len = a.content().await.chars().count();
        a.edit(TextOp::insertion(len, word)).await.unwrap();
    }
    wait_version(&a, 3).await;

    let b = connect_client(&test.url, "page.hml-details").await;
    assert_eq!(b.version().await, 3);
    assert_eq!(b.content().await, "one two three");
}

#[tokio::test]
async fn test_catchup_sends_operations_within_history() {
    let test = start_test_server().await;
    let a = connect_client(&test.url, "page.hml").await;
    a.edit(TextOp::insertion(0, "xy")).await.unwrap();
    a.edit(TextOp::insertion(2, "z")).await.unwrap();
    wait_version(&a, 2).await;

    let mut ws = raw_connect(&format!("{}/sync/sess1", test.url)).await;
    send_raw(&mut ws, &SyncMessage::sync_step1(Uuid::new_v4(), "page.hml", 1)).await;
    let step1 = next_of_type(&mut ws, MessageType::SyncStep1).await;
    assert_eq!(step1.version, 2);
    let step2 = next_of_type(&mut ws, MessageType::SyncStep2).await;
    match step2.catchup_payload().unwrap() {
        Catchup::Operations(ops) => {
            assert_eq!(ops.len(), 1);
            assert_eq!(ops[0].version, 2);
        }
        other => panic!("expected operations, got {other:?}"),
    }
}

#[tokio::test]
async fn test_pending_operation_in_handshake_is_applied() {
    let test = start_test_server().await;
    let mut ws = raw_connect(&format!("{}/sync/sess1", test.url)).await;
    send_raw(&mut ws, &SyncMessage::sync_step1(Uuid::new_v4(), "draft", 0)).await;
    next_of_type(&mut ws, MessageType::SyncStep2).await;

    let op = Operation::insert(Field::Content, 0, "offline");
    send_raw(&mut ws, &SyncMessage::sync_done(Uuid::new_v4(), "draft", 0, Some(&op)).unwrap()).await;
    let ack = next_of_type(&mut ws, MessageType::Ack).await;
    assert_eq!(ack.version, 1);

    let snapshot = test
        .server
        .cache()
        .snapshot(&DocumentName::parse("sess1/draft").unwrap())
        .await
        .unwrap();
    assert_eq!(snapshot.content, "offline");
}

// ─── Errors and resync ──────────────────────────────────────────────

#[tokio::test]
async fn test_update_before_handshake_is_rejected() {
    let test = start_test_server().await;
    let mut ws = raw_connect(&format!("{}/sync/sess1", test.url)).await;

    let op = Operation::insert(Field::Content, 0, "x");
    send_raw(&mut ws, &SyncMessage::submit(Uuid::new_v4(), "page.hml", 0, &op).unwrap()).await;
    let error = next_of_type(&mut ws, MessageType::Error).await;
    assert_eq!(error.error_report().unwrap().code, ErrorCode::NotSynchronized);

    // Connection stays usable
    send_raw(&mut ws, &SyncMessage::ping(Uuid::new_v4())).await;
    next_of_type(&mut ws, MessageType::Pong).await;
}

#[tokio::test]
async fn test_invalid_operation_is_rejected_not_broadcast() {
    let test = start_test_server().await;
    let observer = connect_client(&test.url, "page.hml").await;
    let mut ws = raw_connect(&format!("{}/sync/sess1", test.url)).await;
    raw_handshake(&mut ws, "page.hml", 0).await;

    // Wrong field for a whole-page document
    let op = Operation::insert(Field::Details, 0, "x");
    send_raw(&mut ws, &SyncMessage::submit(Uuid::new_v4(), "page.hml", 0, &op).unwrap()).await;
    let error = next_of_type(&mut ws, MessageType::Error).await;
    assert_eq!(error.error_report().unwrap().code, ErrorCode::Validation);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(observer.version().await, 0);
    assert_eq!(test.server.stats().await.updates_applied, 0);
}

#[tokio::test]
async fn test_stale_operation_gets_error_and_snapshot() {
    let test = start_test_server_with(|config| config.history_limit = 2).await;
    let mut ws = raw_connect(&format!("{}/sync/sess1", test.url)).await;
    raw_handshake(&mut ws, "page.hml", 0).await;

    let writer = connect_client(&test.url, "page.hml").await;
    for _ in 0..5 {
        writer.edit(TextOp::insertion(0, "w")).await.unwrap();
    }
    wait_version(&writer, 5).await;

    let op = Operation::insert(Field::Content, 0, "late");
    send_raw(&mut ws, &SyncMessage::submit(Uuid::new_v4(), "page.hml", 0, &op).unwrap()).await;

    let error = next_of_type(&mut ws, MessageType::Error).await;
    assert_eq!(error.error_report().unwrap().code, ErrorCode::Stale);
    let resync = next_of_type(&mut ws, MessageType::SyncStep2).await;
    match resync.catchup_payload().unwrap() {
        Catchup::Snapshot(snapshot) => {
            assert_eq!(snapshot.version, 5);
            assert_eq!(snapshot.content, "wwwww");
        }
        other => panic!("expected snapshot, got {other:?}"),
    }
    assert_eq!(test.server.stats().await.resyncs, 1);
}

// ─── Close codes ────────────────────────────────────────────────────

#[tokio::test]
async fn test_malformed_frame_closes_with_protocol_code() {
    let test = start_test_server().await;
    let mut ws = raw_connect(&format!("{}/sync/sess1", test.url)).await;
    ws.send(Message::Binary(vec![0xFF, 0xFE, 0xFD].into())).await.unwrap();
    assert_eq!(expect_close(&mut ws).await, CloseCode::Protocol);
    assert_eq!(test.server.stats().await.protocol_errors, 1);
}

#[tokio::test]
async fn test_text_frame_on_sync_channel_closes() {
    let test = start_test_server().await;
    let mut ws = raw_connect(&format!("{}/sync/sess1", test.url)).await;
    ws.send(Message::Text("hello".to_string().into())).await.unwrap();
    assert_eq!(expect_close(&mut ws).await, CloseCode::Protocol);
}

#[tokio::test]
async fn test_malformed_frame_does_not_affect_other_connections() {
    let test = start_test_server().await;
    let a = connect_client(&test.url, "page.hml").await;
    let mut bad = raw_connect(&format!("{}/sync/sess1", test.url)).await;
    bad.send(Message::Binary(vec![0xFF].into())).await.unwrap();
    expect_close(&mut bad).await;

    a.edit(TextOp::insertion(0, "still here")).await.unwrap();
    wait_version(&a, 1).await;
}

#[tokio::test]
async fn test_unknown_session_closes_with_policy_code() {
    let test = start_test_server().await;
    let mut ws = raw_connect(&format!("{}/sync/nosuch", test.url)).await;
    assert_eq!(expect_close(&mut ws).await, CloseCode::Policy);
}

#[tokio::test]
async fn test_unknown_path_closes_with_policy_code() {
    let test = start_test_server().await;
    let mut ws = raw_connect(&format!("{}/chat/sess1", test.url)).await;
    assert_eq!(expect_close(&mut ws).await, CloseCode::Policy);
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let test = start_test_server_with(|config| config.idle_timeout_secs = 1).await;
    let mut ws = raw_connect(&format!("{}/sync/sess1", test.url)).await;
    assert_eq!(expect_close(&mut ws).await, CloseCode::Away);
}

#[tokio::test]
async fn test_shutdown_closes_connections_and_flushes() {
    let test = start_test_server().await;
    let client = connect_client(&test.url, "page.hml").await;
    let mut ws = raw_connect(&format!("{}/sync/sess1", test.url)).await;
    raw_handshake(&mut ws, "page.hml", 0).await;

    client.edit(TextOp::insertion(0, "bye")).await.unwrap();
    wait_version(&client, 1).await;

    test.server.shutdown().await;
    assert_eq!(expect_close(&mut ws).await, CloseCode::Away);

    let page = std::fs::read_to_string(test.sessions_root.join("sess1/pages/page.hml.json")).unwrap();
    let fields: serde_json::Value = serde_json::from_str(&page).unwrap();
    assert_eq!(fields["content"], "bye");
}

#[tokio::test]
async fn test_delete_session_closes_live_connections() {
    let test = start_test_server().await;
    let mut sync = raw_connect(&format!("{}/sync/sess1", test.url)).await;
    raw_handshake(&mut sync, "page.hml", 0).await;
    let mut presence = raw_connect(&format!("{}/presence/sess1", test.url)).await;

    let doc = DocumentName::parse("sess1/page.hml").unwrap();
    test.server
        .cache()
        .apply(&doc, &TextOp::insertion(0, "old"), 0, |_| {})
        .await
        .unwrap();
    assert_eq!(next_of_type(&mut sync, MessageType::Update).await.version, 1);

    test.server.delete_session(&session()).await.unwrap();
    assert_eq!(expect_close(&mut sync).await, CloseCode::Policy);
    assert_eq!(expect_close(&mut presence).await, CloseCode::Policy);
    assert_eq!(test.server.stats().await.active_rooms, 0);

    // A fresh connection starts over from the reseeded document.
    let mut again = raw_connect(&format!("{}/sync/sess1", test.url)).await;
    assert_eq!(raw_handshake(&mut again, "page.hml", 0).await, 0);
}

#[tokio::test]
async fn test_zero_idle_timeout_keeps_connections_open() {
    let test = start_test_server_with(|config| config.idle_timeout_secs = 0).await;
    let mut ws = raw_connect(&format!("{}/sync/sess1", test.url)).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;

    ws.send(Message::Ping(vec![1, 2].into())).await.unwrap();
    loop {
        match timeout(WAIT, ws.next()).await.unwrap() {
            Some(Ok(Message::Pong(data))) => {
                assert_eq!(data.as_ref(), &[1, 2]);
                break;
            }
            Some(Ok(Message::Close(frame))) => panic!("closed: {frame:?}"),
            Some(Ok(_)) => continue,
            other => panic!("expected a pong, got {other:?}"),
        }
    }
}

// ─── Awareness, ping, stats ─────────────────────────────────────────

#[tokio::test]
async fn test_awareness_is_relayed_to_other_peers() {
    let test = start_test_server().await;
    let a = connect_client(&test.url, "page.hml").await;
    let mut b = connect_client(&test.url, "page.hml").await;
    let mut events = b.take_event_rx().unwrap();

    a.send_awareness(vec![7, 7]).await.unwrap();
    loop {
        match timeout(WAIT, events.recv()).await.unwrap() {
            Some(SyncEvent::Awareness { state, .. }) => {
                assert_eq!(state, vec![7, 7]);
                break;
            }
            Some(_) => continue,
            None => panic!("client stopped"),
        }
    }
}

#[tokio::test]
async fn test_client_sees_disconnect_after_close() {
    let test = start_test_server().await;
    let client = connect_client(&test.url, "page.hml").await;
    client.ping().await.unwrap();
    client.close().await;
    let status = timeout(WAIT, client.wait_until(|s| s.state == ConnectionState::Disconnected))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.state, ConnectionState::Disconnected);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = test.server.stats().await;
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_connections, 0);
}
