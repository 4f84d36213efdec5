//! Per-connection plumbing shared by both WebSocket channels.
//!
//! ```text
//!   WsSource ──► handler loop ──► cache / registry
//!                    │                  │
//!                    ▼                  ▼ broadcast::Receiver
//!               Outbound (mpsc) ◄── forwarder tasks
//!                    │
//!                    ▼
//!               writer task ──► WsSink
//! ```
//!
//! Everything a connection sends goes through one bounded queue drained by a
//! single writer task, so replies and forwarded broadcasts never interleave
//! mid-frame and a slow socket only stalls its own connection.

pub(crate) mod presence;
pub(crate) mod sync;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::registry::{ConnectionId, Frame};

pub(crate) type WsStream = WebSocketStream<TcpStream>;
pub(crate) type WsSink = SplitSink<WsStream, Message>;
pub(crate) type WsSource = SplitStream<WsStream>;

/// Frames a connection may have queued before senders wait.
pub(crate) const OUTBOUND_CAPACITY: usize = 1024;

/// Sending half of a connection's outbound queue.
#[derive(Clone)]
pub(crate) struct Outbound {
    conn: ConnectionId,
    tx: mpsc::Sender<Message>,
}

impl Outbound {
    /// Start the writer task for `sink`.
    pub(crate) fn spawn(conn: ConnectionId, sink: WsSink) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let writer = tokio::spawn(write_loop(conn, sink, rx));
        (Self { conn, tx }, writer)
    }

    /// Queue a message. False once the writer is gone.
    pub(crate) async fn send(&self, msg: Message) -> bool {
        self.tx.send(msg).await.is_ok()
    }

    pub(crate) async fn binary(&self, bytes: Vec<u8>) -> bool {
        self.send(Message::Binary(bytes.into())).await
    }

    pub(crate) async fn frame(&self, frame: &Frame) -> bool {
        self.send(frame_message(frame)).await
    }

    /// Queue a close frame; the writer stops after sending it.
    pub(crate) async fn close(&self, code: CloseCode, reason: &str) {
        log::debug!("Closing {} with {code}: {reason}", self.conn);
        self.send(close_message(code, reason)).await;
    }
}

async fn write_loop(conn: ConnectionId, mut sink: WsSink, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if let Err(e) = sink.send(msg).await {
            log::debug!("Write to {conn} failed: {e}");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

pub(crate) fn frame_message(frame: &Frame) -> Message {
    match frame {
        Frame::Binary(bytes) => Message::Binary(bytes.as_ref().clone().into()),
        Frame::Text(text) => Message::Text(text.to_string().into()),
    }
}

pub(crate) fn close_message(code: CloseCode, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_owned().into(),
    }))
}

/// What the handler loop should react to next.
pub(crate) enum Inbound {
    Message(Message),
    /// Nothing received within the idle timeout
    Idle,
    /// Peer closed or the stream ended
    Closed,
    /// Server is shutting down
    Shutdown,
    /// The connection's session was deleted
    SessionDeleted,
    Failed(String),
}

/// Out-of-band reasons for a connection to stop.
pub(crate) struct Signals {
    pub(crate) shutdown: watch::Receiver<bool>,
    /// Flips to true when the session is deleted. Dropping it tells
    /// `delete_session` this connection is gone.
    pub(crate) deleted: watch::Receiver<bool>,
}

/// Wait for the next frame. `idle` of `None` waits without a deadline.
pub(crate) async fn next_inbound(
    source: &mut WsSource,
    idle: Option<Duration>,
    signals: &mut Signals,
) -> Inbound {
    if *signals.shutdown.borrow() {
        return Inbound::Shutdown;
    }
    if *signals.deleted.borrow() {
        return Inbound::SessionDeleted;
    }
    let read = async {
        match idle {
            Some(idle) => tokio::time::timeout(idle, source.next()).await.ok(),
            None => Some(source.next().await),
        }
    };
    tokio::select! {
        next = read => match next {
            None => Inbound::Idle,
            Some(None) | Some(Some(Ok(Message::Close(_)))) => Inbound::Closed,
            Some(Some(Ok(msg))) => Inbound::Message(msg),
            Some(Some(Err(e))) => Inbound::Failed(e.to_string()),
        },
        _ = signals.shutdown.changed() => Inbound::Shutdown,
        _ = signals.deleted.changed() => Inbound::SessionDeleted,
    }
}

/// Shared tail of both handler loops for everything that is not a data
/// frame. Returns false when the loop must stop.
pub(crate) async fn handle_control(out: &Outbound, inbound: Inbound) -> bool {
    match inbound {
        Inbound::Message(Message::Ping(data)) => out.send(Message::Pong(data)).await,
        Inbound::Message(Message::Pong(_)) | Inbound::Message(Message::Frame(_)) => true,
        Inbound::Message(other) => {
            // Data frames are dispatched by the channel before reaching here.
            log::trace!("Ignoring {} byte frame", other.len());
            true
        }
        Inbound::Idle => {
            out.close(CloseCode::Away, "idle timeout").await;
            false
        }
        Inbound::Shutdown => {
            out.close(CloseCode::Away, "server shutting down").await;
            false
        }
        Inbound::SessionDeleted => {
            out.close(CloseCode::Policy, "session deleted").await;
            false
        }
        Inbound::Closed => false,
        Inbound::Failed(e) => {
            log::debug!("Connection {} failed: {e}", out.conn);
            false
        }
    }
}

/// Forwarder task, aborted when the handle is dropped.
pub(crate) struct Forwarder(JoinHandle<()>);

impl Forwarder {
    pub(crate) fn spawn<F>(task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self(tokio::spawn(task))
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.0.abort();
    }
}
