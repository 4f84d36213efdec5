//! WebSocket sync client for one document.
//!
//! Provides:
//! - the SyncStep1 / SyncStep2 handshake on connect
//! - local edits through a [`Replica`] (one op in flight, the rest queued)
//! - integration of remote updates, acks and snapshot resyncs
//! - awareness updates and application-level ping
//!
//! Used by the integration tests and as a reference for editor front ends.

use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use pagesync_core::{DocumentName, Field, Operation, Outgoing, Replica, SessionId, Snapshot, TextOp};

use crate::error::{ProtocolError, SyncError};
use crate::protocol::{Catchup, ErrorReport, MessageType, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the server's catch-up
    Syncing,
    /// Handshake done; edits flow both ways
    Synchronized,
    Disconnected,
}

/// Observable client status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientStatus {
    pub state: ConnectionState,
    /// Last server version incorporated
    pub version: u64,
    /// No local edit waiting for an ack
    pub settled: bool,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// Initial handshake completed
    Synced { version: u64 },
    /// Another connection's op was integrated
    RemoteUpdate { origin: Uuid, version: u64 },
    /// Our op was accepted as `version`
    Acked(u64),
    /// Local state was replaced by a server snapshot
    Resynced { version: u64 },
    Awareness { peer_id: Uuid, state: Vec<u8> },
    /// The server refused a message
    Rejected(ErrorReport),
    Disconnected,
}

/// State shared with the reader task.
struct Shared {
    doc: String,
    field: Field,
    replica: Mutex<Replica>,
    status: watch::Sender<ClientStatus>,
    outgoing: mpsc::Sender<Message>,
    events: mpsc::UnboundedSender<SyncEvent>,
}

/// The sync client.
pub struct SyncClient {
    peer_id: Uuid,
    shared: Arc<Shared>,
    status: watch::Receiver<ClientStatus>,
    event_rx: Option<mpsc::UnboundedReceiver<SyncEvent>>,
}

impl SyncClient {
    /// Connect to `<server_url>/sync/<session>` and start the handshake for
    /// `doc` (a name relative to the session, like `page.hml-details`).
    pub async fn connect(server_url: &str, session: &SessionId, doc: &str) -> Result<Self, SyncError> {
        let name = DocumentName::parse(&format!("{session}/{doc}"))?;
        let url = format!("{}/sync/{session}", server_url.trim_end_matches('/'));
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_writer.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let peer_id = Uuid::new_v4();
        let (status_tx, status_rx) = watch::channel(ClientStatus {
            state: ConnectionState::Syncing,
            version: 0,
            settled: true,
        });
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            doc: name.logical_name(),
            field: name.field(),
            replica: Mutex::new(Replica::new(Snapshot::default())),
            status: status_tx,
            outgoing: out_tx,
            events: event_tx,
        });

        shared
            .send(&SyncMessage::sync_step1(peer_id, &shared.doc, 0))
            .await?;

        // Reader task: process incoming WebSocket messages
        let reader = shared.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match SyncMessage::decode(&data) {
                        Ok(sync_msg) => {
                            if let Err(e) = reader.on_message(peer_id, sync_msg).await {
                                log::warn!("Client {peer_id} dropped a message: {e}");
                            }
                        }
                        Err(e) => log::warn!("Client {peer_id} got an undecodable frame: {e}"),
                    },
                    Ok(Message::Close(frame)) => {
                        log::debug!("Client {peer_id} closed by server: {frame:?}");
                        break;
                    }
                    Err(e) => {
                        log::debug!("Client {peer_id} connection failed: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            // Connection lost
            reader.status.send_modify(|s| s.state = ConnectionState::Disconnected);
            let _ = reader.events.send(SyncEvent::Disconnected);
        });

        Ok(Self {
            peer_id,
            shared,
            status: status_rx,
            event_rx: Some(event_rx),
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx.take()
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn status(&self) -> ClientStatus {
        *self.status.borrow()
    }

    /// Wait until `predicate` holds for the client status.
    pub async fn wait_until<F>(&self, predicate: F) -> Result<ClientStatus, SyncError>
    where
        F: FnMut(&ClientStatus) -> bool,
    {
        let mut status = self.status.clone();
        let found = status
            .wait_for(predicate)
            .await
            .map_err(|_| SyncError::Transport("client stopped".into()))?;
        Ok(*found)
    }

    pub async fn wait_synchronized(&self) -> Result<ClientStatus, SyncError> {
        self.wait_until(|s| s.state == ConnectionState::Synchronized).await
    }

    pub async fn content(&self) -> String {
        self.shared.replica.lock().await.content().to_owned()
    }

    pub async fn version(&self) -> u64 {
        self.shared.replica.lock().await.version()
    }

    /// Apply a local edit and send it when nothing else is in flight.
    pub async fn edit(&self, op: TextOp) -> Result<(), SyncError> {
        if self.status().state != ConnectionState::Synchronized {
            return Err(SyncError::NotSynchronized(self.shared.doc.clone()));
        }
        let mut replica = self.shared.replica.lock().await;
        let outgoing = replica.edit(op)?;
        self.shared.publish_status(&replica);
        if let Some(outgoing) = outgoing {
            self.shared.submit(self.peer_id, outgoing).await?;
        }
        Ok(())
    }

    /// Apply a wire operation against the current local content.
    pub async fn submit(&self, op: Operation) -> Result<(), SyncError> {
        let op = op.to_text_op(self.shared.field)?;
        self.edit(op).await
    }

    pub async fn send_awareness(&self, state: Vec<u8>) -> Result<(), SyncError> {
        self.shared
            .send(&SyncMessage::awareness(self.peer_id, &self.shared.doc, state))
            .await
    }

    pub async fn ping(&self) -> Result<(), SyncError> {
        self.shared.send(&SyncMessage::ping(self.peer_id)).await
    }

    /// Close the connection normally.
    pub async fn close(&self) {
        let _ = self.shared.outgoing.send(Message::Close(None)).await;
    }
}

impl Shared {
    async fn send(&self, msg: &SyncMessage) -> Result<(), SyncError> {
        let encoded = msg.encode()?;
        self.outgoing
            .send(Message::Binary(encoded.into()))
            .await
            .map_err(|_| SyncError::Protocol(ProtocolError::ConnectionClosed))
    }

    async fn submit(&self, peer_id: Uuid, outgoing: Outgoing) -> Result<(), SyncError> {
        let op = Operation::edit(self.field, &outgoing.op);
        self.send(&SyncMessage::submit(peer_id, &self.doc, outgoing.base_version, &op)?)
            .await
    }

    fn publish_status(&self, replica: &Replica) {
        self.status.send_modify(|s| {
            s.version = replica.version();
            s.settled = replica.is_settled();
        });
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    async fn on_message(&self, peer_id: Uuid, msg: SyncMessage) -> Result<(), SyncError> {
        let mut replica = self.replica.lock().await;
        match msg.msg_type {
            MessageType::SyncStep1 => {
                log::trace!("Server has {} at v{}", self.doc, msg.version);
            }
            MessageType::SyncStep2 => {
                match msg.catchup_payload()? {
                    Catchup::Operations(revisions) => {
                        for revision in &revisions {
                            replica.receive(&revision.op, revision.version)?;
                        }
                    }
                    Catchup::Snapshot(snapshot) => replica.resync(snapshot),
                }
                let version = replica.version();
                if self.status.borrow().state == ConnectionState::Syncing {
                    self.send(&SyncMessage::sync_done(peer_id, &self.doc, version, None)?)
                        .await?;
                    self.status.send_modify(|s| s.state = ConnectionState::Synchronized);
                    self.emit(SyncEvent::Synced { version });
                } else {
                    self.emit(SyncEvent::Resynced { version });
                }
            }
            MessageType::Update => {
                let op = msg.text_op()?;
                replica.receive(&op, msg.version)?;
                self.emit(SyncEvent::RemoteUpdate {
                    origin: msg.peer_id,
                    version: msg.version,
                });
            }
            MessageType::Ack => {
                if let Some(next) = replica.acknowledge(msg.version)? {
                    self.submit(peer_id, next).await?;
                }
                self.emit(SyncEvent::Acked(msg.version));
            }
            MessageType::Awareness => self.emit(SyncEvent::Awareness {
                peer_id: msg.peer_id,
                state: msg.payload,
            }),
            MessageType::Error => self.emit(SyncEvent::Rejected(msg.error_report()?)),
            MessageType::Ping => self.send(&SyncMessage::pong(peer_id)).await?,
            MessageType::Pong => {}
        }
        self.publish_status(&replica);
        Ok(())
    }
}
