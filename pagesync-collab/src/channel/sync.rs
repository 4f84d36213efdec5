//! Operational-transform channel (`/sync/<sessionId>`).
//!
//! One connection may follow several documents of its session. Per document:
//!
//! ```text
//! client                                   server
//!   │── SyncStep1(v_client) ─────────────────►│ subscribe, catch up
//!   │◄──────────────── SyncStep1(v_server) ───│
//!   │◄─────── SyncStep2(ops | snapshot) ──────│
//!   │── SyncStep2(Option<pending op>) ───────►│ SYNCHRONIZED
//!   │── Update(op, base) ────────────────────►│ merge ─► broadcast
//!   │◄──────────────────────── Ack(version) ──│ (own op)
//!   │◄──────────────── Update(op, version) ───│ (others' ops)
//! ```
//!
//! Broadcasts reach the socket through a forwarder task per document, which
//! also turns the connection's own updates into acks and handles resyncs.

use std::collections::HashMap;
use std::sync::Arc;
use futures_util::StreamExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

use pagesync_core::{DocumentName, Operation, SessionId};

use super::{handle_control, next_inbound, Forwarder, Inbound, Outbound, Signals, WsStream};
use crate::error::SyncError;
use crate::protocol::{Catchup, ErrorReport, MessageType, SyncMessage};
use crate::registry::{Channel, ConnectionId, Envelope, EnvelopeKind, Frame};
use crate::server::ServerContext;

/// Connection lifecycle. Per-document progress lives in [`Subscription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Connecting,
    Syncing,
    Synchronized,
    Closed,
}

enum Control {
    Resync,
}

struct Subscription {
    synchronized: bool,
    control: mpsc::UnboundedSender<Control>,
    _forwarder: Forwarder,
}

struct SyncConnection {
    id: ConnectionId,
    session: SessionId,
    ctx: Arc<ServerContext>,
    out: Outbound,
    state: ConnectionState,
    documents: HashMap<DocumentName, Subscription>,
}

/// Serve one upgraded `/sync/<session>` connection until it closes.
pub(crate) async fn serve(
    ctx: Arc<ServerContext>,
    id: ConnectionId,
    session: SessionId,
    ws: WsStream,
    mut signals: Signals,
) {
    let (sink, mut source) = ws.split();
    let (out, _writer) = Outbound::spawn(id, sink);
    let idle = ctx.config.idle_timeout();

    let mut conn = SyncConnection {
        id,
        session,
        ctx,
        out,
        state: ConnectionState::Connecting,
        documents: HashMap::new(),
    };
    conn.transition(ConnectionState::Syncing);

    loop {
        match next_inbound(&mut source, idle, &mut signals).await {
            Inbound::Message(Message::Binary(data)) => {
                conn.ctx.stats.record_message(data.len());
                if let Err(e) = conn.on_binary(&data).await {
                    conn.ctx.stats.record_protocol_error();
                    log::warn!("Malformed frame from {}: {e}", conn.id);
                    conn.out.close(CloseCode::Protocol, "malformed frame").await;
                    break;
                }
            }
            Inbound::Message(Message::Text(_)) => {
                conn.ctx.stats.record_protocol_error();
                log::warn!("Text frame on sync channel from {}", conn.id);
                conn.out.close(CloseCode::Protocol, "sync channel expects binary frames").await;
                break;
            }
            other => {
                if !handle_control(&conn.out, other).await {
                    break;
                }
            }
        }
    }

    conn.close().await;
}

impl SyncConnection {
    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            log::debug!("Sync connection {}: {:?} -> {next:?}", self.id, self.state);
            self.state = next;
        }
    }

    /// Only an undecodable frame is an error here; everything else is
    /// answered with an `Error` message and the connection stays open.
    async fn on_binary(&mut self, data: &[u8]) -> Result<(), SyncError> {
        let msg = SyncMessage::decode(data)?;
        log::trace!("{} <- {:?} {} v{}", self.id, msg.msg_type, msg.doc, msg.version);

        match self.dispatch(&msg).await {
            Ok(()) => Ok(()),
            Err(e @ SyncError::Protocol(_)) => Err(e),
            Err(e) => {
                self.report(&msg.doc, &e).await;
                Ok(())
            }
        }
    }

    async fn dispatch(&mut self, msg: &SyncMessage) -> Result<(), SyncError> {
        match msg.msg_type {
            MessageType::SyncStep1 => self.on_sync_step1(msg).await,
            MessageType::SyncStep2 => self.on_sync_step2(msg).await,
            MessageType::Update => {
                let name = msg.document(&self.session)?;
                self.ensure_synchronized(&name)?;
                let op = msg.operation()?;
                self.submit(&name, msg.version, op).await
            }
            MessageType::Awareness => {
                let name = msg.document(&self.session)?;
                if !self.documents.contains_key(&name) {
                    return Err(SyncError::NotSynchronized(name.to_string()));
                }
                self.ctx
                    .registry
                    .set_awareness(self.id, &name, msg.payload.clone())
                    .await?;
                Ok(())
            }
            MessageType::Ping => {
                self.send(&SyncMessage::pong(self.id)).await;
                Ok(())
            }
            MessageType::Pong => Ok(()),
            MessageType::Ack | MessageType::Error => Err(SyncError::Validation(format!(
                "{:?} is a server-to-client message",
                msg.msg_type
            ))),
        }
    }

    async fn on_sync_step1(&mut self, msg: &SyncMessage) -> Result<(), SyncError> {
        let name = msg.document(&self.session)?;
        // A repeated handshake replaces the old subscription.
        self.documents.remove(&name);

        let rx = self.ctx.registry.subscribe(self.id, &name, Channel::Sync).await;
        let (catchup, version) = match self.ctx.cache.catch_up(&name, msg.version).await {
            Ok(found) => found,
            Err(e) => {
                self.ctx.registry.unsubscribe(self.id, &name).await;
                return Err(e);
            }
        };

        let doc = name.logical_name();
        self.send(&SyncMessage::sync_step1(self.id, &doc, version)).await;
        self.send(&SyncMessage::catchup(&doc, version, &catchup)?).await;
        for (peer, state) in self.ctx.registry.awareness(&name).await {
            if peer != self.id && !state.is_empty() {
                self.send(&SyncMessage::awareness(peer, &doc, state)).await;
            }
        }

        let (control, control_rx) = mpsc::unbounded_channel();
        let forwarder = Forwarder::spawn(forward(
            self.ctx.clone(),
            self.id,
            name.clone(),
            self.out.clone(),
            rx,
            control_rx,
            version,
        ));
        self.documents.insert(
            name.clone(),
            Subscription {
                synchronized: false,
                control,
                _forwarder: forwarder,
            },
        );

        let sent = match &catchup {
            Catchup::Operations(ops) => format!("{} ops", ops.len()),
            Catchup::Snapshot(_) => "snapshot".to_string(),
        };
        log::info!(
            "{} syncing {name}: client v{}, server v{version}, sent {sent}",
            self.id,
            msg.version
        );
        Ok(())
    }

    async fn on_sync_step2(&mut self, msg: &SyncMessage) -> Result<(), SyncError> {
        let name = msg.document(&self.session)?;
        let pending = msg.pending_operation()?;
        let sub = self
            .documents
            .get_mut(&name)
            .ok_or_else(|| SyncError::NotSynchronized(name.to_string()))?;
        sub.synchronized = true;
        self.transition(ConnectionState::Synchronized);
        log::debug!("{} synchronized {name}", self.id);

        match pending {
            Some(op) => self.submit(&name, msg.version, op).await,
            None => Ok(()),
        }
    }

    fn ensure_synchronized(&self, name: &DocumentName) -> Result<(), SyncError> {
        match self.documents.get(name) {
            Some(sub) if sub.synchronized => Ok(()),
            _ => Err(SyncError::NotSynchronized(name.to_string())),
        }
    }

    /// Merge a client operation and publish the result to the room.
    async fn submit(
        &mut self,
        name: &DocumentName,
        base_version: u64,
        op: Operation,
    ) -> Result<(), SyncError> {
        let text_op = op.to_text_op(name.field())?;
        // Same room the forwarders listen on; rooms live until their
        // session is deleted.
        let room = self.ctx.registry.room(name).await;
        let origin = self.id;
        let doc = name.logical_name();

        let result = self
            .ctx
            .cache
            .apply(name, &text_op, base_version, move |applied| {
                let version = applied.revision.version;
                match SyncMessage::update(origin, &doc, version, &applied.revision.op)
                    .and_then(|m| m.encode())
                {
                    Ok(bytes) => {
                        room.send(Envelope {
                            origin: Some(origin),
                            kind: EnvelopeKind::Update {
                                version,
                                degraded: applied.degraded,
                            },
                            frame: Frame::Binary(Arc::new(bytes)),
                        });
                    }
                    Err(e) => log::error!("Failed to encode update v{version} of {doc}: {e}"),
                }
            })
            .await;

        match result {
            Ok(applied) => {
                self.ctx.stats.record_update();
                log::debug!(
                    "{} applied to {name}: v{} -> v{}",
                    self.id,
                    applied.base_version,
                    applied.revision.version
                );
                Ok(())
            }
            Err(e @ SyncError::StaleOperation { .. }) => {
                log::info!("{} sent a stale op for {name}: {e}", self.id);
                self.report(&name.logical_name(), &e).await;
                if let Some(sub) = self.documents.get(name) {
                    let _ = sub.control.send(Control::Resync);
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn report(&self, doc: &str, error: &SyncError) {
        log::debug!("{} <- error on {doc}: {error}", self.id);
        match SyncMessage::error(doc, &ErrorReport::from(error)) {
            Ok(msg) => self.send(&msg).await,
            Err(e) => log::error!("Failed to encode error report: {e}"),
        }
    }

    async fn send(&self, msg: &SyncMessage) {
        match msg.encode() {
            Ok(bytes) => {
                self.out.binary(bytes).await;
            }
            Err(e) => log::error!("Failed to encode {:?}: {e}", msg.msg_type),
        }
    }

    async fn close(mut self) {
        self.transition(ConnectionState::Closed);
        // Stop forwarders before leaving the rooms.
        self.documents.clear();
        let left = self.ctx.registry.on_close(self.id).await;
        log::info!(
            "Sync connection {} on session {} closed ({} documents)",
            self.id,
            self.session,
            left.len()
        );
    }
}

/// Relay a room's broadcasts to one connection.
///
/// `synced` is the version the client has incorporated; updates at or below
/// it were already delivered by catch-up or a snapshot.
async fn forward(
    ctx: Arc<ServerContext>,
    id: ConnectionId,
    name: DocumentName,
    out: Outbound,
    mut rx: broadcast::Receiver<Envelope>,
    mut control: mpsc::UnboundedReceiver<Control>,
    mut synced: u64,
) {
    let doc = name.logical_name();
    loop {
        let resync = tokio::select! {
            received = rx.recv() => match received {
                Ok(envelope) => match envelope.kind {
                    EnvelopeKind::Update { version, degraded } => {
                        if version <= synced {
                            continue;
                        }
                        synced = version;
                        let own = envelope.origin == Some(id);
                        let delivered = if own {
                            send_message(&out, &SyncMessage::ack(&doc, version)).await
                        } else {
                            out.frame(&envelope.frame).await
                        };
                        if !delivered {
                            break;
                        }
                        own && degraded
                    }
                    EnvelopeKind::Awareness => {
                        if envelope.origin != Some(id) && !out.frame(&envelope.frame).await {
                            break;
                        }
                        false
                    }
                    EnvelopeKind::Presence => false,
                },
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("{id} lagged {skipped} broadcasts on {name}, resyncing");
                    true
                }
                Err(RecvError::Closed) => {
                    out.close(CloseCode::Policy, "document closed").await;
                    break;
                }
            },
            command = control.recv() => match command {
                Some(Control::Resync) => true,
                None => break,
            },
        };

        if resync {
            match push_snapshot(&ctx, &name, &out).await {
                Some(version) => synced = version,
                None => break,
            }
        }
    }
    log::trace!("Forwarder for {id} on {name} stopped");
}

/// Replace the client's copy with the current snapshot. Returns its version,
/// or `None` when the connection is gone.
async fn push_snapshot(ctx: &ServerContext, name: &DocumentName, out: &Outbound) -> Option<u64> {
    let snapshot = match ctx.cache.snapshot(name).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            log::error!("Cannot resync {name}: {e}");
            return None;
        }
    };
    let version = snapshot.version;
    let msg = match SyncMessage::catchup(&name.logical_name(), version, &Catchup::Snapshot(snapshot)) {
        Ok(msg) => msg,
        Err(e) => {
            log::error!("Failed to encode snapshot of {name}: {e}");
            return None;
        }
    };
    ctx.stats.record_resync();
    send_message(out, &msg).await.then_some(version)
}

async fn send_message(out: &Outbound, msg: &SyncMessage) -> bool {
    match msg.encode() {
        Ok(bytes) => out.binary(bytes).await,
        Err(e) => {
            log::error!("Failed to encode {:?}: {e}", msg.msg_type);
            false
        }
    }
}
