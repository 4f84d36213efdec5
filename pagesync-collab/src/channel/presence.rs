//! Presence channel (`/presence/<sessionId>`).
//!
//! A connection registers with `user-info` for one page and then streams
//! `cursor-update`s. A cursor update naming another page moves the
//! registration there; the old page's subscribers get a presence set
//! without this user.

use std::sync::Arc;
use futures_util::StreamExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

use pagesync_core::{DocumentName, SessionId};

use super::{handle_control, next_inbound, Forwarder, Inbound, Outbound, Signals, WsStream};
use crate::error::SyncError;
use crate::presence::{CursorUpdate, PresenceFields, PresenceMessage, UserInfo};
use crate::registry::{Channel, ConnectionId, Envelope, EnvelopeKind, Room};
use crate::server::ServerContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PresenceState {
    Connecting,
    Registered,
    Closed,
}

/// Identity announced by `user-info`, reused when the user moves pages.
struct Identity {
    user_id: String,
    user_name: String,
    color: Option<String>,
}

struct Registration {
    name: DocumentName,
    _forwarder: Forwarder,
}

struct PresenceConnection {
    id: ConnectionId,
    session: SessionId,
    ctx: Arc<ServerContext>,
    out: Outbound,
    state: PresenceState,
    identity: Option<Identity>,
    registration: Option<Registration>,
}

/// Serve one upgraded `/presence/<session>` connection until it closes.
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

    let mut conn = PresenceConnection {
        id,
        session,
        ctx,
        out,
        state: PresenceState::Connecting,
        identity: None,
        registration: None,
    };

    loop {
        match next_inbound(&mut source, idle, &mut signals).await {
            Inbound::Message(Message::Text(text)) => {
                conn.ctx.stats.record_message(text.len());
                let msg = match PresenceMessage::decode(text.as_str()) {
                    Ok(msg) => msg,
                    Err(e) => {
                        conn.ctx.stats.record_protocol_error();
                        log::warn!("Malformed presence frame from {}: {e}", conn.id);
                        conn.out.close(CloseCode::Protocol, "malformed presence message").await;
                        break;
                    }
                };
                if let Err(e) = conn.on_message(msg).await {
                    log::warn!("Presence message from {} ignored: {e}", conn.id);
                }
            }
            Inbound::Message(Message::Binary(_)) => {
                conn.ctx.stats.record_protocol_error();
                log::warn!("Binary frame on presence channel from {}", conn.id);
                conn.out.close(CloseCode::Protocol, "presence channel expects text frames").await;
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

impl PresenceConnection {
    async fn on_message(&mut self, msg: PresenceMessage) -> Result<(), SyncError> {
        match msg {
            PresenceMessage::UserInfo(info) => self.on_user_info(info).await,
            PresenceMessage::CursorUpdate(update) => self.on_cursor_update(update).await,
            PresenceMessage::Presence { .. } => Err(SyncError::Validation(
                "presence sets are sent by the server only".into(),
            )),
        }
    }

    async fn on_user_info(&mut self, info: UserInfo) -> Result<(), SyncError> {
        let name = self.document(&info.filename)?;
        self.join(&name).await;
        self.ctx
            .registry
            .update_presence(self.id, &name, &PresenceFields::from(&info))
            .await?;

        self.identity = Some(Identity {
            user_id: info.user_id.clone(),
            user_name: info.user_name.clone(),
            color: info.color.clone(),
        });
        self.transition(PresenceState::Registered);
        log::info!("{} ({}) is present on {name}", info.user_name, info.user_id);
        Ok(())
    }

    async fn on_cursor_update(&mut self, update: CursorUpdate) -> Result<(), SyncError> {
        let Some(identity) = &self.identity else {
            return Err(SyncError::Validation(format!(
                "cursor-update from {} before user-info",
                update.user_id
            )));
        };
        if identity.user_id != update.user_id {
            return Err(SyncError::Validation(format!(
                "cursor-update for {} on a connection registered as {}",
                update.user_id, identity.user_id
            )));
        }

        let name = self.document(&update.filename)?;
        let moved = self.registration.as_ref().map(|r| &r.name) != Some(&name);
        let fields = if moved {
            PresenceFields {
                user_id: Some(identity.user_id.clone()),
                user_name: Some(identity.user_name.clone()),
                color: identity.color.clone(),
                ..PresenceFields::from(&update)
            }
        } else {
            PresenceFields::from(&update)
        };

        if moved {
            log::debug!("{} moved to {name}", update.user_id);
            self.join(&name).await;
        }
        self.ctx.registry.update_presence(self.id, &name, &fields).await?;
        log::trace!("Cursor of {} on {name}: {:?}", update.user_id, update.cursor_position);
        Ok(())
    }

    fn document(&self, filename: &str) -> Result<DocumentName, SyncError> {
        Ok(DocumentName::parse(&format!("{}/{filename}", self.session))?)
    }

    /// Make `name` the connection's only presence subscription.
    async fn join(&mut self, name: &DocumentName) {
        if self.registration.as_ref().map(|r| &r.name) == Some(name) {
            return;
        }
        if let Some(old) = self.registration.take() {
            let old_name = old.name.clone();
            // Stop relaying before the old room publishes our departure.
            drop(old);
            self.ctx.registry.unsubscribe(self.id, &old_name).await;
        }

        let rx = self.ctx.registry.subscribe(self.id, name, Channel::Presence).await;
        let room = self.ctx.registry.room(name).await;
        let forwarder = Forwarder::spawn(forward(self.id, room, self.out.clone(), rx));
        self.registration = Some(Registration {
            name: name.clone(),
            _forwarder: forwarder,
        });
    }

    fn transition(&mut self, next: PresenceState) {
        if self.state != next {
            log::debug!("Presence connection {}: {:?} -> {next:?}", self.id, self.state);
            self.state = next;
        }
    }

    async fn close(mut self) {
        self.transition(PresenceState::Closed);
        self.registration = None;
        let left = self.ctx.registry.on_close(self.id).await;
        log::info!(
            "Presence connection {} on session {} closed, left {} documents",
            self.id,
            self.session,
            left.len()
        );
    }
}

/// Relay presence sets of `room` to one connection. After a lag the full
/// current set is sent instead of the missed ones.
async fn forward(
    id: ConnectionId,
    room: Arc<Room>,
    out: Outbound,
    mut rx: broadcast::Receiver<Envelope>,
) {
    loop {
        let delivered = match rx.recv().await {
            Ok(envelope) if envelope.kind == EnvelopeKind::Presence => out.frame(&envelope.frame).await,
            Ok(_) => true,
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("{id} lagged {skipped} presence sets on {}", room.name());
                let users = room.presence().await;
                match (PresenceMessage::Presence { users }).encode() {
                    Ok(json) => out.send(Message::Text(json.into())).await,
                    Err(e) => {
                        log::error!("Failed to encode presence for {}: {e}", room.name());
                        true
                    }
                }
            }
            Err(RecvError::Closed) => {
                out.close(CloseCode::Policy, "page closed").await;
                break;
            }
        };
        if !delivered {
            break;
        }
    }
}
