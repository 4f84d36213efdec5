//! Connection registry: who is subscribed to which document.
//!
//! One [`Room`] per document, each with two broadcast channels:
//!
//! ```text
//!                    ┌──────────── Room "s1/page.hml" ────────────┐
//! cache.apply ──────►│ updates:  Update / Awareness envelopes     │──► sync forwarders
//! (under doc lock)   │ presence: full presence set (JSON)         │──► presence forwarders
//!                    │ members:  conn → { channel, presence, … }  │
//!                    └────────────────────────────────────────────┘
//! ```
//!
//! Receivers are handed out by [`ConnectionRegistry::subscribe`]; filtering
//! of a connection's own envelopes is the forwarder's job. Rooms are created
//! on first subscription and only removed when their session is deleted, so
//! a room handle taken before a merge is the one every later subscriber
//! listens on.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use pagesync_core::{DocumentName, SessionId};

use crate::error::SyncError;
use crate::presence::{PresenceFields, PresenceMessage, PresenceRecord};
use crate::protocol::SyncMessage;

/// Server-assigned id of one WebSocket connection.
pub type ConnectionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Sync,
    Presence,
}

/// Pre-encoded frame shared by all receivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Arc<Vec<u8>>),
    Text(Arc<str>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Update { version: u64, degraded: bool },
    Awareness,
    Presence,
}

/// One broadcast item.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Connection the change came from, if any.
    pub origin: Option<ConnectionId>,
    pub kind: EnvelopeKind,
    pub frame: Frame,
}

#[derive(Debug, Clone)]
struct Member {
    channel: Channel,
    presence: Option<PresenceRecord>,
    awareness: Option<Vec<u8>>,
}

/// Room statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub messages_sent: u64,
    pub presence_sent: u64,
    pub members: usize,
}

#[derive(Debug, Default)]
struct AtomicRoomStats {
    messages_sent: AtomicU64,
    presence_sent: AtomicU64,
}

/// Subscribers of a single document.
pub struct Room {
    name: DocumentName,
    updates: broadcast::Sender<Envelope>,
    presence: broadcast::Sender<Envelope>,
    members: RwLock<HashMap<ConnectionId, Member>>,
    stats: AtomicRoomStats,
}

impl Room {
    fn new(name: DocumentName, capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity);
        let (presence, _) = broadcast::channel(capacity);
        Self {
            name,
            updates,
            presence,
            members: RwLock::new(HashMap::new()),
            stats: AtomicRoomStats::default(),
        }
    }

    pub fn name(&self) -> &DocumentName {
        &self.name
    }

    /// Fan an envelope out to the matching channel. Returns receiver count.
    pub fn send(&self, envelope: Envelope) -> usize {
        match envelope.kind {
            EnvelopeKind::Presence => {
                self.stats.presence_sent.fetch_add(1, Ordering::Relaxed);
                self.presence.send(envelope).unwrap_or(0)
            }
            _ => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                self.updates.send(envelope).unwrap_or(0)
            }
        }
    }

    /// Current presence set, sorted by user id.
    pub async fn presence(&self) -> Vec<PresenceRecord> {
        collect_presence(&*self.members.read().await)
    }

    /// Known awareness states of sync members.
    pub async fn awareness(&self) -> Vec<(ConnectionId, Vec<u8>)> {
        self.members
            .read()
            .await
            .iter()
            .filter_map(|(id, m)| m.awareness.clone().map(|a| (*id, a)))
            .collect()
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn stats(&self) -> RoomStats {
        RoomStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            presence_sent: self.stats.presence_sent.load(Ordering::Relaxed),
            members: self.member_count().await,
        }
    }

    async fn join(&self, conn: ConnectionId, channel: Channel) -> broadcast::Receiver<Envelope> {
        let mut members = self.members.write().await;
        members.entry(conn).or_insert(Member {
            channel,
            presence: None,
            awareness: None,
        });
        // Subscribe while holding the member lock: nothing published after
        // the membership change can be missed.
        match channel {
            Channel::Sync => self.updates.subscribe(),
            Channel::Presence => self.presence.subscribe(),
        }
    }

    async fn leave(&self, conn: &ConnectionId) -> bool {
        let mut members = self.members.write().await;
        let Some(member) = members.remove(conn) else {
            return false;
        };
        if member.presence.is_some() {
            self.publish_presence(&members);
        }
        if member.awareness.is_some() {
            // Empty state tells peers to drop this connection's awareness.
            self.publish_awareness(*conn, Vec::new());
        }
        log::debug!("{conn} left {} ({:?})", self.name, member.channel);
        true
    }

    async fn update_presence(
        &self,
        conn: &ConnectionId,
        fields: &PresenceFields,
    ) -> Result<Vec<PresenceRecord>, SyncError> {
        let mut members = self.members.write().await;
        let member = members
            .get_mut(conn)
            .ok_or_else(|| SyncError::Validation(format!("{conn} is not subscribed to {}", self.name)))?;

        match member.presence.as_mut() {
            Some(record) => fields.apply_to(record),
            None => {
                let record = fields
                    .to_record(&self.name.logical_name())
                    .ok_or_else(|| SyncError::Validation("presence requires a user id".into()))?;
                member.presence = Some(record);
            }
        }

        Ok(self.publish_presence(&members))
    }

    async fn set_awareness(&self, conn: &ConnectionId, state: Vec<u8>) -> Result<usize, SyncError> {
        let mut members = self.members.write().await;
        let member = members
            .get_mut(conn)
            .ok_or_else(|| SyncError::Validation(format!("{conn} is not subscribed to {}", self.name)))?;
        member.awareness = Some(state.clone());
        Ok(self.publish_awareness(*conn, state))
    }

    /// Caller holds the member lock, which orders presence broadcasts.
    fn publish_presence(&self, members: &HashMap<ConnectionId, Member>) -> Vec<PresenceRecord> {
        let users = collect_presence(members);
        match (PresenceMessage::Presence { users: users.clone() }).encode() {
            Ok(json) => {
                self.send(Envelope {
                    origin: None,
                    kind: EnvelopeKind::Presence,
                    frame: Frame::Text(json.into()),
                });
            }
            Err(e) => log::error!("Failed to encode presence for {}: {e}", self.name),
        }
        users
    }

    fn publish_awareness(&self, conn: ConnectionId, state: Vec<u8>) -> usize {
        let msg = SyncMessage::awareness(conn, &self.name.logical_name(), state);
        match msg.encode() {
            Ok(bytes) => self.send(Envelope {
                origin: Some(conn),
                kind: EnvelopeKind::Awareness,
                frame: Frame::Binary(Arc::new(bytes)),
            }),
            Err(e) => {
                log::error!("Failed to encode awareness for {}: {e}", self.name);
                0
            }
        }
    }
}

fn collect_presence(members: &HashMap<ConnectionId, Member>) -> Vec<PresenceRecord> {
    let mut users: Vec<PresenceRecord> = members
        .values()
        .filter_map(|m| m.presence.clone())
        .collect();
    users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
    users
}

/// Registry-wide statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub rooms: usize,
    pub connections: usize,
}

/// Maps documents to rooms and connections to their subscriptions.
pub struct ConnectionRegistry {
    rooms: RwLock<HashMap<DocumentName, Arc<Room>>>,
    connections: RwLock<HashMap<ConnectionId, HashSet<DocumentName>>>,
    capacity: usize,
}

impl ConnectionRegistry {
    /// `capacity` is the per-receiver broadcast buffer; a receiver that falls
    /// further behind observes a lag and must resync.
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Get or create the room for `name`.
    pub async fn room(&self, name: &DocumentName) -> Arc<Room> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(name) {
                return room.clone();
            }
        }

        // Slow path: write lock, double-check
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(name) {
            return room.clone();
        }
        let room = Arc::new(Room::new(name.clone(), self.capacity));
        rooms.insert(name.clone(), room.clone());
        log::debug!("Created room {name}");
        room
    }

    pub async fn find_room(&self, name: &DocumentName) -> Option<Arc<Room>> {
        self.rooms.read().await.get(name).cloned()
    }

    /// Add `conn` to the document's room. Idempotent.
    pub async fn subscribe(
        &self,
        conn: ConnectionId,
        name: &DocumentName,
        channel: Channel,
    ) -> broadcast::Receiver<Envelope> {
        let room = self.room(name).await;
        let rx = room.join(conn, channel).await;
        self.connections
            .write()
            .await
            .entry(conn)
            .or_default()
            .insert(name.clone());
        rx
    }

    /// Remove `conn` from one document. Returns whether it was subscribed.
    pub async fn unsubscribe(&self, conn: ConnectionId, name: &DocumentName) -> bool {
        {
            let mut connections = self.connections.write().await;
            if let Some(docs) = connections.get_mut(&conn) {
                docs.remove(name);
                if docs.is_empty() {
                    connections.remove(&conn);
                }
            }
        }
        match self.find_room(name).await {
            Some(room) => room.leave(&conn).await,
            None => false,
        }
    }

    /// Remove `conn` from everything. Safe to call more than once; later
    /// calls find nothing and broadcast nothing.
    pub async fn on_close(&self, conn: ConnectionId) -> Vec<DocumentName> {
        let docs = self.connections.write().await.remove(&conn);
        let Some(docs) = docs else {
            return Vec::new();
        };

        let mut left = Vec::with_capacity(docs.len());
        for name in docs {
            if let Some(room) = self.find_room(&name).await {
                if room.leave(&conn).await {
                    left.push(name);
                }
            }
        }
        left.sort();
        log::debug!("Connection {conn} closed, left {} documents", left.len());
        left
    }

    /// Merge presence fields for `conn` on `name` and broadcast the new set.
    pub async fn update_presence(
        &self,
        conn: ConnectionId,
        name: &DocumentName,
        fields: &PresenceFields,
    ) -> Result<Vec<PresenceRecord>, SyncError> {
        let room = self
            .find_room(name)
            .await
            .ok_or_else(|| SyncError::Validation(format!("no subscribers on {name}")))?;
        room.update_presence(&conn, fields).await
    }

    /// Store and broadcast `conn`'s awareness state on `name`.
    pub async fn set_awareness(
        &self,
        conn: ConnectionId,
        name: &DocumentName,
        state: Vec<u8>,
    ) -> Result<usize, SyncError> {
        let room = self
            .find_room(name)
            .await
            .ok_or_else(|| SyncError::Validation(format!("no subscribers on {name}")))?;
        room.set_awareness(&conn, state).await
    }

    pub async fn awareness(&self, name: &DocumentName) -> Vec<(ConnectionId, Vec<u8>)> {
        match self.find_room(name).await {
            Some(room) => room.awareness().await,
            None => Vec::new(),
        }
    }

    /// Send an envelope to every subscriber of `name`. Envelopes whose origin
    /// is a receiving connection are filtered by that connection's forwarder.
    pub async fn broadcast(&self, name: &DocumentName, envelope: Envelope) -> usize {
        match self.find_room(name).await {
            Some(room) => room.send(envelope),
            None => 0,
        }
    }

    pub async fn presence(&self, name: &DocumentName) -> Vec<PresenceRecord> {
        match self.find_room(name).await {
            Some(room) => room.presence().await,
            None => Vec::new(),
        }
    }

    pub async fn subscriptions(&self, conn: ConnectionId) -> Vec<DocumentName> {
        let mut docs: Vec<DocumentName> = self
            .connections
            .read()
            .await
            .get(&conn)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default();
        docs.sort();
        docs
    }

    /// Drop every room of `session`. Dropping a room's senders ends its
    /// forwarders. Returns the number of rooms removed.
    pub async fn drop_session(&self, session: &SessionId) -> usize {
        let removed = {
            let mut rooms = self.rooms.write().await;
            let before = rooms.len();
            rooms.retain(|name, _| name.session() != session);
            before - rooms.len()
        };

        let mut connections = self.connections.write().await;
        for docs in connections.values_mut() {
            docs.retain(|name| name.session() != session);
        }
        connections.retain(|_, docs| !docs.is_empty());

        log::info!("Dropped {removed} rooms of session {session}");
        removed
    }

    pub async fn stats(&self) -> RegistryStats {
        RegistryStats {
            rooms: self.rooms.read().await.len(),
            connections: self.connections.read().await.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    fn doc(raw: &str) -> DocumentName {
        DocumentName::parse(raw).unwrap()
    }

    fn user(id: &str) -> PresenceFields {
        PresenceFields {
            user_id: Some(id.into()),
            user_name: Some(id.to_uppercase()),
            ..PresenceFields::default()
        }
    }

    fn presence_users(envelope: &Envelope) -> Vec<String> {
        let Frame::Text(json) = &envelope.frame else {
            panic!("presence must be text");
        };
        match PresenceMessage::decode(json).unwrap() {
            PresenceMessage::Presence { users } => users.into_iter().map(|u| u.user_id).collect(),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent() {
        let registry = ConnectionRegistry::new(16);
        let conn = Uuid::new_v4();
        let name = doc("s1/page.hml");

        let _a = registry.subscribe(conn, &name, Channel::Sync).await;
        let _b = registry.subscribe(conn, &name, Channel::Sync).await;

        let room = registry.room(&name).await;
        assert_eq!(room.member_count().await, 1);
        assert_eq!(registry.subscriptions(conn).await, vec![name]);
    }

    #[tokio::test]
    async fn test_presence_broadcast_reaches_originator_sorted() {
        let registry = ConnectionRegistry::new(16);
        let name = doc("s1/page.hml");
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let mut rx_a = registry.subscribe(a, &name, Channel::Presence).await;
        let mut rx_b = registry.subscribe(b, &name, Channel::Presence).await;

        registry.update_presence(b, &name, &user("zed")).await.unwrap();
        let users = registry.update_presence(a, &name, &user("amy")).await.unwrap();
        assert_eq!(users[0].user_id, "amy");
        assert_eq!(users[0].filename, "page.hml");

        assert_eq!(presence_users(&rx_a.recv().await.unwrap()), vec!["zed"]);
        assert_eq!(presence_users(&rx_a.recv().await.unwrap()), vec!["amy", "zed"]);
        assert_eq!(presence_users(&rx_b.recv().await.unwrap()), vec!["zed"]);
        assert_eq!(presence_users(&rx_b.recv().await.unwrap()), vec!["amy", "zed"]);
    }

    #[tokio::test]
    async fn test_on_close_removes_presence_once() {
        let registry = ConnectionRegistry::new(16);
        let name = doc("s1/page.hml");
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let _rx_a = registry.subscribe(a, &name, Channel::Presence).await;
        let mut rx_b = registry.subscribe(b, &name, Channel::Presence).await;
        registry.update_presence(a, &name, &user("amy")).await.unwrap();
        rx_b.recv().await.unwrap();

        assert_eq!(registry.on_close(a).await, vec![name.clone()]);
        assert!(presence_users(&rx_b.recv().await.unwrap()).is_empty());

        // Second close is a no-op
        assert!(registry.on_close(a).await.is_empty());
        assert!(matches!(rx_b.try_recv(), Err(TryRecvError::Empty)));
        assert!(registry.presence(&name).await.is_empty());
    }

    #[tokio::test]
    async fn test_presence_requires_user_id_first() {
        let registry = ConnectionRegistry::new(16);
        let name = doc("s1/page.hml");
        let conn = Uuid::new_v4();
        let _rx = registry.subscribe(conn, &name, Channel::Presence).await;

        let cursor_only = PresenceFields {
            cursor_position: Some(4),
            ..PresenceFields::default()
        };
        assert!(registry.update_presence(conn, &name, &cursor_only).await.is_err());
        assert!(registry.presence(&name).await.is_empty());
    }

    #[tokio::test]
    async fn test_awareness_is_cleared_on_leave() {
        let registry = ConnectionRegistry::new(16);
        let name = doc("s1/page.hml");
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let _rx_a = registry.subscribe(a, &name, Channel::Sync).await;
        let mut rx_b = registry.subscribe(b, &name, Channel::Sync).await;

        registry.set_awareness(a, &name, vec![1, 2]).await.unwrap();
        let envelope = rx_b.recv().await.unwrap();
        assert_eq!(envelope.origin, Some(a));
        assert_eq!(registry.awareness(&name).await, vec![(a, vec![1, 2])]);

        registry.unsubscribe(a, &name).await;
        let Frame::Binary(bytes) = rx_b.recv().await.unwrap().frame else {
            panic!("awareness must be binary");
        };
        let msg = SyncMessage::decode(&bytes).unwrap();
        assert_eq!(msg.peer_id, a);
        assert!(msg.payload.is_empty());
    }

    #[tokio::test]
    async fn test_lagging_receiver_observes_lag() {
        let registry = ConnectionRegistry::new(4);
        let name = doc("s1/page.hml");
        let mut rx = registry.subscribe(Uuid::new_v4(), &name, Channel::Sync).await;

        for version in 1..=10 {
            registry
                .broadcast(
                    &name,
                    Envelope {
                        origin: None,
                        kind: EnvelopeKind::Update {
                            version,
                            degraded: false,
                        },
                        frame: Frame::Binary(Arc::new(vec![])),
                    },
                )
                .await;
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }

    #[tokio::test]
    async fn test_drop_session_removes_only_its_rooms() {
        let registry = ConnectionRegistry::new(16);
        let conn = Uuid::new_v4();
        let _a = registry.subscribe(conn, &doc("s1/a"), Channel::Sync).await;
        let _b = registry.subscribe(conn, &doc("s1/b-details"), Channel::Sync).await;
        let _c = registry.subscribe(conn, &doc("s2/a"), Channel::Sync).await;

        assert_eq!(registry.drop_session(&SessionId::new("s1").unwrap()).await, 2);
        assert_eq!(registry.stats().await.rooms, 1);
        assert_eq!(registry.subscriptions(conn).await, vec![doc("s2/a")]);
    }
}
