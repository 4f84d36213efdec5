//! Binary protocol of the `/sync/<sessionId>` channel.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬───────────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc           │ version  │ payload  │
//! │ 1 byte   │ 16 bytes  │ len + UTF-8   │ varint   │ variable │
//! └──────────┴───────────┴───────────────┴──────────┴──────────┘
//! ```
//!
//! `doc` is the document name relative to the connection's session
//! (`page.hml`, `page.hml-details`). Payloads are bincode as well:
//!
//! | Type      | Direction | `version`            | payload               |
//! |-----------|-----------|----------------------|-----------------------|
//! | SyncStep1 | C → S     | client's version     | empty                 |
//! | SyncStep1 | S → C     | server's version     | empty                 |
//! | SyncStep2 | S → C     | server's version     | [`Catchup`]           |
//! | SyncStep2 | C → S     | base of pending op   | `Option<Operation>`   |
//! | Update    | C → S     | base version         | `Operation`           |
//! | Update    | S → C     | resulting version    | `TextOp`              |
//! | Awareness | both      | 0                    | opaque bytes          |
//! | Ack       | S → C     | version of client op | empty                 |
//! | Error     | S → C     | 0                    | [`ErrorReport`]       |
//! | Ping/Pong | both      | 0                    | empty                 |

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use pagesync_core::{DocumentName, Operation, Revision, SessionId, Snapshot, TextOp};

pub use crate::error::ProtocolError;
use crate::error::SyncError;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Handshake: announce version
    SyncStep1 = 1,
    /// Handshake: catch-up data (server) or pending local op (client)
    SyncStep2 = 2,
    /// One text operation
    Update = 3,
    /// Opaque per-peer awareness state
    Awareness = 4,
    /// The sender's own update was accepted
    Ack = 5,
    /// Operation rejected
    Error = 6,
    Ping = 7,
    Pong = 8,
}

/// What a (re)joining client needs to reach the server's version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Catchup {
    /// Every revision after the client's version, oldest first.
    Operations(Vec<Revision>),
    /// Client is too far behind (or ahead): replace local state.
    Snapshot(Snapshot),
}

/// Why an operation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Validation,
    /// Base version too old; a snapshot follows.
    Stale,
    /// Update sent before the document handshake completed.
    NotSynchronized,
    UnknownSession,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&SyncError> for ErrorReport {
    fn from(error: &SyncError) -> Self {
        let code = match error {
            SyncError::Validation(_) | SyncError::Protocol(_) => ErrorCode::Validation,
            SyncError::StaleOperation { .. } => ErrorCode::Stale,
            SyncError::NotSynchronized(_) => ErrorCode::NotSynchronized,
            SyncError::UnknownSession(_) => ErrorCode::UnknownSession,
            SyncError::Persistence(_) | SyncError::Transport(_) => ErrorCode::Internal,
        };
        Self {
            code,
            message: error.to_string(),
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Connection that originated the message (server-side id for relayed
    /// updates and awareness).
    pub peer_id: Uuid,
    pub doc: String,
    pub version: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, doc: impl Into<String>, version: u64) -> Self {
        Self {
            msg_type,
            peer_id,
            doc: doc.into(),
            version,
            payload: Vec::new(),
        }
    }

    fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Announce the sender's version of `doc`.
    pub fn sync_step1(peer_id: Uuid, doc: &str, version: u64) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, doc, version)
    }

    /// Server → client catch-up.
    pub fn catchup(doc: &str, version: u64, catchup: &Catchup) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::SyncStep2, Uuid::nil(), doc, version)
            .with_payload(encode_payload(catchup)?))
    }

    /// Client → server: handshake done, optionally carrying an edit made
    /// against `base_version` while disconnected.
    pub fn sync_done(
        peer_id: Uuid,
        doc: &str,
        base_version: u64,
        pending: Option<&Operation>,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::SyncStep2, peer_id, doc, base_version)
            .with_payload(encode_payload(&pending)?))
    }

    /// Client → server: an operation against `base_version`.
    pub fn submit(
        peer_id: Uuid,
        doc: &str,
        base_version: u64,
        op: &Operation,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Update, peer_id, doc, base_version)
            .with_payload(encode_payload(op)?))
    }

    /// Server → client: `op` produced `version`.
    pub fn update(origin: Uuid, doc: &str, version: u64, op: &TextOp) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Update, origin, doc, version).with_payload(encode_payload(op)?))
    }

    /// Awareness state of `peer_id`; an empty payload means the peer left.
    pub fn awareness(peer_id: Uuid, doc: &str, state: Vec<u8>) -> Self {
        Self::new(MessageType::Awareness, peer_id, doc, 0).with_payload(state)
    }

    pub fn ack(doc: &str, version: u64) -> Self {
        Self::new(MessageType::Ack, Uuid::nil(), doc, version)
    }

    pub fn error(doc: &str, report: &ErrorReport) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Error, Uuid::nil(), doc, 0).with_payload(encode_payload(report)?))
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, "", 0)
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, "", 0)
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Resolve `doc` inside `session`.
    pub fn document(&self, session: &SessionId) -> Result<DocumentName, SyncError> {
        Ok(DocumentName::parse(&format!("{session}/{}", self.doc))?)
    }

    // ─── Payload accessors ────────────────────────────────────────────

    pub fn catchup_payload(&self) -> Result<Catchup, ProtocolError> {
        self.expect(MessageType::SyncStep2)?;
        decode_payload(&self.payload)
    }

    pub fn pending_operation(&self) -> Result<Option<Operation>, ProtocolError> {
        self.expect(MessageType::SyncStep2)?;
        decode_payload(&self.payload)
    }

    pub fn operation(&self) -> Result<Operation, ProtocolError> {
        self.expect(MessageType::Update)?;
        decode_payload(&self.payload)
    }

    pub fn text_op(&self) -> Result<TextOp, ProtocolError> {
        self.expect(MessageType::Update)?;
        decode_payload(&self.payload)
    }

    pub fn error_report(&self) -> Result<ErrorReport, ProtocolError> {
        self.expect(MessageType::Error)?;
        decode_payload(&self.payload)
    }

    fn expect(&self, msg_type: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type == msg_type {
            Ok(())
        } else {
            Err(ProtocolError::InvalidMessageType)
        }
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}
