//! Error taxonomy for the collaboration layer.
//!
//! - [`StoreError`] — a storage backend failed (op log, page store)
//! - [`ProtocolError`] — a wire frame could not be encoded or decoded
//! - [`SyncError`] — everything a connection handler can run into; the
//!   variants map one-to-one onto how the server reacts

use pagesync_core::{MergeError, NameError, SessionId};
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("session {0} has no storage location")]
    MissingSession(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("unexpected message type")]
    InvalidMessageType,

    #[error("connection closed")]
    ConnectionClosed,
}

/// Errors surfaced while serving a connection.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// Malformed operation or address. Dropped, never broadcast.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The client is too far behind; it must resync from a snapshot.
    #[error("stale operation based on v{base_version}, oldest transformable base is v{oldest_available}")]
    StaleOperation {
        base_version: u64,
        oldest_available: u64,
    },

    /// An update arrived before the document handshake finished.
    #[error("document {0} is not synchronized on this connection")]
    NotSynchronized(String),

    #[error("session {0} does not exist")]
    UnknownSession(SessionId),

    /// Durable storage failed. Never rolls back in-memory state.
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),

    /// Malformed wire frame. Closes the offending connection.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// Connection-level failure. Only triggers registry cleanup.
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<MergeError> for SyncError {
    fn from(e: MergeError) -> Self {
        match e {
            MergeError::Stale {
                base_version,
                oldest_available,
            } => SyncError::StaleOperation {
                base_version,
                oldest_available,
            },
            MergeError::Validation(msg) | MergeError::Mismatch(msg) => SyncError::Validation(msg),
        }
    }
}

impl From<NameError> for SyncError {
    fn from(e: NameError) -> Self {
        SyncError::Validation(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        SyncError::Persistence(StoreError::Io(format!("storage task failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_errors_map_onto_taxonomy() {
        let stale: SyncError = MergeError::Stale {
            base_version: 1,
            oldest_available: 4,
        }
        .into();
        assert!(matches!(
            stale,
            SyncError::StaleOperation {
                base_version: 1,
                oldest_available: 4
            }
        ));

        let invalid: SyncError = MergeError::Validation("no path".into()).into();
        assert!(matches!(invalid, SyncError::Validation(_)));
    }

    #[test]
    fn test_store_error_display() {
        let e = StoreError::Io("disk full".into());
        assert_eq!(e.to_string(), "I/O error: disk full");
        let wrapped = SyncError::from(e);
        assert_eq!(wrapped.to_string(), "persistence failed: I/O error: disk full");
    }
}
