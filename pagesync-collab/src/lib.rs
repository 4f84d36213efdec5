//! # pagesync-collab — Real-time collaboration server for page documents
//!
//! Serves concurrent text editing of session pages over WebSockets, using
//! operational transformation from `pagesync-core`.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   /sync/<session>   ┌──────────────────────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer                   │
//! │ (per doc)   │   bincode frames    │   DocumentCache (authority)  │
//! └─────────────┘                     │   ConnectionRegistry (rooms) │
//! ┌─────────────┐ /presence/<session> │   Persister (retry queue)    │
//! │ editor UI   │ ◄─────────────────► │                              │
//! └─────────────┘   JSON frames       └──────────────┬───────────────┘
//!                                                    │
//!                                     ┌──────────────┴───────────────┐
//!                                     ▼                              ▼
//!                              OperationLog (RocksDB)        PageStore (JSON)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire protocol of the sync channel
//! - [`presence`] — JSON messages of the presence channel
//! - [`registry`] — rooms, subscriptions and broadcast fan-out
//! - [`cache`] — authoritative document states, merge and catch-up
//! - [`persist`] — per-document persistence workers with retry and alerting
//! - [`storage`] — op log, page files and session directories
//! - [`server`] — WebSocket server and connection routing
//! - [`client`] — reference sync client
//! - [`config`] — server configuration

pub mod cache;
mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod persist;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use cache::{Applied, CacheStats, DocumentCache};
pub use client::{ClientStatus, ConnectionState, SyncClient, SyncEvent};
pub use config::ServerConfig;
pub use error::{ProtocolError, StoreError, SyncError};
pub use persist::{LogAlert, PersistStats, PersistenceAlert, Persister, RetryPolicy};
pub use presence::{CursorUpdate, PresenceMessage, PresenceRecord, UserInfo};
pub use protocol::{Catchup, ErrorCode, ErrorReport, MessageType, SyncMessage};
pub use registry::{ConnectionId, ConnectionRegistry, Room};
pub use server::{Collaborators, ServerStats, SyncServer};
pub use storage::{
    DocumentMetadata, FsPageStore, FsSessions, MemoryLog, MemoryPageStore, MemorySessions,
    OperationLog, PageStore, RocksLog, SessionDirectory, StoreConfig,
};
