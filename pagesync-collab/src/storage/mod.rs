//! Durable storage behind the document cache.
//!
//! Architecture:
//! ```text
//! ┌───────────────┐  append / snapshot   ┌──────────────────────────────┐
//! │ Persist worker│ ───────────────────► │ OperationLog                 │
//! │ (per document)│                      │  RocksLog   — RocksDB + LZ4  │
//! └──────┬────────┘                      │  MemoryLog  — tests          │
//!        │ save(fields)                  └──────────────────────────────┘
//!        ▼
//! ┌───────────────┐   resolve(session)   ┌──────────────────────────────┐
//! │ PageStore     │ ───────────────────► │ SessionDirectory             │
//! │ (JSON files)  │                      │ (one directory per session)  │
//! └───────────────┘                      └──────────────────────────────┘
//! ```
//!
//! All traits here are synchronous; async callers go through
//! `tokio::task::spawn_blocking`.

pub mod memory;
pub mod pages;
pub mod rocks;
pub mod sessions;

use pagesync_core::{DocumentName, Revision, Snapshot};

pub use crate::error::StoreError;
pub use memory::MemoryLog;
pub use pages::{FsPageStore, MemoryPageStore, PageFields, PageStore};
pub use rocks::{DocumentMetadata, RocksLog, StoreConfig};
pub use sessions::{FsSessions, MemorySessions, SessionDirectory};

/// What the op log knows about a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub snapshot: Snapshot,
    /// Logged ops up to and including the snapshot version, oldest first.
    pub history: Vec<Revision>,
    /// Logged ops newer than the snapshot, to be replayed on load.
    pub tail: Vec<Revision>,
}

/// Durable per-document op log with upserted snapshots.
pub trait OperationLog: Send + Sync {
    /// `None` when no snapshot was ever saved for `name`.
    fn load(&self, name: &DocumentName) -> Result<Option<StoredDocument>, StoreError>;

    fn append(&self, name: &DocumentName, revision: &Revision) -> Result<(), StoreError>;

    /// Upsert: repeated saves replace the previous snapshot.
    fn save_snapshot(&self, name: &DocumentName, snapshot: &Snapshot) -> Result<(), StoreError>;

    /// Drop logged ops with `version <= up_to_version`. Returns how many.
    fn compact(&self, name: &DocumentName, up_to_version: u64) -> Result<u64, StoreError>;

    fn delete(&self, name: &DocumentName) -> Result<(), StoreError>;

    fn list(&self) -> Result<Vec<DocumentName>, StoreError>;
}

/// Split logged revisions around the snapshot version.
pub(crate) fn split_at_snapshot(
    snapshot: Snapshot,
    revisions: Vec<Revision>,
) -> StoredDocument {
    let (history, tail) = revisions
        .into_iter()
        .partition(|r| r.version <= snapshot.version);
    StoredDocument {
        snapshot,
        history,
        tail,
    }
}
