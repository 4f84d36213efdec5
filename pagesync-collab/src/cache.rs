//! Document state cache.
//!
//! Holds the authoritative [`DocumentState`] of every active document and is
//! the only place that mutates one. Each document sits behind its own async
//! mutex, so all merges for a document are serialized while different
//! documents proceed in parallel.
//!
//! ```text
//!              ┌────────────────────────────────────────────┐
//!  apply() ──► │ slots: RwLock<HashMap<DocumentName, Slot>> │
//!              │   Slot { state: Mutex<Option<Doc>>, queue }│
//!              └──────────────┬─────────────────────────────┘
//!                             │ first access
//!                             ▼
//!        OperationLog snapshot + tail ─► PageStore field ─► empty v0
//! ```
//!
//! Slot creation is double-checked under the write lock, and loading happens
//! under the slot's own mutex, so concurrent first accesses load once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use pagesync_core::{DocumentName, DocumentState, Revision, SessionId, Snapshot, TextOp};

use crate::error::{StoreError, SyncError};
use crate::persist::{PersistJob, PersistQueue, PersistStats, Persister};
use crate::protocol::Catchup;
use crate::storage::{OperationLog, PageStore, SessionDirectory};

/// Result of a successful [`DocumentCache::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub revision: Revision,
    pub base_version: u64,
    /// Part of the op conflicted with the current text and was dropped;
    /// the submitter should resync.
    pub degraded: bool,
    pub content: String,
}

/// Cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub documents: usize,
    /// Cold loads from storage
    pub loads: u64,
    pub applied: u64,
    pub persist: PersistStats,
}

struct Slot {
    state: Mutex<Option<DocumentState>>,
    queue: PersistQueue,
}

pub struct DocumentCache {
    slots: RwLock<HashMap<DocumentName, Arc<Slot>>>,
    log: Arc<dyn OperationLog>,
    pages: Arc<dyn PageStore>,
    sessions: Arc<dyn SessionDirectory>,
    persister: Persister,
    history_limit: usize,
    loads: AtomicU64,
    applied: AtomicU64,
}

impl DocumentCache {
    pub fn new(
        log: Arc<dyn OperationLog>,
        pages: Arc<dyn PageStore>,
        sessions: Arc<dyn SessionDirectory>,
        persister: Persister,
        history_limit: usize,
    ) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            log,
            pages,
            sessions,
            persister,
            history_limit,
            loads: AtomicU64::new(0),
            applied: AtomicU64::new(0),
        }
    }

    /// Current snapshot of `name`, loading it on first access.
    pub async fn get_or_create(&self, name: &DocumentName) -> Result<Snapshot, SyncError> {
        let slot = self.slot(name).await?;
        let mut guard = slot.state.lock().await;
        let state = self.ensure_loaded(name, &mut guard).await?;
        Ok(state.snapshot())
    }

    /// Alias of [`get_or_create`](Self::get_or_create), used on resync paths.
    pub async fn snapshot(&self, name: &DocumentName) -> Result<Snapshot, SyncError> {
        self.get_or_create(name).await
    }

    /// Catch-up data for a client at `since`, plus the version it leads to.
    ///
    /// Operations when the history still covers `since`, otherwise a snapshot.
    pub async fn catch_up(&self, name: &DocumentName, since: u64) -> Result<(Catchup, u64), SyncError> {
        let slot = self.slot(name).await?;
        let mut guard = slot.state.lock().await;
        let state = self.ensure_loaded(name, &mut guard).await?;

        let catchup = match state.revisions_since(since) {
            Some(revisions) => Catchup::Operations(revisions),
            None => Catchup::Snapshot(state.snapshot()),
        };
        Ok((catchup, state.version()))
    }

    /// Merge `op` (made against `base_version`) into the document.
    ///
    /// On success the new revision is queued for persistence and
    /// `on_applied` runs while the document lock is still held, so whatever
    /// it publishes is ordered exactly like the versions.
    pub async fn apply<F>(
        &self,
        name: &DocumentName,
        op: &TextOp,
        base_version: u64,
        on_applied: F,
    ) -> Result<Applied, SyncError>
    where
        F: FnOnce(&Applied) + Send,
    {
        let slot = self.slot(name).await?;
        let mut guard = slot.state.lock().await;
        let state = self.ensure_loaded(name, &mut guard).await?;

        let merged = state.merge(op, base_version)?;
        let degraded = merged.degraded;
        let revision = state.commit(merged);

        slot.queue.schedule(PersistJob {
            revision: revision.clone(),
            snapshot: state.snapshot(),
        });

        let applied = Applied {
            revision,
            base_version,
            degraded,
            content: state.content().to_owned(),
        };
        if degraded {
            log::warn!(
                "Op on {name} based on v{base_version} conflicted and was partially dropped (now v{})",
                applied.revision.version
            );
        }
        self.applied.fetch_add(1, Ordering::Relaxed);
        on_applied(&applied);
        Ok(applied)
    }

    /// Wait until everything accepted for `name` so far is persisted.
    pub async fn flush(&self, name: &DocumentName) {
        let slot = self.slots.read().await.get(name).cloned();
        if let Some(slot) = slot {
            slot.queue.flush().await;
        }
    }

    pub async fn flush_all(&self) {
        let slots: Vec<Arc<Slot>> = self.slots.read().await.values().cloned().collect();
        for slot in slots {
            slot.queue.flush().await;
        }
    }

    /// Drop every document of `session`, durable copies included. Returns
    /// how many documents were cached.
    pub async fn evict_session(&self, session: &SessionId) -> Result<usize, SyncError> {
        let evicted: Vec<(DocumentName, Arc<Slot>)> = {
            let mut slots = self.slots.write().await;
            let names: Vec<DocumentName> = slots
                .keys()
                .filter(|n| n.session() == session)
                .cloned()
                .collect();
            names
                .into_iter()
                .filter_map(|n| slots.remove(&n).map(|slot| (n, slot)))
                .collect()
        };

        // Let in-flight writes land before deleting, or they would resurrect
        // the document.
        for (_, slot) in &evicted {
            slot.queue.flush().await;
        }

        let log = self.log.clone();
        let session = session.clone();
        let removed = tokio::task::spawn_blocking(move || -> Result<usize, StoreError> {
            let mut removed = 0;
            for name in log.list()? {
                if name.session() == &session {
                    log.delete(&name)?;
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await??;

        log::info!(
            "Evicted {} cached documents, deleted {removed} stored documents",
            evicted.len()
        );
        Ok(evicted.len())
    }

    pub async fn is_cached(&self, name: &DocumentName) -> bool {
        self.slots.read().await.contains_key(name)
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            documents: self.slots.read().await.len(),
            loads: self.loads.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            persist: self.persister.stats(),
        }
    }

    // ─── Internals ────────────────────────────────────────────────────

    async fn slot(&self, name: &DocumentName) -> Result<Arc<Slot>, SyncError> {
        // Fast path: read lock
        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(name) {
                return Ok(slot.clone());
            }
        }

        if !self.sessions.exists(name.session()) {
            return Err(SyncError::UnknownSession(name.session().clone()));
        }

        // Slow path: write lock, re-check
        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.get(name) {
            return Ok(slot.clone());
        }
        let slot = Arc::new(Slot {
            state: Mutex::new(None),
            queue: self.persister.spawn(name.clone()),
        });
        slots.insert(name.clone(), slot.clone());
        Ok(slot)
    }

    async fn ensure_loaded<'a>(
        &self,
        name: &DocumentName,
        state: &'a mut Option<DocumentState>,
    ) -> Result<&'a mut DocumentState, SyncError> {
        if state.is_none() {
            *state = Some(self.load(name).await?);
        }
        state
            .as_mut()
            .ok_or_else(|| SyncError::Persistence(StoreError::Database(format!("{name} failed to load"))))
    }

    async fn load(&self, name: &DocumentName) -> Result<DocumentState, SyncError> {
        self.loads.fetch_add(1, Ordering::Relaxed);

        let log = self.log.clone();
        let doc = name.clone();
        let stored = tokio::task::spawn_blocking(move || log.load(&doc)).await??;

        if let Some(stored) = stored {
            let mut state = DocumentState::restore(stored.snapshot, stored.history, self.history_limit);
            for revision in &stored.tail {
                if let Err(e) = state.replay(revision) {
                    log::warn!("Stopped replaying {name} at v{}: {e}", revision.version);
                    break;
                }
            }
            log::info!("Loaded {name} at v{} from the operation log", state.version());
            return Ok(state);
        }

        let pages = self.pages.clone();
        let session = name.session().clone();
        let filename = name.filename().to_owned();
        let fields = tokio::task::spawn_blocking(move || pages.load(&session, &filename)).await??;

        let seeded = fields.and_then(|mut f| f.remove(name.field().key()));
        match seeded {
            Some(content) => {
                log::info!("Seeded {name} from its page file ({} bytes)", content.len());
                Ok(DocumentState::from_snapshot(
                    Snapshot::new(content, 0),
                    self.history_limit,
                ))
            }
            None => {
                log::debug!("Created empty document {name}");
                Ok(DocumentState::new(self.history_limit))
            }
        }
    }
}
