//! Background persistence of accepted operations.
//!
//! Every cached document owns one worker task fed by an unbounded FIFO queue,
//! so writes for a document land in acceptance order while the merge path
//! never waits on disk:
//!
//! ```text
//! DocumentCache::apply ──► PersistQueue ──► worker ──┬─► OperationLog::append     (each op)
//!   (under doc lock)         (FIFO)         (task)    ├─► OperationLog::save_snapshot (latest)
//!                                                     ├─► OperationLog::compact    (best effort)
//!                                                     └─► PageStore::save          (latest)
//! ```
//!
//! Whatever has queued up while the worker was busy is written as one batch:
//! all ops appended in order, then a single snapshot and page write for the
//! newest state. Failed steps retry with exponential backoff; once the retry
//! budget is spent the [`PersistenceAlert`] fires and the worker moves on.
//! In-memory state is never rolled back.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use pagesync_core::{DocumentName, Revision, Snapshot};

use crate::error::StoreError;
use crate::storage::{OperationLog, PageFields, PageStore};

/// Backoff schedule for failed storage writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per write, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay_ms: 50,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    pub fn for_testing() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
        }
    }

    /// Delay after the `attempt`-th failure (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay_ms`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Hook fired when a write is abandoned after exhausting its retries.
pub trait PersistenceAlert: Send + Sync {
    fn persistence_failed(&self, name: &DocumentName, version: u64, error: &StoreError);
}

/// Default alert: an error-level log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlert;

impl PersistenceAlert for LogAlert {
    fn persistence_failed(&self, name: &DocumentName, version: u64, error: &StoreError) {
        log::error!("Giving up persisting {name} at v{version}: {error}");
    }
}

/// Persistence counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistStats {
    /// Operations whose batch completed (including abandoned writes)
    pub persisted: u64,
    /// Batches written
    pub batches: u64,
    pub retries: u64,
    /// Writes abandoned after the retry budget
    pub failures: u64,
}

#[derive(Debug, Default)]
struct AtomicPersistStats {
    persisted: AtomicU64,
    batches: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

/// One accepted operation plus the document state it produced.
#[derive(Debug, Clone)]
pub(crate) struct PersistJob {
    pub revision: Revision,
    pub snapshot: Snapshot,
}

enum Job {
    Persist(PersistJob),
    Flush(oneshot::Sender<()>),
}

/// Sending half of a document's persistence queue.
pub(crate) struct PersistQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl PersistQueue {
    pub fn schedule(&self, job: PersistJob) {
        let version = job.revision.version;
        if self.tx.send(Job::Persist(job)).is_err() {
            log::error!("Persistence worker stopped; v{version} will not be written");
        }
    }

    /// Resolves once everything scheduled before this call has been written
    /// (or abandoned).
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Job::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Spawns and feeds per-document persistence workers.
#[derive(Clone)]
pub struct Persister {
    inner: Arc<Inner>,
}

struct Inner {
    log: Arc<dyn OperationLog>,
    pages: Arc<dyn PageStore>,
    policy: RetryPolicy,
    alert: Arc<dyn PersistenceAlert>,
    retain_operations: u64,
    stats: AtomicPersistStats,
}

impl Persister {
    pub fn new(
        log: Arc<dyn OperationLog>,
        pages: Arc<dyn PageStore>,
        policy: RetryPolicy,
        alert: Arc<dyn PersistenceAlert>,
        retain_operations: u64,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                log,
                pages,
                policy,
                alert,
                retain_operations,
                stats: AtomicPersistStats::default(),
            }),
        }
    }

    /// Start the worker for `name`. It stops once the queue is dropped and
    /// drained.
    pub(crate) fn spawn(&self, name: DocumentName) -> PersistQueue {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(name, rx, self.inner.clone()));
        PersistQueue { tx }
    }

    pub fn stats(&self) -> PersistStats {
        let s = &self.inner.stats;
        PersistStats {
            persisted: s.persisted.load(Ordering::Relaxed),
            batches: s.batches.load(Ordering::Relaxed),
            retries: s.retries.load(Ordering::Relaxed),
            failures: s.failures.load(Ordering::Relaxed),
        }
    }
}

async fn run_worker(name: DocumentName, mut rx: mpsc::UnboundedReceiver<Job>, inner: Arc<Inner>) {
    log::debug!("Persistence worker for {name} started");

    while let Some(first) = rx.recv().await {
        let mut batch = Vec::new();
        let mut waiters = Vec::new();

        let mut next = Some(first);
        while let Some(job) = next {
            match job {
                Job::Persist(job) => batch.push(job),
                Job::Flush(done) => waiters.push(done),
            }
            next = rx.try_recv().ok();
        }

        if !batch.is_empty() {
            inner.write_batch(&name, batch).await;
        }
        for done in waiters {
            let _ = done.send(());
        }
    }

    log::debug!("Persistence worker for {name} stopped");
}

impl Inner {
    async fn write_batch(&self, name: &DocumentName, batch: Vec<PersistJob>) {
        let count = batch.len() as u64;
        let mut latest = None;

        for job in batch {
            let log = self.log.clone();
            let doc = name.clone();
            let revision = job.revision.clone();
            self.with_retry(name, job.revision.version, move || log.append(&doc, &revision))
                .await;
            latest = Some(job.snapshot);
        }

        if let Some(snapshot) = latest {
            let version = snapshot.version;

            let log = self.log.clone();
            let doc = name.clone();
            let snap = snapshot.clone();
            let saved = self
                .with_retry(name, version, move || log.save_snapshot(&doc, &snap))
                .await;

            if saved && version > self.retain_operations {
                self.compact(name, version - self.retain_operations).await;
            }

            let pages = self.pages.clone();
            let session = name.session().clone();
            let filename = name.filename().to_owned();
            let mut fields = PageFields::new();
            fields.insert(name.field().key().to_owned(), snapshot.content);
            self.with_retry(name, version, move || pages.save(&session, &filename, &fields))
                .await;

            log::trace!("Persisted {name} through v{version} ({count} ops)");
        }

        self.stats.persisted.fetch_add(count, Ordering::Relaxed);
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
    }

    /// Old ops are only an optimization for late clients, so a failed
    /// compaction is logged and left for the next batch.
    async fn compact(&self, name: &DocumentName, up_to: u64) {
        let log = self.log.clone();
        let doc = name.clone();
        match tokio::task::spawn_blocking(move || log.compact(&doc, up_to)).await {
            Ok(Ok(removed)) if removed > 0 => {
                log::debug!("Compacted {removed} ops of {name} up to v{up_to}")
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => log::warn!("Compaction of {name} failed: {e}"),
            Err(e) => log::warn!("Compaction task for {name} failed: {e}"),
        }
    }

    /// Run a blocking storage write until it succeeds or the policy gives up.
    /// Returns whether it eventually succeeded.
    async fn with_retry<F>(&self, name: &DocumentName, version: u64, write: F) -> bool
    where
        F: Fn() -> Result<(), StoreError> + Send + Sync + 'static,
    {
        let write = Arc::new(write);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let call = write.clone();
            let result = match tokio::task::spawn_blocking(move || call()).await {
                Ok(result) => result,
                Err(e) => Err(StoreError::Io(format!("storage task failed: {e}"))),
            };

            let error = match result {
                Ok(()) => return true,
                Err(e) => e,
            };

            if attempt >= self.policy.max_attempts.max(1) {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                self.alert.persistence_failed(name, version, &error);
                return false;
            }

            let delay = self.policy.delay(attempt);
            self.stats.retries.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "Persisting {name} v{version} failed (attempt {attempt}/{}), retrying in {delay:?}: {error}",
                self.policy.max_attempts
            );
            tokio::time::sleep(delay).await;
        }
    }
}
