//! In-memory operation log for tests and ephemeral servers.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use pagesync_core::{DocumentName, Revision, Snapshot};

use super::{split_at_snapshot, OperationLog, StoredDocument};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct Entry {
    snapshot: Option<Snapshot>,
    operations: BTreeMap<u64, Revision>,
}

/// Volatile [`OperationLog`] with write failure injection.
#[derive(Debug, Default)]
pub struct MemoryLog {
    documents: Mutex<HashMap<DocumentName, Entry>>,
    failures: AtomicUsize,
    appends: AtomicU64,
    snapshot_writes: AtomicU64,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` writes (append or snapshot) fail with an I/O error.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Successful appends so far.
    pub fn appends(&self) -> u64 {
        self.appends.load(Ordering::Relaxed)
    }

    /// Successful snapshot writes so far.
    pub fn snapshot_writes(&self) -> u64 {
        self.snapshot_writes.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, name: &DocumentName) -> Option<Snapshot> {
        self.lock().get(name).and_then(|e| e.snapshot.clone())
    }

    pub fn operation_versions(&self, name: &DocumentName) -> Vec<u64> {
        self.lock()
            .get(name)
            .map(|e| e.operations.keys().copied().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DocumentName, Entry>> {
        self.documents.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_injected(&self) -> Result<(), StoreError> {
        let armed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            Err(StoreError::Io("injected write failure".into()))
        } else {
            Ok(())
        }
    }
}

impl OperationLog for MemoryLog {
    fn load(&self, name: &DocumentName) -> Result<Option<StoredDocument>, StoreError> {
        let docs = self.lock();
        let Some(entry) = docs.get(name) else {
            return Ok(None);
        };
        Ok(entry.snapshot.clone().map(|snapshot| {
            split_at_snapshot(snapshot, entry.operations.values().cloned().collect())
        }))
    }

    fn append(&self, name: &DocumentName, revision: &Revision) -> Result<(), StoreError> {
        self.check_injected()?;
        self.lock()
            .entry(name.clone())
            .or_default()
            .operations
            .insert(revision.version, revision.clone());
        self.appends.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn save_snapshot(&self, name: &DocumentName, snapshot: &Snapshot) -> Result<(), StoreError> {
        self.check_injected()?;
        self.lock().entry(name.clone()).or_default().snapshot = Some(snapshot.clone());
        self.snapshot_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn compact(&self, name: &DocumentName, up_to_version: u64) -> Result<u64, StoreError> {
        let mut docs = self.lock();
        let Some(entry) = docs.get_mut(name) else {
            return Ok(0);
        };
        let keep = entry.operations.split_off(&(up_to_version + 1));
        let removed = entry.operations.len() as u64;
        entry.operations = keep;
        Ok(removed)
    }

    fn delete(&self, name: &DocumentName) -> Result<(), StoreError> {
        self.lock().remove(name);
        Ok(())
    }

    fn list(&self) -> Result<Vec<DocumentName>, StoreError> {
        let mut names: Vec<DocumentName> = self.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagesync_core::TextOp;

    fn doc() -> DocumentName {
        DocumentName::parse("s1/page.hml").unwrap()
    }

    #[test]
    fn test_injected_failures_are_consumed() {
        let log = MemoryLog::new();
        let rev = Revision {
            version: 1,
            op: TextOp::insertion(0, "a"),
        };

        log.fail_next(2);
        assert!(log.append(&doc(), &rev).is_err());
        assert!(log.save_snapshot(&doc(), &Snapshot::new("a", 1)).is_err());
        assert!(log.append(&doc(), &rev).is_ok());
        assert_eq!(log.appends(), 1);
        assert_eq!(log.snapshot_writes(), 0);
    }

    #[test]
    fn test_ops_without_snapshot_do_not_load() {
        let log = MemoryLog::new();
        let rev = Revision {
            version: 1,
            op: TextOp::insertion(0, "a"),
        };
        log.append(&doc(), &rev).unwrap();
        assert_eq!(log.load(&doc()).unwrap(), None);

        log.save_snapshot(&doc(), &Snapshot::new("a", 1)).unwrap();
        let stored = log.load(&doc()).unwrap().unwrap();
        assert_eq!(stored.history, vec![rev]);
        assert!(stored.tail.is_empty());
    }

    #[test]
    fn test_compact() {
        let log = MemoryLog::new();
        for v in 1..=6 {
            let rev = Revision {
                version: v,
                op: TextOp::insertion(0, "z"),
            };
            log.append(&doc(), &rev).unwrap();
        }
        assert_eq!(log.compact(&doc(), 4).unwrap(), 4);
        assert_eq!(log.operation_versions(&doc()), vec![5, 6]);
    }
}
