//! Page files: the editor-facing copy of each page.
//!
//! Every page is one JSON object under `<session dir>/pages/<filename>.json`
//! mapping field keys (`content`, `definition`, `details`) to text. The sync
//! server rewrites a single field after each persisted change and leaves the
//! others untouched.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use pagesync_core::SessionId;

use super::SessionDirectory;
use crate::error::StoreError;

/// Field key → field text.
pub type PageFields = BTreeMap<String, String>;

/// Load and save page field maps.
pub trait PageStore: Send + Sync {
    fn load(&self, session: &SessionId, filename: &str) -> Result<Option<PageFields>, StoreError>;

    /// Merge `fields` into the stored page. Keys absent from `fields` keep
    /// their stored value.
    fn save(&self, session: &SessionId, filename: &str, fields: &PageFields) -> Result<(), StoreError>;
}

/// JSON files inside session directories.
pub struct FsPageStore {
    sessions: Arc<dyn SessionDirectory>,
}

impl FsPageStore {
    pub fn new(sessions: Arc<dyn SessionDirectory>) -> Self {
        Self { sessions }
    }

    fn page_path(&self, session: &SessionId, filename: &str) -> Result<PathBuf, StoreError> {
        let dir = self
            .sessions
            .resolve(session)
            .ok_or_else(|| StoreError::MissingSession(session.to_string()))?;
        Ok(dir.join("pages").join(format!("{filename}.json")))
    }
}

impl PageStore for FsPageStore {
    fn load(&self, session: &SessionId, filename: &str) -> Result<Option<PageFields>, StoreError> {
        let path = self.page_path(session, filename)?;
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let fields = serde_json::from_slice(&raw)
            .map_err(|e| StoreError::Deserialization(format!("{}: {e}", path.display())))?;
        Ok(Some(fields))
    }

    fn save(&self, session: &SessionId, filename: &str, fields: &PageFields) -> Result<(), StoreError> {
        let path = self.page_path(session, filename)?;
        let mut page = self.load(session, filename)?.unwrap_or_default();
        page.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));

        let json = serde_json::to_vec_pretty(&page)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Write-then-rename so readers never see a torn file
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Page store held in memory.
#[derive(Debug, Default)]
pub struct MemoryPageStore {
    pages: Mutex<HashMap<(SessionId, String), PageFields>>,
}

impl MemoryPageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a page, replacing whatever was there.
    pub fn insert(&self, session: SessionId, filename: impl Into<String>, fields: PageFields) {
        self.pages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((session, filename.into()), fields);
    }

    pub fn get(&self, session: &SessionId, filename: &str) -> Option<PageFields> {
        self.pages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(session.clone(), filename.to_owned()))
            .cloned()
    }
}

impl PageStore for MemoryPageStore {
    fn load(&self, session: &SessionId, filename: &str) -> Result<Option<PageFields>, StoreError> {
        Ok(self.get(session, filename))
    }

    fn save(&self, session: &SessionId, filename: &str, fields: &PageFields) -> Result<(), StoreError> {
        let mut pages = self.pages.lock().unwrap_or_else(|e| e.into_inner());
        let page = pages
            .entry((session.clone(), filename.to_owned()))
            .or_default();
        page.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsSessions;
    use tempfile::TempDir;

    fn fields(pairs: &[(&str, &str)]) -> PageFields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_fs_save_merges_fields() {
        let dir = TempDir::new().unwrap();
        let sessions = Arc::new(FsSessions::new(dir.path()));
        let session = SessionId::new("s1").unwrap();
        sessions.create(&session).unwrap();
        let store = FsPageStore::new(sessions);

        assert_eq!(store.load(&session, "page.hml").unwrap(), None);

        store
            .save(&session, "page.hml", &fields(&[("content", "<page/>")]))
            .unwrap();
        store
            .save(&session, "page.hml", &fields(&[("details", "notes")]))
            .unwrap();

        let page = store.load(&session, "page.hml").unwrap().unwrap();
        assert_eq!(page, fields(&[("content", "<page/>"), ("details", "notes")]));
        assert!(dir.path().join("s1/pages/page.hml.json").is_file());
        assert!(!dir.path().join("s1/pages/page.hml.json.tmp").exists());
    }

    #[test]
    fn test_fs_missing_session() {
        let dir = TempDir::new().unwrap();
        let store = FsPageStore::new(Arc::new(FsSessions::new(dir.path())));
        let session = SessionId::new("ghost").unwrap();

        let err = store
            .save(&session, "page.hml", &fields(&[("content", "x")]))
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingSession(_)));
    }

    #[test]
    fn test_memory_store_merges_fields() {
        let store = MemoryPageStore::new();
        let session = SessionId::new("s1").unwrap();
        store.insert(session.clone(), "p", fields(&[("content", "a"), ("details", "b")]));
        store.save(&session, "p", &fields(&[("content", "c")])).unwrap();
        assert_eq!(
            store.get(&session, "p"),
            Some(fields(&[("content", "c"), ("details", "b")]))
        );
    }
}
