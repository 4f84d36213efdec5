//! Session directories.
//!
//! A session exists iff its directory exists; sessions are created and
//! deleted out of band (admin tooling, `pagesyncd create-session`).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use pagesync_core::SessionId;

/// Answers "does this session exist, and where does it live".
pub trait SessionDirectory: Send + Sync {
    fn exists(&self, session: &SessionId) -> bool {
        self.resolve(session).is_some()
    }

    /// Directory holding the session's page files.
    fn resolve(&self, session: &SessionId) -> Option<PathBuf>;
}

/// `<root>/<session id>/` on disk.
#[derive(Debug, Clone)]
pub struct FsSessions {
    root: PathBuf,
}

impl FsSessions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the session directory (and its `pages/` folder).
    pub fn create(&self, session: &SessionId) -> std::io::Result<PathBuf> {
        let dir = self.root.join(session.as_str());
        std::fs::create_dir_all(dir.join("pages"))?;
        log::info!("Created session {session} at {}", dir.display());
        Ok(dir)
    }

    pub fn remove(&self, session: &SessionId) -> std::io::Result<()> {
        let dir = self.root.join(session.as_str());
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
            log::info!("Removed session directory {}", dir.display());
        }
        Ok(())
    }

    /// Sessions currently on disk.
    pub fn list(&self) -> std::io::Result<Vec<SessionId>> {
        let mut sessions = Vec::new();
        if !self.root.exists() {
            return Ok(sessions);
        }
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(|s| SessionId::new(s).ok()) {
                sessions.push(id);
            }
        }
        sessions.sort();
        Ok(sessions)
    }
}

impl SessionDirectory for FsSessions {
    fn resolve(&self, session: &SessionId) -> Option<PathBuf> {
        let dir = self.root.join(session.as_str());
        dir.is_dir().then_some(dir)
    }
}

/// Session set held in memory; paths are synthesized under `root`.
#[derive(Debug, Default)]
pub struct MemorySessions {
    root: PathBuf,
    sessions: RwLock<HashSet<SessionId>>,
}

impl MemorySessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sessions<I>(sessions: I) -> Self
    where
        I: IntoIterator<Item = SessionId>,
    {
        Self {
            root: PathBuf::new(),
            sessions: RwLock::new(sessions.into_iter().collect()),
        }
    }

    pub fn insert(&self, session: SessionId) -> bool {
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session)
    }

    pub fn remove(&self, session: &SessionId) -> bool {
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session)
    }
}

impl SessionDirectory for MemorySessions {
    fn resolve(&self, session: &SessionId) -> Option<PathBuf> {
        let known = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(session);
        known.then(|| self.root.join(session.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn id(raw: &str) -> SessionId {
        SessionId::new(raw).unwrap()
    }

    #[test]
    fn test_fs_sessions_lifecycle() {
        let dir = TempDir::new().unwrap();
        let sessions = FsSessions::new(dir.path());

        assert!(!sessions.exists(&id("s1")));
        let path = sessions.create(&id("s1")).unwrap();
        assert!(path.join("pages").is_dir());
        assert!(sessions.exists(&id("s1")));
        assert_eq!(sessions.resolve(&id("s1")), Some(path));
        assert_eq!(sessions.list().unwrap(), vec![id("s1")]);

        sessions.remove(&id("s1")).unwrap();
        assert!(!sessions.exists(&id("s1")));
    }

    #[test]
    fn test_memory_sessions() {
        let sessions = MemorySessions::with_sessions([id("a")]);
        assert!(sessions.exists(&id("a")));
        assert!(!sessions.exists(&id("b")));
        assert!(sessions.insert(id("b")));
        assert!(sessions.exists(&id("b")));
        assert!(sessions.remove(&id("a")));
        assert!(!sessions.exists(&id("a")));
    }
}
