//! Server configuration.
//!
//! Every field has a default, so a TOML file only needs the values it
//! changes:
//!
//! ```toml
//! bind_addr = "0.0.0.0:9090"
//! sessions_root = "/var/lib/pagesync/sessions"
//!
//! [store]
//! path = "/var/lib/pagesync/oplog"
//!
//! [retry]
//! max_attempts = 10
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use pagesync_core::DEFAULT_HISTORY_LIMIT;

use crate::persist::RetryPolicy;
use crate::storage::StoreConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on. Port 0 picks a free port.
    pub bind_addr: String,
    /// Per-subscriber broadcast buffer; overflowing subscribers resync.
    pub broadcast_capacity: usize,
    /// Accepted ops kept per document for rebasing late operations.
    pub history_limit: usize,
    /// Close connections that send nothing for this long; 0 never closes.
    pub idle_timeout_secs: u64,
    /// Directory containing one directory per session.
    pub sessions_root: PathBuf,
    pub store: StoreConfig,
    pub retry: RetryPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".into(),
            broadcast_capacity: 256,
            history_limit: DEFAULT_HISTORY_LIMIT,
            idle_timeout_secs: 120,
            sessions_root: PathBuf::from("pagesync_data/sessions"),
            store: StoreConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, small buffers, fast retries, everything under `root`.
    pub fn for_testing(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            bind_addr: "127.0.0.1:0".into(),
            broadcast_capacity: 64,
            history_limit: 64,
            idle_timeout_secs: 30,
            sessions_root: root.join("sessions"),
            store: StoreConfig::for_testing(root.join("oplog")),
            retry: RetryPolicy::for_testing(),
        }
    }

    /// Put the op log and session directories under one data directory.
    pub fn with_data_dir(mut self, dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        self.store.path = dir.join("oplog");
        self.sessions_root = dir.join("sessions");
        self
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"bind_addr":"0.0.0.0:7000","store":{"sync_writes":false},"retry":{"max_attempts":2}}"#,
        )
        .unwrap();

        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.history_limit, DEFAULT_HISTORY_LIMIT);
        assert!(!config.store.sync_writes);
        assert_eq!(config.store.retain_operations, StoreConfig::default().retain_operations);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.base_delay_ms, RetryPolicy::default().base_delay_ms);
    }

    #[test]
    fn test_with_data_dir() {
        let config = ServerConfig::default().with_data_dir("/tmp/ps");
        assert_eq!(config.store.path, PathBuf::from("/tmp/ps/oplog"));
        assert_eq!(config.sessions_root, PathBuf::from("/tmp/ps/sessions"));
    }

    #[test]
    fn test_zero_idle_timeout_disables_it() {
        let mut config = ServerConfig::default();
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(120)));
        config.idle_timeout_secs = 0;
        assert_eq!(config.idle_timeout(), None);
    }
}
