use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use pagesync_collab::ServerConfig;

#[derive(Parser)]
#[command(name = "pagesyncd", about = "Real-time collaboration server for session pages")]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Listen address, overrides `bind_addr`
    #[arg(long, global = true)]
    pub bind: Option<String>,
    /// Directory holding `oplog/` and `sessions/`
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Serve the sync and presence channels until interrupted
    Serve,
    /// Create an empty session directory
    CreateSession {
        /// Session id (letters, digits, `-` and `_`)
        id: String,
    },
    /// List known sessions
    ListSessions,
}

impl Cli {
    /// Effective configuration: defaults, then the file, then flags.
    pub fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => ServerConfig::default(),
        };
        if let Some(dir) = &self.data_dir {
            config = config.with_data_dir(dir);
        }
        if let Some(bind) = &self.bind {
            config.bind_addr = bind.clone();
        }
        Ok(config)
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<ServerConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}
