mod cli;

use std::sync::Arc;

use clap::Parser;
use log::info;
use pagesync_collab::{FsSessions, SyncServer};
use pagesync_core::SessionId;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli.server_config()?;

    match cli.command {
        Command::Serve => {
            let server = Arc::new(SyncServer::open(config)?);
            let listener = server.bind().await?;

            let serving = {
                let server = server.clone();
                tokio::spawn(async move { server.serve(listener).await })
            };

            tokio::signal::ctrl_c().await?;
            info!("Interrupted");
            server.shutdown().await;
            serving.await??;

            let stats = server.stats().await;
            info!(
                "Served {} connections, applied {} updates, persisted {} operations",
                stats.total_connections, stats.updates_applied, stats.persisted_operations
            );
        }

        Command::CreateSession { id } => {
            let session = SessionId::new(id)?;
            let dir = FsSessions::new(&config.sessions_root).create(&session)?;
            println!("Created session {session} at {}", dir.display());
        }

        Command::ListSessions => {
            for session in FsSessions::new(&config.sessions_root).list()? {
                println!("{session}");
            }
        }
    }

    Ok(())
}
