//! WebSocket sync server with path-based channel routing.
//!
//! Architecture:
//! ```text
//!                          ┌──────── SyncServer ────────┐
//! ws://…/sync/s1 ────────► │ sync handler               │
//!                          │   │ apply(op)               │
//!                          │   ▼                         │
//!                          │ DocumentCache ──► Persister ├──► OperationLog (RocksDB)
//!                          │   │ on_applied              │        PageStore (JSON)
//!                          │   ▼                         │
//! ws://…/presence/s1 ────► │ ConnectionRegistry (rooms) │
//!                          └──────────┬─────────────────┘
//!                          ┌──────────┼───────────┐
//!                          ▼          ▼           ▼
//!                       Client A   Client B    Client C
//! ```
//!
//! Each connection is served by its own task. The upgrade request's path
//! picks the channel and the session; an unknown path or session completes
//! the upgrade and is closed right away with a policy-violation code.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use futures_util::SinkExt;
use uuid::Uuid;

use pagesync_core::SessionId;

use crate::cache::DocumentCache;
use crate::channel;
use crate::config::ServerConfig;
use crate::error::{StoreError, SyncError};
use crate::persist::{LogAlert, PersistenceAlert, Persister};
use crate::registry::ConnectionRegistry;
use crate::storage::{
    FsPageStore, FsSessions, MemoryLog, MemoryPageStore, OperationLog, PageStore, RocksLog,
    SessionDirectory,
};

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Data frames received
    pub total_messages: u64,
    pub total_bytes: u64,
    pub updates_applied: u64,
    /// Snapshots pushed to connections that fell behind
    pub resyncs: u64,
    /// Connections closed for malformed frames
    pub protocol_errors: u64,
    pub active_rooms: usize,
    pub cached_documents: usize,
    pub persisted_operations: u64,
    pub persist_failures: u64,
}

#[derive(Debug, Default)]
pub(crate) struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    updates_applied: AtomicU64,
    resyncs: AtomicU64,
    protocol_errors: AtomicU64,
}

impl AtomicServerStats {
    pub(crate) fn record_connect(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_disconnect(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub(crate) fn record_message(&self, bytes: usize) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_update(&self) {
        self.updates_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resync(&self) {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Everything a connection handler needs.
pub(crate) struct ServerContext {
    pub(crate) config: ServerConfig,
    pub(crate) cache: Arc<DocumentCache>,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) sessions: Arc<dyn SessionDirectory>,
    pub(crate) stats: AtomicServerStats,
    /// Deletion flag per session with live connections; each connection
    /// holds a receiver.
    pub(crate) live_sessions: Mutex<HashMap<SessionId, watch::Sender<bool>>>,
}

impl ServerContext {
    pub(crate) async fn session_deleted(&self, session: &SessionId) -> watch::Receiver<bool> {
        self.live_sessions
            .lock()
            .await
            .entry(session.clone())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }
}

/// How long `delete_session` waits for the session's connections to close.
const SESSION_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Storage and session collaborators of a server.
#[derive(Clone)]
pub struct Collaborators {
    pub log: Arc<dyn OperationLog>,
    pub pages: Arc<dyn PageStore>,
    pub sessions: Arc<dyn SessionDirectory>,
    pub alert: Arc<dyn PersistenceAlert>,
}

impl Collaborators {
    /// In-memory op log and page store over the given session directory.
    pub fn in_memory(sessions: Arc<dyn SessionDirectory>) -> Self {
        Self {
            log: Arc::new(MemoryLog::new()),
            pages: Arc::new(MemoryPageStore::new()),
            sessions,
            alert: Arc::new(LogAlert),
        }
    }
}

/// Which channel an upgrade request asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Sync(SessionId),
    Presence(SessionId),
}

impl Route {
    /// `/sync/<session>` or `/presence/<session>`; query strings are ignored.
    fn parse(path: &str) -> Option<Self> {
        let path = path.split('?').next().unwrap_or_default();
        let mut parts = path.trim_matches('/').split('/');
        let channel = parts.next()?;
        let session = SessionId::new(parts.next()?).ok()?;
        if parts.next().is_some() {
            return None;
        }
        match channel {
            "sync" => Some(Route::Sync(session)),
            "presence" => Some(Route::Presence(session)),
            _ => None,
        }
    }

    fn session(&self) -> &SessionId {
        match self {
            Route::Sync(session) | Route::Presence(session) => session,
        }
    }
}

/// The sync server.
pub struct SyncServer {
    ctx: Arc<ServerContext>,
    shutdown: watch::Sender<bool>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            log,
            pages,
            sessions,
            alert,
        } = collaborators;

        let persister = Persister::new(
            log.clone(),
            pages.clone(),
            config.retry.clone(),
            alert,
            config.store.retain_operations,
        );
        let cache = Arc::new(DocumentCache::new(
            log,
            pages,
            sessions.clone(),
            persister,
            config.history_limit,
        ));
        let registry = Arc::new(ConnectionRegistry::new(config.broadcast_capacity));
        let (shutdown, _) = watch::channel(false);

        Self {
            ctx: Arc::new(ServerContext {
                config,
                cache,
                registry,
                sessions,
                stats: AtomicServerStats::default(),
                live_sessions: Mutex::new(HashMap::new()),
            }),
            shutdown,
        }
    }

    /// Server over RocksDB, session directories and JSON page files, all
    /// located by `config`.
    pub fn open(config: ServerConfig) -> Result<Self, SyncError> {
        std::fs::create_dir_all(&config.sessions_root).map_err(StoreError::from)?;
        let log = Arc::new(RocksLog::open(config.store.clone())?);
        let sessions: Arc<dyn SessionDirectory> = Arc::new(FsSessions::new(&config.sessions_root));
        let pages = Arc::new(FsPageStore::new(sessions.clone()));

        Ok(Self::new(
            config,
            Collaborators {
                log,
                pages,
                sessions,
                alert: Arc::new(LogAlert),
            },
        ))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.ctx.config
    }

    pub fn cache(&self) -> &Arc<DocumentCache> {
        &self.ctx.cache
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.ctx.registry
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, SyncError> {
        let listener = TcpListener::bind(&self.ctx.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), SyncError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown is signalled.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SyncError> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            log::warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let ctx = self.ctx.clone();
                    let shutdown = self.shutdown.subscribe();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(ctx, stream, addr, shutdown).await {
                            log::debug!("Connection from {addr} ended: {e}");
                        }
                    });
                }
                _ = shutdown.changed() => break,
            }
        }
        log::info!("Sync server stopped accepting connections");
        Ok(())
    }

    /// Stop accepting, close every connection with 1001 and wait for all
    /// pending writes to land.
    pub async fn shutdown(&self) {
        log::info!("Shutting down sync server");
        self.shutdown.send_replace(true);
        self.ctx.cache.flush_all().await;
    }

    /// Delete a session's documents: cache entries, op-log data and rooms.
    /// Live connections of the session are closed with 1008 first. The
    /// session directory itself is left to its owner.
    pub async fn delete_session(&self, session: &SessionId) -> Result<usize, SyncError> {
        let signal = self.ctx.live_sessions.lock().await.remove(session);
        if let Some(signal) = signal {
            let open = signal.receiver_count();
            signal.send_replace(true);
            if open > 0 {
                log::info!("Closing {open} connections of session {session}");
                if tokio::time::timeout(SESSION_CLOSE_GRACE, signal.closed()).await.is_err() {
                    log::warn!("Connections of session {session} still open after close");
                }
            }
        }

        let evicted = self.ctx.cache.evict_session(session).await?;
        let rooms = self.ctx.registry.drop_session(session).await;
        log::info!("Deleted session {session}: {evicted} documents, {rooms} rooms");
        Ok(evicted)
    }

    pub async fn stats(&self) -> ServerStats {
        let s = &self.ctx.stats;
        let registry = self.ctx.registry.stats().await;
        let cache = self.ctx.cache.stats().await;
        ServerStats {
            total_connections: s.total_connections.load(Ordering::Relaxed),
            active_connections: s.active_connections.load(Ordering::Relaxed),
            total_messages: s.total_messages.load(Ordering::Relaxed),
            total_bytes: s.total_bytes.load(Ordering::Relaxed),
            updates_applied: s.updates_applied.load(Ordering::Relaxed),
            resyncs: s.resyncs.load(Ordering::Relaxed),
            protocol_errors: s.protocol_errors.load(Ordering::Relaxed),
            active_rooms: registry.rooms,
            cached_documents: cache.documents,
            persisted_operations: cache.persist.persisted,
            persist_failures: cache.persist.failures,
        }
    }
}

/// Upgrade one TCP connection and hand it to its channel.
async fn handle_connection(
    ctx: Arc<ServerContext>,
    stream: TcpStream,
    addr: SocketAddr,
    shutdown: watch::Receiver<bool>,
) -> Result<(), SyncError> {
    let (path_tx, path_rx) = oneshot::channel();
    let callback = move |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let _ = path_tx.send(req.uri().path().to_owned());
        Ok(response)
    };
    let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let path = path_rx.await.unwrap_or_default();

    let route = match Route::parse(&path) {
        Some(route) if ctx.sessions.exists(route.session()) => route,
        Some(route) => {
            log::warn!("{addr} asked for unknown session {}", route.session());
            ws.send(channel::close_message(CloseCode::Policy, "unknown session"))
                .await?;
            return Ok(());
        }
        None => {
            log::warn!("{addr} asked for unknown path {path}");
            ws.send(channel::close_message(CloseCode::Policy, "unknown path"))
                .await?;
            return Ok(());
        }
    };

    let id = Uuid::new_v4();
    ctx.stats.record_connect();
    log::info!("WebSocket connection {id} from {addr}: {route:?}");

    let signals = channel::Signals {
        shutdown,
        deleted: ctx.session_deleted(route.session()).await,
    };
    match route {
        Route::Sync(session) => channel::sync::serve(ctx.clone(), id, session, ws, signals).await,
        Route::Presence(session) => {
            channel::presence::serve(ctx.clone(), id, session, ws, signals).await
        }
    }
    ctx.stats.record_disconnect();
    Ok(())
}
