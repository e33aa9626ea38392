//! Streaming endpoint serving the update log to connected clients.
//!
//! Architecture:
//! ```text
//!                ┌──────────────── SyncService ────────────────┐
//! entity store ─►│ UpdateLog ──► BroadcastGroup ──┬─► conn loop ├─► client A
//!                │    ▲                           ├─► conn loop ├─► client B
//!  maintenance ──┤ heartbeat / prune              └─► conn loop ├─► client C
//!                └─────────────────────────────────────────────┘
//! ```
//!
//! Per connection (`ws://host/stream?since=<id>`):
//! 1. subscribe to live records
//! 2. flush the backlog `query(since)` in id order
//! 3. forward live records with id above the cursor
//! 4. after `connection_lifetime`, send `reconnect` and close
//!
//! A connection whose listener lags past its buffer gets a best-effort
//! `timeout` frame and is closed; the appender never waits on it.

use futures_util::{Sink, SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::broadcast::ListenerInfo;
use crate::protocol::{parse_since, Frame, ProtocolError, UpdateKind};
use crate::storage::{RocksBackend, StoreConfig, StoreError};
use crate::update_log::{LogError, UpdateLog};

/// Path of the streaming endpoint.
pub const STREAM_PATH: &str = "/stream";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Interval between heartbeat records
    pub heartbeat_interval: Duration,
    /// Connection age after which the client is told to reconnect
    pub connection_lifetime: Duration,
    /// Records buffered per connection before it is dropped as too slow
    pub listener_capacity: usize,
    /// Age after which records are pruned
    pub retention: Duration,
    /// Interval between prune passes
    pub prune_interval: Duration,
    /// Longest a single frame write may block before the peer counts as stalled
    pub send_timeout: Duration,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            heartbeat_interval: Duration::from_secs(15),
            connection_lifetime: Duration::from_secs(300),
            listener_capacity: 256,
            retention: Duration::from_secs(24 * 60 * 60),
            prune_interval: Duration::from_secs(60),
            send_timeout: Duration::from_secs(10),
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            heartbeat_interval: Duration::from_secs(3600),
            connection_lifetime: Duration::from_secs(3600),
            listener_capacity: 64,
            retention: Duration::from_secs(3600),
            prune_interval: Duration::from_secs(3600),
            send_timeout: Duration::from_millis(500),
            storage_path: None,
        }
    }

    /// Defaults overridden by `CALSYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ServerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `CALSYNC_*` key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ServerError> {
        let secs = |key: &str| -> Result<Option<Duration>, ServerError> {
            lookup(key)
                .map(|v| {
                    v.trim()
                        .parse::<u64>()
                        .map(Duration::from_secs)
                        .map_err(|_| ServerError::Config(format!("{key} must be whole seconds, got {v:?}")))
                })
                .transpose()
        };

        let mut config = Self::default();
        if let Some(addr) = lookup("CALSYNC_BIND") {
            config.bind_addr = addr;
        }
        if let Some(dir) = lookup("CALSYNC_DATA_DIR") {
            config.storage_path = Some(PathBuf::from(dir));
        }
        if let Some(d) = secs("CALSYNC_HEARTBEAT_SECS")? {
            config.heartbeat_interval = d;
        }
        if let Some(d) = secs("CALSYNC_LIFETIME_SECS")? {
            config.connection_lifetime = d;
        }
        if let Some(d) = secs("CALSYNC_RETENTION_SECS")? {
            config.retention = d;
        }
        if let Some(d) = secs("CALSYNC_SEND_TIMEOUT_SECS")? {
            config.send_timeout = d;
        }
        if config.heartbeat_interval.is_zero()
            || config.connection_lifetime.is_zero()
            || config.send_timeout.is_zero()
        {
            return Err(ServerError::Config("intervals must be non-zero".into()));
        }
        Ok(config)
    }
}

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub frames_sent: u64,
    pub backlog_frames: u64,
    pub dropped_slow_consumers: u64,
    pub reconnect_directives: u64,
    pub heartbeats: u64,
    pub pruned_records: u64,
}

/// Decides whether an upgrade request may open a stream.
///
/// Consulted once per connection attempt, never per frame.
pub trait ConnectionGate: Send + Sync {
    fn authorize(&self, request: &Request) -> bool;
}

/// Gate that admits every request.
pub struct AllowAll;

impl ConnectionGate for AllowAll {
    fn authorize(&self, _request: &Request) -> bool {
        true
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// The process-scoped sync service.
///
/// Built once at startup and shared as `Arc<SyncService>` with every
/// connection task and with the entity store that appends to its log.
pub struct SyncService {
    config: ServerConfig,
    log: Arc<UpdateLog>,
    gate: Arc<dyn ConnectionGate>,
    stats: Arc<RwLock<ServerStats>>,
    shutdown_tx: watch::Sender<bool>,
}

impl SyncService {
    /// Create the service, opening RocksDB when `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let log = match &config.storage_path {
            Some(path) => {
                let backend = RocksBackend::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?;
                UpdateLog::open(Arc::new(backend), config.listener_capacity)?
            }
            None => UpdateLog::in_memory(config.listener_capacity),
        };
        Ok(Self::with_log(config, Arc::new(log)))
    }

    /// Create the service around an existing log.
    pub fn with_log(config: ServerConfig, log: Arc<UpdateLog>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            log,
            gate: Arc::new(AllowAll),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            shutdown_tx,
        }
    }

    /// Replace the connection gate.
    pub fn with_gate(mut self, gate: Arc<dyn ConnectionGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn log(&self) -> &Arc<UpdateLog> {
        &self.log
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Stop accepting, stop maintenance and close every stream.
    pub fn shutdown(&self) {
        log::info!("Sync service shutting down");
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Bind `bind_addr` and serve until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        log::info!("Sync service listening on {}", listener.local_addr()?);
        let maintenance = self.spawn_maintenance();
        let mut shutdown = self.shutdown_tx.subscribe();

        while !*shutdown.borrow_and_update() {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");
                    let service = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = service.handle_connection(stream, addr).await {
                            log::warn!("Connection from {addr} ended with error: {e}");
                        }
                    });
                }
                _ = shutdown.changed() => {}
            }
        }

        let _ = maintenance.await;
        Ok(())
    }

    /// Append a heartbeat record.
    pub async fn emit_heartbeat(&self) -> Result<u64, LogError> {
        let log = self.log.clone();
        let payload = json!({ "ts": crate::protocol::now_millis() });
        let id = tokio::task::spawn_blocking(move || log.append(UpdateKind::Heartbeat, payload))
            .await
            .map_err(|e| LogError::Append(StoreError::Unavailable(e.to_string())))??;
        self.stats.write().await.heartbeats += 1;
        log::trace!("Heartbeat {id}");
        Ok(id)
    }

    /// Run one prune pass off the async workers.
    pub async fn prune_now(&self) -> Result<usize, LogError> {
        let log = self.log.clone();
        let retention = self.config.retention;
        let removed = tokio::task::spawn_blocking(move || log.prune(retention))
            .await
            .map_err(|e| LogError::Prune(StoreError::Unavailable(e.to_string())))??;
        self.stats.write().await.pruned_records += removed as u64;
        Ok(removed)
    }

    /// Periodic heartbeat and prune task. Both run on fixed intervals.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let service = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval_at(
                Instant::now() + service.config.heartbeat_interval,
                service.config.heartbeat_interval,
            );
            let mut prune = tokio::time::interval_at(
                Instant::now() + service.config.prune_interval,
                service.config.prune_interval,
            );
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

            while !*shutdown.borrow_and_update() {
                tokio::select! {
                    _ = heartbeat.tick() => {
                        if let Err(e) = service.emit_heartbeat().await {
                            log::error!("Heartbeat append failed: {e}");
                        }
                    }
                    _ = prune.tick() => {
                        if let Err(e) = service.prune_now().await {
                            log::error!("Prune failed: {e}");
                        }
                    }
                    _ = shutdown.changed() => {}
                }
            }
            log::debug!("Maintenance task stopped");
        })
    }

    /// Handle a single stream connection.
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let mut since: Option<u64> = None;
        let gate = self.gate.clone();
        let callback = |request: &Request, response: Response| {
            if request.uri().path() != STREAM_PATH {
                return Err(reject(StatusCode::NOT_FOUND, "unknown endpoint"));
            }
            if !gate.authorize(request) {
                return Err(reject(StatusCode::UNAUTHORIZED, "authentication required"));
            }
            match parse_since(request.uri().query()) {
                Ok(cursor) => {
                    since = cursor;
                    Ok(response)
                }
                Err(e) => Err(reject(StatusCode::BAD_REQUEST, &e.to_string())),
            }
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                self.stats.write().await.rejected_handshakes += 1;
                log::info!("Handshake from {addr} rejected: {e}");
                return Ok(());
            }
        };
        let (mut sink, mut incoming) = ws_stream.split();

        // Resolve "latest" before subscribing so nothing falls between
        let start = match since {
            Some(cursor) => cursor,
            None => self.log.latest_id()?,
        };
        let info = ListenerInfo::new(addr.to_string(), since);
        let connection_id = info.connection_id;
        let mut live = self.log.subscribe(info).await;
        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }
        log::info!("Stream {connection_id} opened from {addr} (since {since:?})");

        let result = self
            .push_loop(&mut sink, &mut incoming, &mut live, start, connection_id)
            .await;

        self.log.live().remove_listener(&connection_id).await;
        let _ = tokio::time::timeout(self.config.send_timeout, sink.close()).await;
        self.stats.write().await.active_connections -= 1;
        log::info!("Stream {connection_id} from {addr} closed");
        result
    }

    async fn push_loop<S, R>(
        &self,
        sink: &mut S,
        incoming: &mut R,
        live: &mut tokio::sync::broadcast::Receiver<Arc<crate::protocol::UpdateRecord>>,
        start: u64,
        connection_id: uuid::Uuid,
    ) -> Result<(), ServerError>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
        R: futures_util::Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        // A cursor past the end of the log was issued by an earlier
        // incarnation of it; restart from the head so live ids are not
        // filtered out. The client sees the reset on its first record.
        let latest = self.log.latest_id()?;
        let start = if start > latest {
            log::warn!("Stream {connection_id}: cursor {start} is ahead of the log (latest {latest}), resetting");
            latest
        } else {
            start
        };
        let mut cursor = start;

        let backlog = self.log.query(start)?;
        if let Some(first) = backlog.first() {
            if first.id > start.saturating_add(1) {
                log::warn!(
                    "Stream {connection_id}: cursor {start} predates retained window, resuming at {}",
                    first.id
                );
            }
        }
        log::debug!("Stream {connection_id}: flushing {} backlog records", backlog.len());
        let backlog_len = backlog.len() as u64;
        for record in &backlog {
            if !self.deliver(sink, &Frame::from_record(record)).await? {
                self.drop_slow_consumer(connection_id, "stalled during backlog").await;
                return Ok(());
            }
            cursor = record.id;
        }
        {
            let mut s = self.stats.write().await;
            s.backlog_frames += backlog_len;
            s.frames_sent += backlog_len;
        }

        let deadline = tokio::time::sleep(self.config.connection_lifetime);
        tokio::pin!(deadline);
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow_and_update() {
            return Ok(());
        }

        loop {
            tokio::select! {
                received = live.recv() => match received {
                    Ok(record) => {
                        if record.id <= cursor {
                            continue;
                        }
                        if !self.deliver(sink, &Frame::from_record(&record)).await? {
                            self.drop_slow_consumer(connection_id, "stalled on write").await;
                            return Ok(());
                        }
                        cursor = record.id;
                        self.stats.write().await.frames_sent += 1;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        self.drop_slow_consumer(connection_id, &format!("fell {missed} records behind")).await;
                        let _ = self.deliver(sink, &Frame::timeout(cursor)).await;
                        return Ok(());
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },

                _ = &mut deadline => {
                    log::debug!("Stream {connection_id} reached its lifetime, sending reconnect");
                    if self.deliver(sink, &Frame::reconnect(cursor)).await? {
                        self.stats.write().await.reconnect_directives += 1;
                    } else {
                        self.drop_slow_consumer(connection_id, "stalled on reconnect directive").await;
                    }
                    return Ok(());
                }

                msg = incoming.next() => match msg {
                    Some(Ok(Message::Ping(data))) => {
                        match tokio::time::timeout(self.config.send_timeout, sink.send(Message::Pong(data))).await {
                            Ok(sent) => sent?,
                            Err(_) => {
                                self.drop_slow_consumer(connection_id, "stalled on pong").await;
                                return Ok(());
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => {
                        log::debug!("Stream {connection_id} transport error: {e}");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                },

                _ = shutdown.changed() => return Ok(()),
            }
        }
    }
}

impl SyncService {
    /// Write one frame, giving up after `send_timeout`.
    ///
    /// `Ok(false)` means the peer stopped reading and the connection
    /// must be dropped.
    async fn deliver<S>(&self, sink: &mut S, frame: &Frame) -> Result<bool, ServerError>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        match tokio::time::timeout(self.config.send_timeout, send_frame(sink, frame)).await {
            Ok(sent) => sent.map(|()| true),
            Err(_) => Ok(false),
        }
    }

    async fn drop_slow_consumer(&self, connection_id: uuid::Uuid, reason: &str) {
        log::warn!("Stream {connection_id} {reason}, dropping it");
        self.log.live().record_dropped();
        self.stats.write().await.dropped_slow_consumers += 1;
    }
}

async fn send_frame<S>(sink: &mut S, frame: &Frame) -> Result<(), ServerError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = frame.encode()?;
    sink.send(Message::text(text)).await?;
    Ok(())
}
