//! Streaming client that keeps one resumable connection to the sync service.
//!
//! Provides:
//! - Connection lifecycle with exponential backoff and a terminal failure state
//! - Cursor tracking so every reconnect resumes where the last one stopped
//! - Duplicate suppression across the stream and local mutation responses
//! - Event dispatch to the presentation layer through an [`EventBus`]
//!
//! State machine:
//! ```text
//! Disconnected ─start─► Connecting ─open─► Connected
//!                          ▲   ▲               │
//!            timer expiry  │   └── reconnect ──┤ (no attempt counted)
//!                          │                   ▼ transport error / close
//!                      BackingOff ◄────────────┘ (attempt += 1)
//!                          │                     also entered on a failed connect
//!                          │
//!                          └─ attempts > max ─► Failed
//! ```

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::dedup::{DedupGuard, DeliveryChannel, DEFAULT_DEDUP_WINDOW};
use crate::protocol::{Frame, FrameEvent, ProtocolError, UpdateKind, UpdateRecord};
use crate::pubsub::EventBus;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    BackingOff,
    /// Terminal; the client will not retry on its own
    Failed,
}

/// Exponential backoff with a hard cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Attempts tolerated before the client gives up
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            cap: Duration::from_millis(30_000),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * 2^attempt, cap)`
    pub fn delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.cap, |d| d.min(self.cap))
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Stream endpoint, e.g. `ws://127.0.0.1:9090/stream`
    pub server_url: String,
    /// Cursor for the first connect (`None` = latest)
    pub resume_from: Option<u64>,
    pub policy: ReconnectPolicy,
    pub dedup_window: Duration,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            resume_from: None,
            policy: ReconnectPolicy::default(),
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }
}

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Network error: {0}")]
    TransientNetwork(String),
    #[error("Server requires authentication (HTTP {0})")]
    AuthRequired(u16),
    #[error("Gave up after {0} reconnect attempts")]
    AttemptsExhausted(u32),
    #[error("Client is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<tungstenite::Error> for ClientError {
    fn from(err: tungstenite::Error) -> Self {
        match &err {
            tungstenite::Error::Http(response)
                if matches!(response.status().as_u16(), 401 | 403) =>
            {
                ClientError::AuthRequired(response.status().as_u16())
            }
            _ => ClientError::TransientNetwork(err.to_string()),
        }
    }
}

/// Events delivered to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A calendar change to apply
    Apply {
        id: u64,
        kind: UpdateKind,
        payload: Value,
        channel: DeliveryChannel,
    },
    /// A user was created; reload the roster
    RefreshRoster { id: u64, payload: Value },
    Status(ConnectionState),
    /// The stream did not continue at `expected`: records up to `received`
    /// were pruned, or (`received < expected`) the server log restarted
    CursorJump { expected: u64, received: u64 },
    /// Terminal failure
    Failed { reason: String },
}

/// How a single connection ended.
#[derive(Debug)]
enum StreamEnd {
    /// Server asked for a fresh connection
    Reconnect,
    Lost(ClientError),
    Stopped,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the handle and the driver task.
struct Inner {
    config: ClientConfig,
    bus: EventBus<SyncEvent>,
    dedup: Mutex<DedupGuard>,
    cursor: Mutex<Option<u64>>,
    state: Mutex<ConnectionState>,
    attempts: AtomicU32,
    /// No record consumed yet on the current connection
    fresh: AtomicBool,
}

/// The stream client.
///
/// One driver task owns the connection, so at most one connect is ever in
/// flight. [`stop`](SyncClient::stop) cancels the driver, including a
/// pending backoff sleep.
pub struct SyncClient {
    inner: Arc<Inner>,
    driver: Mutex<Option<(JoinHandle<()>, watch::Sender<bool>)>>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        let dedup = DedupGuard::new(config.dedup_window);
        let cursor = config.resume_from;
        Self {
            inner: Arc::new(Inner {
                config,
                bus: EventBus::default(),
                dedup: Mutex::new(dedup),
                cursor: Mutex::new(cursor),
                state: Mutex::new(ConnectionState::Disconnected),
                attempts: AtomicU32::new(0),
                fresh: AtomicBool::new(false),
            }),
            driver: Mutex::new(None),
        }
    }

    /// Bus carrying [`SyncEvent`]s; subscribe before calling `start`.
    pub fn events(&self) -> &EventBus<SyncEvent> {
        &self.inner.bus
    }

    /// Spawn the connection driver.
    pub fn start(&self) -> Result<(), ClientError> {
        let mut driver = lock(&self.driver);
        if driver.as_ref().is_some_and(|(handle, _)| !handle.is_finished()) {
            return Err(ClientError::AlreadyRunning);
        }
        self.inner.attempts.store(0, Ordering::SeqCst);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(self.inner.clone().drive(stop_rx));
        *driver = Some((handle, stop_tx));
        Ok(())
    }

    /// Close the connection and cancel any pending reconnect.
    pub async fn stop(&self) {
        let driver = lock(&self.driver).take();
        if let Some((handle, stop_tx)) = driver {
            stop_tx.send_replace(true);
            if let Err(e) = handle.await {
                log::error!("Stream client driver panicked: {e}");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.driver)
            .as_ref()
            .is_some_and(|(handle, _)| !handle.is_finished())
    }

    /// Feed a record returned by a locally initiated mutation.
    ///
    /// Goes through the same duplicate suppression as streamed records,
    /// on the `Direct` channel. Returns whether it was dispatched.
    pub fn apply_local(&self, record: &UpdateRecord) -> bool {
        self.inner.dispatch(record.id, record.kind, &record.payload, DeliveryChannel::Direct)
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    /// Last consumed record id.
    pub fn cursor(&self) -> Option<u64> {
        *lock(&self.inner.cursor)
    }

    /// Consecutive failed attempts since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        let previous = std::mem::replace(&mut *lock(&self.state), next);
        if previous != next {
            log::info!("Stream client {previous:?} -> {next:?}");
            self.bus.publish(SyncEvent::Status(next));
        }
    }

    fn stream_url(&self) -> String {
        let base = &self.config.server_url;
        match *lock(&self.cursor) {
            Some(cursor) => {
                let sep = if base.contains('?') { '&' } else { '?' };
                format!("{base}{sep}since={cursor}")
            }
            None => base.clone(),
        }
    }

    fn fail(&self, err: ClientError) {
        log::error!("Stream client stopped: {err}");
        self.set_state(ConnectionState::Failed);
        self.bus.publish(SyncEvent::Failed {
            reason: err.to_string(),
        });
    }

    async fn drive(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        loop {
            if *stop.borrow_and_update() {
                break;
            }
            self.set_state(ConnectionState::Connecting);
            let url = self.stream_url();
            log::debug!("Connecting to {url}");

            let connected = tokio::select! {
                result = tokio_tungstenite::connect_async(url.as_str()) => result,
                _ = stop.changed() => break,
            };

            let lost = match connected {
                Ok((ws, _)) => {
                    self.attempts.store(0, Ordering::SeqCst);
                    self.fresh.store(true, Ordering::SeqCst);
                    self.set_state(ConnectionState::Connected);
                    log::info!("Stream connected to {}", self.config.server_url);
                    match self.consume(ws, &mut stop).await {
                        StreamEnd::Reconnect => continue,
                        StreamEnd::Stopped => break,
                        StreamEnd::Lost(err) => err,
                    }
                }
                Err(e) => match ClientError::from(e) {
                    err @ ClientError::AuthRequired(_) => {
                        self.fail(err);
                        return;
                    }
                    err => err,
                },
            };

            self.set_state(ConnectionState::BackingOff);
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > self.config.policy.max_attempts {
                self.fail(ClientError::AttemptsExhausted(self.config.policy.max_attempts));
                return;
            }
            let delay = self.config.policy.delay(attempt);
            log::info!("Stream lost ({lost}); retry {attempt} in {delay:?}");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.changed() => break,
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn consume(
        &self,
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
        stop: &mut watch::Receiver<bool>,
    ) -> StreamEnd {
        let (mut sink, mut stream) = ws.split();
        loop {
            tokio::select! {
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => match Frame::decode(text.as_str()) {
                        Ok(frame) => {
                            if let Some(end) = self.handle_frame(frame) {
                                let _ = sink.close().await;
                                return end;
                            }
                        }
                        Err(e) => log::warn!("Ignoring unreadable frame: {e}"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return StreamEnd::Lost(ClientError::TransientNetwork("stream closed".into()));
                    }
                    Some(Err(e)) => return StreamEnd::Lost(ClientError::from(e)),
                    Some(Ok(_)) => {}
                },
                _ = stop.changed() => {
                    let _ = sink.close().await;
                    return StreamEnd::Stopped;
                }
            }
        }
    }

    /// Process one frame; `Some` ends the current connection.
    fn handle_frame(&self, frame: Frame) -> Option<StreamEnd> {
        let Some(kind) = frame.event.record_kind() else {
            return match frame.event {
                FrameEvent::Reconnect => {
                    log::debug!("Server requested reconnect at {}", frame.id);
                    Some(StreamEnd::Reconnect)
                }
                FrameEvent::Timeout => Some(StreamEnd::Lost(ClientError::TransientNetwork(
                    "server dropped a slow stream".into(),
                ))),
                _ => None,
            };
        };

        // The server only sends ids above the presented cursor, unless the
        // cursor was ahead of its log. The first record then resets it.
        let first = self.fresh.swap(false, Ordering::SeqCst);
        let previous = {
            let mut cursor = lock(&self.cursor);
            let previous = *cursor;
            if !first && previous.is_some_and(|c| frame.id <= c) {
                log::debug!("Skipping already consumed record {}", frame.id);
                return None;
            }
            *cursor = Some(frame.id);
            previous
        };
        if let Some(last) = previous {
            let expected = last + 1;
            if frame.id > expected {
                log::warn!("Cursor jumped from {last} to {}; records were pruned", frame.id);
            } else if frame.id < expected {
                log::warn!("Cursor reset from {last} to {}; server log restarted", frame.id);
            }
            if frame.id != expected {
                self.bus.publish(SyncEvent::CursorJump {
                    expected,
                    received: frame.id,
                });
            }
        }

        if kind != UpdateKind::Heartbeat {
            self.dispatch(frame.id, kind, &frame.data, DeliveryChannel::Stream);
        }
        None
    }

    fn dispatch(&self, id: u64, kind: UpdateKind, payload: &Value, channel: DeliveryChannel) -> bool {
        if !lock(&self.dedup).admit(channel, kind, payload) {
            return false;
        }
        let event = match kind {
            UpdateKind::UserCreated => SyncEvent::RefreshRoster {
                id,
                payload: payload.clone(),
            },
            _ => SyncEvent::Apply {
                id,
                kind,
                payload: payload.clone(),
                channel,
            },
        };
        self.bus.publish(event);
        true
    }
}
