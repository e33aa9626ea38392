//! Fan-out of appended records to every live stream connection.
//!
//! Uses a tokio broadcast channel: one send reaches all subscribers and
//! never waits on any of them. Each listener reads through its own cursor
//! into a ring of `capacity` records; a listener that falls further behind
//! observes `Lagged` and is dropped by its connection loop instead of
//! stalling the appender or other listeners.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::UpdateRecord;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub records_published: u64,
    pub listeners_dropped: u64,
    pub active_listeners: usize,
}

/// Lock-free counters for the publish hot path.
struct AtomicBroadcastStats {
    records_published: AtomicU64,
    listeners_dropped: AtomicU64,
}

/// A registered stream connection.
#[derive(Debug, Clone)]
pub struct ListenerInfo {
    pub connection_id: Uuid,
    /// Remote address as reported by the transport
    pub remote: String,
    /// Cursor presented at connect time (`None` = latest)
    pub since: Option<u64>,
    pub connected_at: Instant,
}

impl ListenerInfo {
    pub fn new(remote: impl Into<String>, since: Option<u64>) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            remote: remote.into(),
            since,
            connected_at: Instant::now(),
        }
    }
}

/// Listener registry plus the shared broadcast channel.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<UpdateRecord>>,
    listeners: RwLock<HashMap<Uuid, ListenerInfo>>,
    /// Records buffered per listener before it counts as lagging
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            stats: AtomicBroadcastStats {
                records_published: AtomicU64::new(0),
                listeners_dropped: AtomicU64::new(0),
            },
        }
    }

    /// Register a listener and return its receiver.
    ///
    /// The receiver only sees records published after this call returns,
    /// so callers subscribe first and read the backlog second.
    pub async fn add_listener(&self, info: ListenerInfo) -> broadcast::Receiver<Arc<UpdateRecord>> {
        let rx = self.sender.subscribe();
        self.listeners.write().await.insert(info.connection_id, info);
        rx
    }

    pub async fn remove_listener(&self, connection_id: &Uuid) -> Option<ListenerInfo> {
        self.listeners.write().await.remove(connection_id)
    }

    /// Record that a listener was cut off for falling behind.
    pub fn record_dropped(&self) {
        self.stats.listeners_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Push a record to all current receivers. Never blocks.
    ///
    /// Returns the number of receivers it was queued for.
    pub fn publish(&self, record: Arc<UpdateRecord>) -> usize {
        let count = self.sender.send(record).unwrap_or(0);
        self.stats.records_published.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.read().await.len()
    }

    pub async fn listeners(&self) -> Vec<ListenerInfo> {
        self.listeners.read().await.values().cloned().collect()
    }

    pub async fn has_listener(&self, connection_id: &Uuid) -> bool {
        self.listeners.read().await.contains_key(connection_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            records_published: self.stats.records_published.load(Ordering::Relaxed),
            listeners_dropped: self.stats.listeners_dropped.load(Ordering::Relaxed),
            active_listeners: self.listeners.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
