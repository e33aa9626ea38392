//! Append-only, strictly ordered change log.
//!
//! ```text
//!  append(kind, payload)
//!        │
//!        ▼
//!  ┌─────────────────── append lock ───────────────────┐
//!  │ id = next_id → encode → backend.put → publish(rec) │
//!  └────────────────────────────────────────────────────┘
//!        │                                     │
//!        ▼                                     ▼
//!   LogBackend (memory / RocksDB)        BroadcastGroup
//! ```
//!
//! The append lock is the only serialization point of the subsystem. Ids
//! are handed out, stored and published inside it, so every listener
//! observes ids in the same ascending order they were assigned.
//!
//! Reference: Kleppmann, DDIA, Chapter 11 (Log-based Message Brokers)

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::broadcast::{BroadcastGroup, ListenerInfo};
use crate::protocol::{now_millis, UpdateKind, UpdateRecord};
use crate::storage::{decode_record, encode_record, LogBackend, MemoryBackend, StoreError};

/// Internal retries of a write that collided with another writer.
pub const APPEND_CONFLICT_RETRIES: u32 = 5;

/// Pause before the n-th conflict retry is `n` times this.
const CONFLICT_BACKOFF: Duration = Duration::from_millis(1);

/// Records read from the backend per scan.
const SCAN_PAGE: usize = 512;

/// Update log errors.
#[derive(Debug, Clone, Error)]
pub enum LogError {
    #[error("Append failed: {0}")]
    Append(#[source] StoreError),
    #[error("Query failed: {0}")]
    Query(#[source] StoreError),
    #[error("Prune failed: {0}")]
    Prune(#[source] StoreError),
    #[error("Update log lock poisoned")]
    Poisoned,
}

/// Log-level counters.
#[derive(Debug, Clone, Default)]
pub struct LogStats {
    pub appended: u64,
    pub pruned: u64,
    pub malformed_skipped: u64,
    pub next_id: u64,
}

/// The update log.
pub struct UpdateLog {
    backend: Arc<dyn LogBackend>,
    /// Next id to assign. Held for the whole append.
    next_id: Mutex<u64>,
    live: Arc<BroadcastGroup>,
    appended: AtomicU64,
    pruned: AtomicU64,
    malformed_skipped: AtomicU64,
}

impl UpdateLog {
    /// Open a log over `backend`, resuming ids after the highest stored one.
    ///
    /// `listener_capacity` bounds how far a live listener may fall behind.
    pub fn open(backend: Arc<dyn LogBackend>, listener_capacity: usize) -> Result<Self, LogError> {
        let last = backend.last_id().map_err(LogError::Query)?;
        let next_id = last.map_or(1, |id| id + 1);
        if let Some(last) = last {
            log::info!("Update log resuming after id {last}");
        }
        Ok(Self {
            backend,
            next_id: Mutex::new(next_id),
            live: Arc::new(BroadcastGroup::new(listener_capacity)),
            appended: AtomicU64::new(0),
            pruned: AtomicU64::new(0),
            malformed_skipped: AtomicU64::new(0),
        })
    }

    /// In-memory log, nothing survives the process.
    pub fn in_memory(listener_capacity: usize) -> Self {
        Self {
            backend: Arc::new(MemoryBackend::new()),
            next_id: Mutex::new(1),
            live: Arc::new(BroadcastGroup::new(listener_capacity)),
            appended: AtomicU64::new(0),
            pruned: AtomicU64::new(0),
            malformed_skipped: AtomicU64::new(0),
        }
    }

    /// Assign the next id, store the record and push it to live listeners.
    ///
    /// Blocks on the backend write; async callers go through
    /// `spawn_blocking`. Write conflicts are retried internally. Any other
    /// store failure is returned and the id is not consumed.
    pub fn append(&self, kind: UpdateKind, payload: Value) -> Result<u64, LogError> {
        let mut next_id = self.next_id.lock().map_err(|_| LogError::Poisoned)?;
        let id = *next_id;
        let record = UpdateRecord::new(id, kind, payload);
        let bytes = encode_record(&record).map_err(LogError::Append)?;

        let mut conflicts = 0;
        loop {
            match self.backend.put(id, bytes.clone()) {
                Ok(()) => break,
                Err(StoreError::Conflict(reason)) if conflicts < APPEND_CONFLICT_RETRIES => {
                    conflicts += 1;
                    log::debug!("Write conflict appending id {id} (attempt {conflicts}): {reason}");
                    std::thread::sleep(CONFLICT_BACKOFF * conflicts);
                }
                Err(e) => {
                    log::error!("Failed to append {} record: {e}", kind.as_str());
                    return Err(LogError::Append(e));
                }
            }
        }

        *next_id = id + 1;
        self.appended.fetch_add(1, Ordering::Relaxed);
        self.live.publish(Arc::new(record));
        Ok(id)
    }

    /// Append, retrying a failing store up to `attempts` times.
    ///
    /// Used by the entity store after its own mutation already committed;
    /// if every attempt fails the change stays durable but invisible to
    /// the stream, and the last error is returned.
    pub async fn append_with_retry(
        &self,
        kind: UpdateKind,
        payload: Value,
        attempts: u32,
        delay: Duration,
    ) -> Result<u64, LogError> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.append(kind, payload.clone()) {
                Ok(id) => return Ok(id),
                Err(e) if attempt < attempts => {
                    log::warn!("Append attempt {attempt}/{attempts} failed: {e}");
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// All retained records with id greater than `since_id`, ascending.
    ///
    /// Malformed stored records are logged and skipped.
    pub fn query(&self, since_id: u64) -> Result<Vec<UpdateRecord>, LogError> {
        let mut records = Vec::new();
        let mut cursor = since_id;
        loop {
            let page = self.backend.scan_after(cursor, SCAN_PAGE).map_err(LogError::Query)?;
            let page_len = page.len();
            for (id, bytes) in page {
                cursor = id;
                match decode_record(&bytes) {
                    Ok(record) => records.push(record),
                    Err(e) if e.is_malformed_record() => {
                        self.malformed_skipped.fetch_add(1, Ordering::Relaxed);
                        log::warn!("Skipping malformed record {id}: {e}");
                    }
                    Err(e) => return Err(LogError::Query(e)),
                }
            }
            if page_len < SCAN_PAGE {
                return Ok(records);
            }
        }
    }

    /// Remove records older than `max_age`. Returns how many were removed.
    ///
    /// The newest record is always kept so a restarted log can never hand
    /// out an id again.
    pub fn prune(&self, max_age: Duration) -> Result<usize, LogError> {
        let cutoff = now_millis().saturating_sub(max_age.as_millis() as u64);
        let newest = {
            let next_id = self.next_id.lock().map_err(|_| LogError::Poisoned)?;
            next_id.saturating_sub(1)
        };

        let mut removed = 0;
        let mut cursor = 0;
        loop {
            let page = self.backend.scan_after(cursor, SCAN_PAGE).map_err(LogError::Prune)?;
            let page_len = page.len();
            let mut expired = Vec::new();
            let mut reached_live = false;

            for (id, bytes) in page {
                cursor = id;
                if id >= newest {
                    reached_live = true;
                    break;
                }
                match decode_record(&bytes) {
                    Ok(record) if record.created_at < cutoff => expired.push(id),
                    Ok(_) => {
                        reached_live = true;
                        break;
                    }
                    Err(e) if e.is_malformed_record() => {
                        log::warn!("Pruning malformed record {id}: {e}");
                        expired.push(id);
                    }
                    Err(e) => return Err(LogError::Prune(e)),
                }
            }

            removed += self.backend.delete(&expired).map_err(LogError::Prune)?;
            if reached_live || page_len < SCAN_PAGE {
                break;
            }
        }

        if removed > 0 {
            self.pruned.fetch_add(removed as u64, Ordering::Relaxed);
            log::info!("Pruned {removed} records older than {}s", max_age.as_secs());
        }
        Ok(removed)
    }

    /// Smallest retained id, if any.
    pub fn oldest_id(&self) -> Result<Option<u64>, LogError> {
        let first = self.backend.scan_after(0, 1).map_err(LogError::Query)?;
        Ok(first.first().map(|(id, _)| *id))
    }

    /// Id of the most recently appended record (0 when empty).
    pub fn latest_id(&self) -> Result<u64, LogError> {
        let next_id = self.next_id.lock().map_err(|_| LogError::Poisoned)?;
        Ok(next_id.saturating_sub(1))
    }

    /// Register a live listener. Subscribe before reading the backlog.
    pub async fn subscribe(&self, info: ListenerInfo) -> broadcast::Receiver<Arc<UpdateRecord>> {
        self.live.add_listener(info).await
    }

    /// The live fan-out group.
    pub fn live(&self) -> &Arc<BroadcastGroup> {
        &self.live
    }

    pub fn stats(&self) -> LogStats {
        LogStats {
            appended: self.appended.load(Ordering::Relaxed),
            pruned: self.pruned.load(Ordering::Relaxed),
            malformed_skipped: self.malformed_skipped.load(Ordering::Relaxed),
            next_id: self.next_id.lock().map(|n| *n).unwrap_or_default(),
        }
    }
}
