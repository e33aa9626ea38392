//! Backing stores for the update log.
//!
//! ```text
//! ┌────────────┐  encoded records   ┌──────────────────────────┐
//! │ UpdateLog  │ ─────────────────► │ LogBackend               │
//! │ (ordering) │                    │  ├── MemoryBackend (map) │
//! └────────────┘                    │  └── RocksBackend (CF)   │
//!                                   └──────────────────────────┘
//! ```
//!
//! Backends store opaque bytes keyed by record id and return them in
//! ascending id order. Ordering, id assignment and decoding live in
//! [`crate::update_log`].

pub mod envelope;
pub mod memory;
pub mod rocks;

use thiserror::Error;

pub use envelope::{decode_record, encode_record};
pub use memory::MemoryBackend;
pub use rocks::{RocksBackend, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Backing store cannot be reached; callers must not fabricate ids
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    /// Concurrent writer collided with this one; safe to retry
    #[error("Write conflict: {0}")]
    Conflict(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Checksum mismatch for record {id}")]
    ChecksumMismatch { id: u64 },
}

impl StoreError {
    /// Whether the error describes one bad record rather than a failing store.
    pub fn is_malformed_record(&self) -> bool {
        matches!(
            self,
            Self::Deserialization(_) | Self::Compression(_) | Self::ChecksumMismatch { .. }
        )
    }
}

/// Ordered byte store keyed by record id.
///
/// Implementations are called with the log's append lock held for writes,
/// so they need not order concurrent `put`s themselves.
pub trait LogBackend: Send + Sync {
    /// Highest id ever stored, used to resume id assignment after restart.
    fn last_id(&self) -> Result<Option<u64>, StoreError>;

    /// Store the encoded record under `id`.
    fn put(&self, id: u64, bytes: Vec<u8>) -> Result<(), StoreError>;

    /// Entries with id strictly greater than `since`, ascending, at most `limit`.
    fn scan_after(&self, since: u64, limit: usize) -> Result<Vec<(u64, Vec<u8>)>, StoreError>;

    /// Remove the given ids. Missing ids are ignored.
    fn delete(&self, ids: &[u64]) -> Result<usize, StoreError>;

    /// Number of stored entries.
    fn len(&self) -> Result<usize, StoreError>;
}
