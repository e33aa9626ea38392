//! In-memory backend for deployments without a data directory, and for tests.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use super::{LogBackend, StoreError};

/// `BTreeMap`-backed log store. Iteration order is id order.
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<u64, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Unavailable("memory store lock poisoned".into())
}

impl LogBackend for MemoryBackend {
    fn last_id(&self) -> Result<Option<u64>, StoreError> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.keys().next_back().copied())
    }

    fn put(&self, id: u64, bytes: Vec<u8>) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.insert(id, bytes);
        Ok(())
    }

    fn scan_after(&self, since: u64, limit: usize) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries
            .range((Bound::Excluded(since), Bound::Unbounded))
            .take(limit)
            .map(|(id, bytes)| (*id, bytes.clone()))
            .collect())
    }

    fn delete(&self, ids: &[u64]) -> Result<usize, StoreError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        Ok(ids.iter().filter(|id| entries.remove(*id).is_some()).count())
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.entries.read().map_err(poisoned)?.len())
    }
}
