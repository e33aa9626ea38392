//! Short-horizon suppression of duplicate deliveries.
//!
//! The same logical change can reach a client twice over one channel
//! (a retried push, a replayed backlog) and once more over the other
//! (the synchronous response to the client's own mutation). The guard
//! keys each delivery by `(channel, kind, payload fingerprint)`:
//!
//! - first sighting of a key: accepted
//! - same key again inside the window: discarded
//! - same key after the window: accepted again
//!
//! This is a debounce, not a membership test over the whole log. An
//! entity moved back to an earlier state after the window is applied.

use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::protocol::UpdateKind;

/// Default retention window.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(30);

/// Path a change arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryChannel {
    /// Pushed over the update stream
    Stream,
    /// Returned by the request that made the change locally
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub channel: DeliveryChannel,
    pub kind: UpdateKind,
    /// Canonical JSON of the payload (object keys are sorted)
    pub fingerprint: String,
}

impl DedupKey {
    pub fn new(channel: DeliveryChannel, kind: UpdateKind, payload: &Value) -> Self {
        Self {
            channel,
            kind,
            fingerprint: payload.to_string(),
        }
    }
}

pub struct DedupGuard {
    window: Duration,
    /// Key → time it was last accepted
    seen: HashMap<DedupKey, Instant>,
}

impl Default for DedupGuard {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}

impl DedupGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// Whether this delivery should be dispatched.
    pub fn admit(&mut self, channel: DeliveryChannel, kind: UpdateKind, payload: &Value) -> bool {
        self.admit_at(DedupKey::new(channel, kind, payload), Instant::now())
    }

    /// [`admit`](Self::admit) against an explicit clock.
    pub fn admit_at(&mut self, key: DedupKey, now: Instant) -> bool {
        self.evict_expired(now);
        if self.seen.contains_key(&key) {
            log::trace!("Suppressed duplicate {:?} delivery of {}", key.channel, key.kind.as_str());
            return false;
        }
        self.seen.insert(key, now);
        true
    }

    fn evict_expired(&mut self, now: Instant) {
        let window = self.window;
        self.seen
            .retain(|_, accepted| now.saturating_duration_since(*accepted) < window);
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Keys currently inside the window.
    pub fn tracked(&self) -> usize {
        self.seen.len()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}
