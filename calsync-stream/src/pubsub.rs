//! Typed publish/subscribe with synchronous delivery.
//!
//! `publish` runs every handler on the calling thread before it returns.
//! Handlers receive the bus itself and may publish from inside a handler:
//! such a nested event is queued and delivered after the current handler
//! returns, by the same drain loop, so there is no recursion and no
//! self-deadlock. A cascade longer than `max_cascade` events is cut off
//! with a warning instead of looping forever.
//!
//! Publishers on other threads wait for the active drain to finish and
//! then drain themselves, so events are always delivered in FIFO order.
//! A handler must not block on another thread that is publishing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, ThreadId};

/// Default cap on events delivered by one drain.
pub const DEFAULT_MAX_CASCADE: usize = 1024;

pub type Handler<E> = Arc<dyn Fn(&E, &EventBus<E>) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct EventBus<E> {
    handlers: RwLock<Vec<(SubscriptionId, Handler<E>)>>,
    queue: Mutex<VecDeque<E>>,
    drain_lock: Mutex<()>,
    drainer: Mutex<Option<ThreadId>>,
    next_id: AtomicU64,
    max_cascade: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<E: Send> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CASCADE)
    }
}

impl<E: Send> EventBus<E> {
    pub fn new(max_cascade: usize) -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            drain_lock: Mutex::new(()),
            drainer: Mutex::new(None),
            next_id: AtomicU64::new(0),
            max_cascade: max_cascade.max(1),
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&E, &EventBus<E>) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|(sid, _)| *sid != id);
        handlers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Deliver `event` to every subscriber.
    pub fn publish(&self, event: E) {
        lock(&self.queue).push_back(event);

        let me = thread::current().id();
        if *lock(&self.drainer) == Some(me) {
            // Re-entrant publish from a handler; the outer drain picks it up
            return;
        }

        let _drain = lock(&self.drain_lock);
        *lock(&self.drainer) = Some(me);
        self.drain();
        *lock(&self.drainer) = None;
    }

    fn drain(&self) {
        let mut delivered = 0;
        loop {
            let Some(event) = lock(&self.queue).pop_front() else {
                return;
            };
            if delivered >= self.max_cascade {
                let dropped = {
                    let mut queue = lock(&self.queue);
                    let n = queue.len() + 1;
                    queue.clear();
                    n
                };
                log::warn!("Event cascade exceeded {} deliveries; dropped {dropped} events", self.max_cascade);
                return;
            }

            // Snapshot so handlers may (un)subscribe while being called
            let handlers: Vec<Handler<E>> = self
                .handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .map(|(_, h)| h.clone())
                .collect();
            for handler in handlers {
                handler(&event, self);
            }
            delivered += 1;
        }
    }
}
