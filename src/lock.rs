//! Per key mutual exclusion.
//!
//! Locking the same key from several workers queues them; different
//! keys never contend. Entries are removed when the last holder or
//! waiter goes away so the table only holds keys in use.

use dashmap::DashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use std::sync::Arc;
use tracing::{event, Level};

#[derive(Default)]
pub struct KeyLocker {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Holds the lock of a key until dropped, on every exit path.
pub struct KeyGuard<'a> {
    locker: &'a KeyLocker,
    key: String,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl KeyLocker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, key: &str) -> KeyGuard<'_> {
        let mutex = self.locks.entry(key.to_string()).or_default().clone();
        let guard = mutex.lock_arc();
        event!(Level::TRACE, "Locked {}", key);
        KeyGuard {
            locker: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Number of keys currently locked or waited on.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locker
            .locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
        event!(Level::TRACE, "Unlocked {}", self.key);
    }
}
