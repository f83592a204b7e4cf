//! Bounded, time expiring set of already processed usage.
//!
//! Membership is only as good as the cache: values evicted by capacity
//! or age are reported absent.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{event, Level};

pub const DEFAULT_CAPACITY: usize = 10000;
pub const DEFAULT_MAX_AGE_MILLIS: i64 = 24 * 3600 * 1000;

#[derive(Error, Debug)]
pub enum DedupError {
    #[error("failed to serialize dedup state")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to restore dedup state")]
    Deserialize(#[source] serde_json::Error),
}

#[derive(Debug)]
struct Entry {
    seen_at: i64,
    tick: u64,
}

#[derive(Debug, Default)]
struct Cache {
    entries: HashMap<String, Entry>,
    recency: BTreeMap<u64, String>,
    tick: u64,
}

impl Cache {
    fn touch(&mut self, value: &str) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(entry) = self.entries.get_mut(value) {
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            self.recency.insert(tick, value.to_string());
        }
    }

    fn remove(&mut self, value: &str) {
        if let Some(entry) = self.entries.remove(value) {
            self.recency.remove(&entry.tick);
        }
    }

    fn insert(&mut self, value: String, seen_at: i64, capacity: usize) {
        self.remove(&value);
        self.tick += 1;
        self.recency.insert(self.tick, value.clone());
        self.entries.insert(
            value,
            Entry {
                seen_at,
                tick: self.tick,
            },
        );
        while self.entries.len() > capacity {
            let Some((_, oldest)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    entries: Vec<(String, i64)>,
}

pub struct DedupFilter {
    capacity: usize,
    max_age_millis: i64,
    cache: Mutex<Cache>,
}

impl Default for DedupFilter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_MAX_AGE_MILLIS)
    }
}

impl DedupFilter {
    pub fn new(capacity: usize, max_age_millis: i64) -> Self {
        Self {
            capacity: capacity.max(1),
            max_age_millis,
            cache: Mutex::new(Cache::default()),
        }
    }

    pub fn add(&self, value: &str) {
        self.add_at(value, Utc::now().timestamp_millis());
    }

    pub fn add_at(&self, value: &str, now: i64) {
        self.cache
            .lock()
            .insert(value.to_string(), now, self.capacity);
    }

    pub fn has(&self, value: &str) -> bool {
        self.has_at(value, Utc::now().timestamp_millis())
    }

    pub fn has_at(&self, value: &str, now: i64) -> bool {
        let mut cache = self.cache.lock();
        let expired = match cache.entries.get(value) {
            None => return false,
            Some(entry) => now - entry.seen_at > self.max_age_millis,
        };
        if expired {
            event!(Level::DEBUG, "Dedup entry {} expired", value);
            cache.remove(value);
            return false;
        }
        cache.touch(value);
        true
    }

    pub fn len(&self) -> usize {
        self.cache.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serializes the cache, least recently used first.
    pub fn serialize(&self) -> Result<Vec<u8>, DedupError> {
        let cache = self.cache.lock();
        let entries = cache
            .recency
            .values()
            .filter_map(|v| cache.entries.get(v).map(|e| (v.clone(), e.seen_at)))
            .collect();
        serde_json::to_vec(&Snapshot { entries }).map_err(DedupError::Serialize)
    }

    /// Restores a serialized cache, merging it into the current
    /// contents. Capacity is enforced on the merged result.
    pub fn deserialize(&self, blob: &[u8]) -> Result<(), DedupError> {
        let snapshot: Snapshot = serde_json::from_slice(blob).map_err(DedupError::Deserialize)?;
        let restored = snapshot.entries.len();
        let mut cache = self.cache.lock();
        for (value, seen_at) in snapshot.entries {
            cache.insert(value, seen_at, self.capacity);
        }
        event!(
            Level::INFO,
            "Restored {} dedup entries, {} retained",
            restored,
            cache.entries.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::DedupFilter;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_add_and_has() {
        let filter = DedupFilter::new(10, 1000);
        assert!(!filter.has_at("a", 0));
        filter.add_at("a", 0);
        assert!(filter.has_at("a", 500));
        assert!(!filter.has_at("b", 500));
    }

    #[test]
    fn test_expired_entries_are_absent() {
        let filter = DedupFilter::new(10, 1000);
        filter.add_at("a", 0);
        assert!(!filter.has_at("a", 1001));
        assert!(filter.is_empty());
    }

    #[test]
    fn test_least_recently_used_is_evicted() {
        let filter = DedupFilter::new(2, 1000);
        filter.add_at("a", 0);
        filter.add_at("b", 0);
        assert!(filter.has_at("a", 1));
        filter.add_at("c", 2);
        assert!(filter.has_at("a", 3));
        assert!(!filter.has_at("b", 3));
        assert!(filter.has_at("c", 3));
    }

    #[test]
    fn test_survives_restart() {
        let filter = DedupFilter::new(10, 1000);
        filter.add_at("a", 0);
        filter.add_at("b", 10);
        let blob = filter.serialize().unwrap();

        let restored = DedupFilter::new(10, 1000);
        restored.deserialize(&blob).unwrap();
        assert!(restored.has_at("a", 20));
        assert!(restored.has_at("b", 20));
        assert_eq!(restored.len(), 2);
    }

    #[test]
    fn test_restore_respects_capacity() {
        let filter = DedupFilter::new(10, 1000);
        for i in 0..5 {
            filter.add_at(&i.to_string(), i);
        }
        let restored = DedupFilter::new(2, 1000);
        restored.deserialize(&filter.serialize().unwrap()).unwrap();
        assert_eq!(restored.len(), 2);
        assert!(restored.has_at("4", 10));
        assert!(!restored.has_at("0", 10));
    }

    #[test]
    fn test_garbage_blob() {
        let filter = DedupFilter::default();
        assert!(filter.deserialize(b"not json").is_err());
    }

    #[test]
    fn test_concurrent_workers() {
        let filter = Arc::new(DedupFilter::new(1000, 60000));
        thread::scope(|s| {
            for w in 0..4 {
                let filter = Arc::clone(&filter);
                s.spawn(move || {
                    for i in 0..100 {
                        filter.add_at(&format!("{}-{}", w, i), 0);
                    }
                });
            }
        });
        assert_eq!(filter.len(), 400);
        assert!(filter.has_at("3-99", 1));
    }
}
