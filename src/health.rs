//! Tracks whether the pipeline is keeping up.
//!
//! A failure starts a grace period; if no success arrives before it
//! ends the pipeline reports unhealthy until the next success.

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{event, Level};

pub struct HealthMonitor {
    threshold_millis: i64,
    failing_since: Mutex<Option<i64>>,
}

impl HealthMonitor {
    pub fn new(threshold_millis: i64) -> Self {
        Self {
            threshold_millis,
            failing_since: Mutex::new(None),
        }
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Utc::now().timestamp_millis());
    }

    /// Only the first failure of a streak counts.
    pub fn record_failure_at(&self, now: i64) {
        let mut since = self.failing_since.lock();
        if since.is_none() {
            event!(Level::WARN, "Usage processing started failing at {}", now);
            *since = Some(now);
        }
    }

    pub fn record_success(&self) {
        let mut since = self.failing_since.lock();
        if let Some(from) = since.take() {
            event!(Level::INFO, "Usage processing recovered, failing since {}", from);
        }
    }

    pub fn healthy(&self) -> bool {
        self.healthy_at(Utc::now().timestamp_millis())
    }

    pub fn healthy_at(&self, now: i64) -> bool {
        match *self.failing_since.lock() {
            None => true,
            Some(since) => now - since < self.threshold_millis,
        }
    }
}
