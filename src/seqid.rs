//! Cluster wide sortable sequence ids.
//!
//! An id is the tuple (time, app index, cluster index, worker, counter)
//! rendered with fixed width fields so that string order and tuple
//! order agree. The per process counter state is an explicit object
//! shared by the generators of one process.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Zero pads a millisecond time to 16 digits.
pub fn pad16(millis: i64) -> String {
    format!("{:016}", millis)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceId {
    pub time: i64,
    pub app_index: u32,
    pub cluster_index: u32,
    pub worker: u32,
    pub counter: u32,
}

impl SequenceId {
    pub fn new(time: i64, app_index: u32, cluster_index: u32, worker: u32, counter: u32) -> Self {
        Self {
            time,
            app_index,
            cluster_index,
            worker,
            counter,
        }
    }

    /// Returns the id of the bucket of width `divisor` milliseconds
    /// covering this id. Sampling an already sampled id is a no-op.
    pub fn sample(&self, divisor: i64) -> SequenceId {
        let time = if divisor > 0 {
            self.time.div_euclid(divisor) * divisor
        } else {
            self.time
        };
        SequenceId {
            time,
            counter: 0,
            ..*self
        }
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}-{:04}-{:04}-{:04}-{:06}",
            pad16(self.time),
            self.app_index,
            self.cluster_index,
            self.worker,
            self.counter
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed sequence id {0:?}")]
pub struct ParseSequenceIdError(String);

impl FromStr for SequenceId {
    type Err = ParseSequenceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseSequenceIdError(s.to_string());
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 5 {
            return Err(err());
        }
        Ok(SequenceId {
            time: parts[0].parse().map_err(|_| err())?,
            app_index: parts[1].parse().map_err(|_| err())?,
            cluster_index: parts[2].parse().map_err(|_| err())?,
            worker: parts[3].parse().map_err(|_| err())?,
            counter: parts[4].parse().map_err(|_| err())?,
        })
    }
}

impl Serialize for SequenceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SequenceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Default)]
struct CounterState {
    last_time: i64,
    counter: u32,
}

/// Process local counter state. One per process, shared by every
/// generator of that process.
#[derive(Debug, Default)]
pub struct SequenceState {
    inner: Mutex<CounterState>,
}

impl SequenceState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the (time, counter) pair to stamp. Never goes back in
    /// time even if the wall clock does.
    fn advance(&self, now: i64) -> (i64, u32) {
        let mut state = self.inner.lock();
        if now > state.last_time {
            state.last_time = now;
            state.counter = 0;
        } else {
            state.counter += 1;
        }
        (state.last_time, state.counter)
    }
}

#[derive(Clone, Debug)]
pub struct SequenceIdGenerator {
    app_index: u32,
    cluster_index: u32,
    worker: u32,
    state: Arc<SequenceState>,
}

impl SequenceIdGenerator {
    pub fn new(app_index: u32, cluster_index: u32, worker: u32, state: Arc<SequenceState>) -> Self {
        Self {
            app_index,
            cluster_index,
            worker,
            state,
        }
    }

    /// A generator for another worker sharing this process's state.
    pub fn for_worker(&self, worker: u32) -> Self {
        Self {
            worker,
            ..self.clone()
        }
    }

    pub fn next(&self) -> SequenceId {
        self.next_at(Utc::now().timestamp_millis())
    }

    pub fn next_at(&self, now: i64) -> SequenceId {
        let (time, counter) = self.state.advance(now);
        SequenceId::new(time, self.app_index, self.cluster_index, self.worker, counter)
    }
}
