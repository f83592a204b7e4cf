//! Distributes time based versions of document keys over a set of
//! partitions.
//!
//! A key is hashed to one of [`BUCKETS`] logical buckets and a time is
//! mapped to a period (days since the epoch). A [`Forward`] policy turns
//! the (bucket, period) pair into physical partition candidates, and
//! balancing picks one read replica among them. Everything here is a
//! pure function of its inputs so every worker computes the same route.

use chrono::{DateTime, Datelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{event, Level};
use xxhash_rust::xxh3::xxh3_64_with_seed;

pub const BUCKETS: u32 = 4000;
const SEED: u64 = 42;
const DAY_MILLIS: i64 = 86400000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionRef {
    pub partition: u32,
    /// Rollover epoch, YYYYMM for the default policy.
    pub epoch: u32,
    pub replica: u32,
}

impl PartitionRef {
    pub fn new(partition: u32, epoch: u32) -> Self {
        Self {
            partition,
            epoch,
            replica: 0,
        }
    }

    /// The replica that accepts writes for this partition.
    pub fn primary(&self) -> PartitionRef {
        PartitionRef {
            replica: 0,
            ..*self
        }
    }
}

impl fmt::Display for PartitionRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.partition, self.epoch)?;
        if self.replica > 0 {
            write!(f, "-r{}", self.replica)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
}

#[derive(Error, Debug, PartialEq)]
pub enum PartitionError {
    #[error("cannot forward a write operation without a key")]
    MissingKey,

    #[error("forward policy returned no partition for bucket {0:?}, period {1}")]
    NoPartition(Option<u32>, i64),

    #[error("time {0} cannot be mapped to a partition epoch")]
    InvalidTime(i64),
}

/// Maps a key to a bucket. Empty or missing keys have no bucket.
pub fn bucket(key: Option<&str>) -> Option<u32> {
    key.filter(|k| !k.is_empty())
        .map(|k| (xxh3_64_with_seed(k.as_bytes(), SEED) % u64::from(BUCKETS)) as u32)
}

/// Maps a time to a period, one per UTC day.
pub fn period(time: i64) -> i64 {
    time.div_euclid(DAY_MILLIS)
}

/// Converts a period to its YYYYMM epoch.
pub fn month_epoch(period: i64) -> Result<u32, PartitionError> {
    let time = period * DAY_MILLIS;
    let date = DateTime::from_timestamp_millis(time).ok_or(PartitionError::InvalidTime(time))?;
    Ok(date.year() as u32 * 100 + date.month())
}

/// Remaps a (bucket, period) pair onto physical partitions. Changing the
/// policy re-shards without changing the hashing.
pub trait Forward: Send + Sync {
    fn forward(
        &self,
        bucket: Option<u32>,
        period: i64,
        op: Operation,
    ) -> Result<Vec<PartitionRef>, PartitionError>;
}

/// Spreads buckets evenly over `partitions` partitions, one epoch per
/// month. Keyless reads fan out to every partition.
#[derive(Clone, Debug)]
pub struct MonthlyForward {
    pub partitions: u32,
    pub replicas: u32,
}

impl Forward for MonthlyForward {
    fn forward(
        &self,
        bucket: Option<u32>,
        period: i64,
        op: Operation,
    ) -> Result<Vec<PartitionRef>, PartitionError> {
        let epoch = month_epoch(period)?;
        let partitions = self.partitions.max(1);
        match bucket {
            None if op == Operation::Write => Err(PartitionError::MissingKey),
            None => Ok((0..partitions).map(|p| PartitionRef::new(p, epoch)).collect()),
            Some(b) => {
                let partition = (u64::from(b) * u64::from(partitions) / u64::from(BUCKETS)) as u32;
                Ok((0..self.replicas.max(1))
                    .map(|replica| PartitionRef {
                        partition,
                        epoch,
                        replica,
                    })
                    .collect())
            }
        }
    }
}

/// A single partition and epoch for databases that are not sharded.
#[derive(Clone, Debug, Default)]
pub struct SingletonForward;

impl Forward for SingletonForward {
    fn forward(
        &self,
        _bucket: Option<u32>,
        _period: i64,
        _op: Operation,
    ) -> Result<Vec<PartitionRef>, PartitionError> {
        Ok(vec![PartitionRef::new(0, 0)])
    }
}

pub struct Partitioner {
    forward: Box<dyn Forward>,
    balance: bool,
}

impl Partitioner {
    /// The default policy over `num_partitions` partitions.
    pub fn new(num_partitions: u32) -> Self {
        Self::with_forward(
            Box::new(MonthlyForward {
                partitions: num_partitions,
                replicas: 1,
            }),
            false,
        )
    }

    pub fn singleton() -> Self {
        Self::with_forward(Box::new(SingletonForward), false)
    }

    pub fn with_forward(forward: Box<dyn Forward>, balance: bool) -> Self {
        Self { forward, balance }
    }

    /// Picks one candidate. Writes always go to the primary replica;
    /// reads are spread over replicas when balancing is on.
    fn balance(&self, key: &str, period: i64, op: Operation, candidates: &[PartitionRef]) -> PartitionRef {
        let primary = candidates
            .iter()
            .find(|c| c.replica == 0)
            .unwrap_or(&candidates[0]);
        if !self.balance || op == Operation::Write || candidates.len() == 1 {
            return *primary;
        }
        let seed = format!("{}/{}", key, period);
        let i = xxh3_64_with_seed(seed.as_bytes(), SEED) % candidates.len() as u64;
        candidates[i as usize]
    }

    fn candidates(
        &self,
        key: Option<&str>,
        period: i64,
        op: Operation,
    ) -> Result<Vec<PartitionRef>, PartitionError> {
        let b = bucket(key);
        let candidates = self.forward.forward(b, period, op)?;
        if candidates.is_empty() {
            return Err(PartitionError::NoPartition(b, period));
        }
        Ok(candidates)
    }

    /// Routes a key and time to a single partition.
    pub fn route(&self, key: &str, time: i64, op: Operation) -> Result<PartitionRef, PartitionError> {
        if key.is_empty() {
            return Err(PartitionError::MissingKey);
        }
        let p = period(time);
        let candidates = self.candidates(Some(key), p, op)?;
        let par = self.balance(key, p, op, &candidates);
        event!(
            Level::DEBUG,
            "Routed key {} time {} {:?} to partition {}",
            key,
            time,
            op,
            par
        );
        Ok(par)
    }

    /// Routes a key over every period between two times, in either
    /// direction, returning each partition once.
    pub fn route_range(
        &self,
        key: &str,
        from: i64,
        to: i64,
        op: Operation,
    ) -> Result<Vec<PartitionRef>, PartitionError> {
        let (first, last) = (period(from), period(to));
        let periods: Vec<i64> = if last >= first {
            (first..=last).collect()
        } else {
            (last..=first).rev().collect()
        };
        let mut routed: Vec<PartitionRef> = Vec::new();
        for p in periods {
            let candidates = self.candidates(Some(key), p, op)?;
            let par = self.balance(key, p, op, &candidates);
            if !routed.contains(&par) {
                routed.push(par);
            }
        }
        Ok(routed)
    }

    /// Every partition holding data for a time, for keyless reads.
    pub fn route_all(&self, time: i64) -> Result<Vec<PartitionRef>, PartitionError> {
        self.candidates(None, period(time), Operation::Read)
    }
}
