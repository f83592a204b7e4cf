//! Per stage configuration of the reduce steps.
//!
//! The accumulator reduces usage events per resource instance, the
//! aggregator reduces accumulated documents per organization. Each kind
//! decides which scopes guard its documents and under which keys and
//! times it writes its output.

use crate::config::ConfigError;
use crate::key::build_key;
use crate::seqid::SequenceId;
use crate::usage::UsageEvent;
use std::fmt;
use std::str::FromStr;

pub const SYSTEM_WRITE_SCOPE: &str = "usage.write";
pub const SYSTEM_READ_SCOPE: &str = "usage.read";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReducerKind {
    Accumulator,
    Aggregator,
}

impl FromStr for ReducerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accumulator" => Ok(ReducerKind::Accumulator),
            "aggregator" => Ok(ReducerKind::Aggregator),
            other => Err(ConfigError::UnsupportedReducer(other.to_string())),
        }
    }
}

impl fmt::Display for ReducerKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReducerKind::Accumulator => write!(f, "accumulator"),
            ReducerKind::Aggregator => write!(f, "aggregator"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReducerConfig {
    pub kind: ReducerKind,
    pub secured: bool,
}

impl ReducerConfig {
    pub fn new(kind: ReducerKind, secured: bool) -> Self {
        Self { kind, secured }
    }

    /// Builds the configuration of a reducer from its name.
    pub fn for_kind(kind: &str, secured: bool) -> Result<Self, ConfigError> {
        Ok(Self::new(kind.parse()?, secured))
    }

    /// Scopes allowed to write input documents, `None` when unsecured.
    /// Usage can be written with the resource's own scope or the system
    /// scope; accumulated documents only with the system scope.
    pub fn write_scopes(&self, resource_id: &str) -> Option<Vec<String>> {
        if !self.secured {
            return None;
        }
        Some(match self.kind {
            ReducerKind::Accumulator => vec![
                format!("usage.{}.write", resource_id),
                SYSTEM_WRITE_SCOPE.to_string(),
            ],
            ReducerKind::Aggregator => vec![SYSTEM_WRITE_SCOPE.to_string()],
        })
    }

    /// Scopes allowed to read input and output documents, `None` when
    /// unsecured.
    pub fn read_scopes(&self, resource_id: &str) -> Option<Vec<String>> {
        if !self.secured {
            return None;
        }
        Some(match self.kind {
            ReducerKind::Accumulator => vec![
                format!("usage.{}.read", resource_id),
                SYSTEM_READ_SCOPE.to_string(),
            ],
            ReducerKind::Aggregator => vec![SYSTEM_READ_SCOPE.to_string()],
        })
    }

    /// Keys the reducer writes its output under for an event.
    ///
    /// The aggregator writes per organization, consumer and space, plus
    /// a marker for the accumulated lineage it applied.
    pub fn output_keys(&self, usage: &UsageEvent) -> Vec<String> {
        let lineage = build_key(usage).to_string();
        match self.kind {
            ReducerKind::Accumulator => vec![lineage],
            ReducerKind::Aggregator => vec![
                usage.organization_id.clone(),
                format!("{}/{}/{}", usage.organization_id, usage.space_id, usage.consumer()),
                format!("{}/{}", usage.organization_id, usage.space_id),
                lineage,
            ],
        }
    }

    /// Times matching `output_keys`. Aggregated documents are bucketed
    /// by sampling the sequence id; the marker keeps the exact one.
    pub fn output_times(&self, seq: &SequenceId, sampling_millis: i64) -> Vec<String> {
        match self.kind {
            ReducerKind::Accumulator => vec![seq.to_string()],
            ReducerKind::Aggregator => {
                let bucket = seq.sample(sampling_millis).to_string();
                vec![bucket.clone(), bucket.clone(), bucket, seq.to_string()]
            }
        }
    }
}
