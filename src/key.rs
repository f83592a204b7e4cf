//! Deterministic document keys derived from usage events.

use crate::usage::UsageEvent;
use serde::{Deserialize, Serialize};
use std::fmt;
use xxhash_rust::xxh3::xxh3_64;

/// Identifies one lineage of accumulated usage:
/// `org/instance/consumer/plan/metering/rating/pricing[/dedup]`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutputKey {
    pub organization_id: String,
    pub resource_instance_id: String,
    pub consumer_id: String,
    pub plan_id: String,
    pub metering_plan_id: String,
    pub rating_plan_id: String,
    pub pricing_plan_id: String,
    pub dedup_id: Option<String>,
}

impl OutputKey {
    /// Key of the lineage without the dedup extension.
    pub fn lineage(&self) -> OutputKey {
        OutputKey {
            dedup_id: None,
            ..self.clone()
        }
    }

    /// The composite plan key used inside aggregated documents.
    pub fn plan_key(&self) -> String {
        [
            self.plan_id.as_str(),
            self.metering_plan_id.as_str(),
            self.rating_plan_id.as_str(),
            self.pricing_plan_id.as_str(),
        ]
        .join("/")
    }
}

impl fmt::Display for OutputKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.organization_id,
            self.resource_instance_id,
            self.consumer_id,
            self.plan_key()
        )?;
        if let Some(dedup_id) = &self.dedup_id {
            write!(f, "/{}", dedup_id)?;
        }
        Ok(())
    }
}

/// Builds the output key of an event. Pure: the same event always
/// yields the same key, and a dedup id only ever extends it.
pub fn build_key(event: &UsageEvent) -> OutputKey {
    OutputKey {
        organization_id: event.organization_id.clone(),
        resource_instance_id: event.resource_instance_id.clone(),
        consumer_id: event.consumer().to_string(),
        plan_id: event.plan_id.clone(),
        metering_plan_id: event.metering_plan_id.clone(),
        rating_plan_id: event.rating_plan_id.clone(),
        pricing_plan_id: event.pricing_plan_id.clone(),
        dedup_id: event.dedup_id.clone(),
    }
}

/// The value recorded in the dedup filter for an event: its key, time
/// range and a fingerprint of what it measured.
pub fn dedup_value(key: &OutputKey, event: &UsageEvent) -> String {
    let measures = serde_json::to_vec(&event.measured_usage).unwrap_or_default();
    format!(
        "{}/t/{}/{}/{:016x}",
        key,
        crate::seqid::pad16(event.end),
        crate::seqid::pad16(event.start),
        xxh3_64(&measures)
    )
}
