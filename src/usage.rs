//! The raw usage event submitted by resource providers.
//!
//! Events are immutable once submitted. Validation happens before an
//! event enters the pipeline; anything that fails here is rejected
//! synchronously and never accumulated.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Consumer id used when the submitter does not attribute usage
/// to a specific application.
pub const UNKNOWN_CONSUMER: &str = "UNKNOWN";

/// A single raw measure reported by a resource provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    pub measure: String,
    pub quantity: Decimal,
}

impl Measure {
    pub fn new(measure: &str, quantity: Decimal) -> Self {
        Self {
            measure: measure.to_string(),
            quantity,
        }
    }
}

/// Usage for one resource instance over `[start, end]`, times in
/// milliseconds since the epoch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub organization_id: String,
    pub space_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_id: Option<String>,
    pub resource_id: String,
    pub plan_id: String,
    pub resource_instance_id: String,
    pub metering_plan_id: String,
    pub rating_plan_id: String,
    pub pricing_plan_id: String,
    pub start: i64,
    pub end: i64,
    pub measured_usage: Vec<Measure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collected_usage_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_usage_id: Option<String>,
}

impl UsageEvent {
    pub fn consumer(&self) -> &str {
        self.consumer_id.as_deref().unwrap_or(UNKNOWN_CONSUMER)
    }

    /// Looks up the quantity reported for a measure.
    pub fn measure(&self, name: &str) -> Option<Decimal> {
        self.measured_usage
            .iter()
            .find(|m| m.measure == name)
            .map(|m| m.quantity)
    }

    /// Checks that every dimension needed to build keys and resolve
    /// plans is present. Returns the rejection reason otherwise.
    pub fn validate(&self) -> Result<(), String> {
        let required = [
            ("organization_id", &self.organization_id),
            ("space_id", &self.space_id),
            ("resource_id", &self.resource_id),
            ("plan_id", &self.plan_id),
            ("resource_instance_id", &self.resource_instance_id),
            ("metering_plan_id", &self.metering_plan_id),
            ("rating_plan_id", &self.rating_plan_id),
            ("pricing_plan_id", &self.pricing_plan_id),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(format!("missing required field {}", name));
            }
            if value.contains('/') {
                return Err(format!("field {} must not contain '/'", name));
            }
        }
        if let Some(dedup_id) = &self.dedup_id {
            if dedup_id.is_empty() || dedup_id.contains('/') {
                return Err("invalid dedup_id".to_string());
            }
        }
        if self.start < 0 || self.end < self.start {
            return Err(format!(
                "invalid usage time range [{}, {}]",
                self.start, self.end
            ));
        }
        if self.measured_usage.is_empty() {
            return Err("measured_usage is empty".to_string());
        }
        if self.measured_usage.iter().any(|m| m.measure.is_empty()) {
            return Err("measured_usage contains an unnamed measure".to_string());
        }
        Ok(())
    }
}
