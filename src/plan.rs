//! Metering, rating and pricing plans.
//!
//! Per metric formulas are a closed set of named combinators stored as
//! plain data. A plan is validated when it is loaded and is immutable
//! afterwards, so it can be cached for the lifetime of the process.

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{event, Level};

pub const HOUR_MILLIS: i64 = 3600000;
pub const DEFAULT_COUNTRY: &str = "USA";

#[derive(Error, Debug, PartialEq)]
pub enum PlanError {
    #[error("unknown metering plan {0}")]
    UnknownMeteringPlan(String),

    #[error("unknown rating plan {0}")]
    UnknownRatingPlan(String),

    #[error("unknown pricing plan {0}")]
    UnknownPricingPlan(String),

    #[error("invalid plan {plan}: metric {metric}: {reason}")]
    InvalidMetric {
        plan: String,
        metric: String,
        reason: String,
    },

    #[error("malformed plan document: {0}")]
    Malformed(String),
}

/// Whether a metric's quantities are plain numbers or a burn rate over
/// time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricKind {
    Discrete,
    Continuous,
}

fn hour() -> i64 {
    HOUR_MILLIS
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeterFn {
    /// The raw quantity of one measure.
    Measure { measure: String },
    /// One measure divided by a constant, e.g. bytes to GB.
    Divide { measure: String, divisor: Decimal },
    /// The product of several measures.
    Multiply { measures: Vec<String> },
    /// A burn rate: the product of several measures, optionally divided,
    /// consumed from the event start.
    Consuming {
        measures: Vec<String>,
        #[serde(default)]
        divisor: Option<Decimal>,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccumulateFn {
    #[default]
    Sum,
    Max,
    Continuous,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFn {
    #[default]
    Sum,
    Continuous,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummarizeFn {
    #[default]
    Quantity,
    Continuous {
        #[serde(default = "hour")]
        unit_millis: i64,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateFn {
    #[default]
    Price,
    Continuous,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeFn {
    #[default]
    Cost,
    Continuous {
        #[serde(default = "hour")]
        unit_millis: i64,
    },
}

impl MeterFn {
    pub fn kind(&self) -> MetricKind {
        match self {
            MeterFn::Consuming { .. } => MetricKind::Continuous,
            _ => MetricKind::Discrete,
        }
    }

    pub fn measures(&self) -> Vec<&str> {
        match self {
            MeterFn::Measure { measure } | MeterFn::Divide { measure, .. } => vec![measure.as_str()],
            MeterFn::Multiply { measures } | MeterFn::Consuming { measures, .. } => {
                measures.iter().map(String::as_str).collect()
            }
        }
    }
}

impl AccumulateFn {
    pub fn kind(&self) -> MetricKind {
        match self {
            AccumulateFn::Continuous => MetricKind::Continuous,
            _ => MetricKind::Discrete,
        }
    }
}

impl AggregateFn {
    pub fn kind(&self) -> MetricKind {
        match self {
            AggregateFn::Continuous => MetricKind::Continuous,
            AggregateFn::Sum => MetricKind::Discrete,
        }
    }
}

impl SummarizeFn {
    pub fn kind(&self) -> MetricKind {
        match self {
            SummarizeFn::Continuous { .. } => MetricKind::Continuous,
            SummarizeFn::Quantity => MetricKind::Discrete,
        }
    }
}

impl RateFn {
    pub fn kind(&self) -> MetricKind {
        match self {
            RateFn::Continuous => MetricKind::Continuous,
            RateFn::Price => MetricKind::Discrete,
        }
    }
}

impl ChargeFn {
    pub fn kind(&self) -> MetricKind {
        match self {
            ChargeFn::Continuous { .. } => MetricKind::Continuous,
            ChargeFn::Cost => MetricKind::Discrete,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasureDef {
    pub name: String,
    pub unit: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeteringMetric {
    pub name: String,
    pub unit: String,
    /// Defaults to the measure named like the metric.
    #[serde(default)]
    pub meter: Option<MeterFn>,
    #[serde(default)]
    pub accumulate: AccumulateFn,
    #[serde(default)]
    pub aggregate: AggregateFn,
    #[serde(default)]
    pub summarize: SummarizeFn,
}

impl MeteringMetric {
    pub fn meter_fn(&self) -> MeterFn {
        self.meter.clone().unwrap_or_else(|| MeterFn::Measure {
            measure: self.name.clone(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeteringPlan {
    pub metering_plan_id: String,
    pub measures: Vec<MeasureDef>,
    pub metrics: Vec<MeteringMetric>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RatingMetric {
    pub name: String,
    #[serde(default)]
    pub rate: RateFn,
    #[serde(default)]
    pub charge: ChargeFn,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RatingPlan {
    pub rating_plan_id: String,
    pub metrics: Vec<RatingMetric>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub country: String,
    pub price: Decimal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PricedMetric {
    pub name: String,
    pub prices: Vec<Price>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PricingPlan {
    pub pricing_plan_id: String,
    pub metrics: Vec<PricedMetric>,
}

impl PricingPlan {
    /// The configured price of a metric in a country, zero when absent.
    pub fn price(&self, metric: &str, country: &str) -> Decimal {
        self.metrics
            .iter()
            .find(|m| m.name == metric)
            .and_then(|m| m.prices.iter().find(|p| p.country == country))
            .map(|p| p.price)
            .unwrap_or(Decimal::ZERO)
    }
}

fn invalid(plan: &str, metric: &str, reason: impl Into<String>) -> PlanError {
    PlanError::InvalidMetric {
        plan: plan.to_string(),
        metric: metric.to_string(),
        reason: reason.into(),
    }
}

impl MeteringPlan {
    pub fn from_json(json: &str) -> Result<Self, PlanError> {
        let plan: MeteringPlan =
            serde_json::from_str(json).map_err(|e| PlanError::Malformed(e.to_string()))?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn metric(&self, name: &str) -> Option<&MeteringMetric> {
        self.metrics.iter().find(|m| m.name == name)
    }

    /// Checks that every slot of every metric agrees on the metric kind
    /// and only reads declared measures.
    pub fn validate(&self) -> Result<(), PlanError> {
        let id = self.metering_plan_id.as_str();
        let mut seen = Vec::new();
        for metric in &self.metrics {
            if seen.contains(&metric.name.as_str()) {
                return Err(invalid(id, &metric.name, "duplicate metric"));
            }
            seen.push(metric.name.as_str());

            let meter = metric.meter_fn();
            for measure in meter.measures() {
                if !self.measures.iter().any(|m| m.name == measure) {
                    return Err(invalid(id, &metric.name, format!("undeclared measure {}", measure)));
                }
            }
            match &meter {
                MeterFn::Divide { divisor, .. } | MeterFn::Consuming { divisor: Some(divisor), .. }
                    if divisor.is_zero() =>
                {
                    return Err(invalid(id, &metric.name, "zero divisor"));
                }
                MeterFn::Multiply { measures } | MeterFn::Consuming { measures, .. }
                    if measures.is_empty() =>
                {
                    return Err(invalid(id, &metric.name, "no measures to multiply"));
                }
                _ => {}
            }

            let kind = meter.kind();
            if metric.accumulate.kind() != kind {
                return Err(invalid(id, &metric.name, "accumulate does not match meter"));
            }
            if metric.aggregate.kind() != kind {
                return Err(invalid(id, &metric.name, "aggregate does not match meter"));
            }
            if metric.summarize.kind() != kind {
                return Err(invalid(id, &metric.name, "summarize does not match meter"));
            }
            if let SummarizeFn::Continuous { unit_millis } = metric.summarize {
                if unit_millis <= 0 {
                    return Err(invalid(id, &metric.name, "time unit must be positive"));
                }
            }
        }
        Ok(())
    }
}

impl RatingPlan {
    pub fn from_json(json: &str) -> Result<Self, PlanError> {
        let plan: RatingPlan =
            serde_json::from_str(json).map_err(|e| PlanError::Malformed(e.to_string()))?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        for metric in &self.metrics {
            if metric.rate.kind() != metric.charge.kind() {
                return Err(invalid(&self.rating_plan_id, &metric.name, "charge does not match rate"));
            }
            if let ChargeFn::Continuous { unit_millis } = metric.charge {
                if unit_millis <= 0 {
                    return Err(invalid(&self.rating_plan_id, &metric.name, "time unit must be positive"));
                }
            }
        }
        Ok(())
    }

    /// The rating slots of a metric, defaulted to match its kind when
    /// the plan does not mention it.
    pub fn metric(&self, name: &str, kind: MetricKind) -> RatingMetric {
        self.metrics
            .iter()
            .find(|m| m.name == name)
            .cloned()
            .unwrap_or_else(|| match kind {
                MetricKind::Discrete => RatingMetric {
                    name: name.to_string(),
                    rate: RateFn::Price,
                    charge: ChargeFn::Cost,
                },
                MetricKind::Continuous => RatingMetric {
                    name: name.to_string(),
                    rate: RateFn::Continuous,
                    charge: ChargeFn::Continuous {
                        unit_millis: HOUR_MILLIS,
                    },
                },
            })
    }
}

impl PricingPlan {
    pub fn from_json(json: &str) -> Result<Self, PlanError> {
        serde_json::from_str(json).map_err(|e| PlanError::Malformed(e.to_string()))
    }
}

/// Resolves the plan ids carried by usage events.
pub trait PlanProvider: Send + Sync {
    fn load_metering_plan(&self, id: &str) -> Result<Arc<MeteringPlan>, PlanError>;
    fn load_rating_plan(&self, id: &str) -> Result<Arc<RatingPlan>, PlanError>;
    fn load_pricing_plan(&self, id: &str) -> Result<Arc<PricingPlan>, PlanError>;

    /// The country whose prices apply to an organization.
    fn pricing_country(&self, _organization_id: &str) -> String {
        DEFAULT_COUNTRY.to_string()
    }
}

/// Plans loaded once and kept for the lifetime of the process.
#[derive(Default)]
pub struct PlanRegistry {
    metering: RwLock<HashMap<String, Arc<MeteringPlan>>>,
    rating: RwLock<HashMap<String, Arc<RatingPlan>>>,
    pricing: RwLock<HashMap<String, Arc<PricingPlan>>>,
    countries: RwLock<HashMap<String, String>>,
    default_country: String,
}

impl PlanRegistry {
    pub fn new(default_country: &str) -> Self {
        Self {
            default_country: default_country.to_string(),
            ..Default::default()
        }
    }

    pub fn add_metering_plan(&self, plan: MeteringPlan) -> Result<(), PlanError> {
        plan.validate()?;
        event!(Level::INFO, "Loaded metering plan {}", plan.metering_plan_id);
        self.metering
            .write()
            .insert(plan.metering_plan_id.clone(), Arc::new(plan));
        Ok(())
    }

    pub fn add_rating_plan(&self, plan: RatingPlan) -> Result<(), PlanError> {
        plan.validate()?;
        event!(Level::INFO, "Loaded rating plan {}", plan.rating_plan_id);
        self.rating
            .write()
            .insert(plan.rating_plan_id.clone(), Arc::new(plan));
        Ok(())
    }

    pub fn add_pricing_plan(&self, plan: PricingPlan) {
        event!(Level::INFO, "Loaded pricing plan {}", plan.pricing_plan_id);
        self.pricing
            .write()
            .insert(plan.pricing_plan_id.clone(), Arc::new(plan));
    }

    pub fn set_pricing_country(&self, organization_id: &str, country: &str) {
        self.countries
            .write()
            .insert(organization_id.to_string(), country.to_string());
    }
}

impl PlanProvider for PlanRegistry {
    fn load_metering_plan(&self, id: &str) -> Result<Arc<MeteringPlan>, PlanError> {
        self.metering
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| PlanError::UnknownMeteringPlan(id.to_string()))
    }

    fn load_rating_plan(&self, id: &str) -> Result<Arc<RatingPlan>, PlanError> {
        self.rating
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| PlanError::UnknownRatingPlan(id.to_string()))
    }

    fn load_pricing_plan(&self, id: &str) -> Result<Arc<PricingPlan>, PlanError> {
        self.pricing
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| PlanError::UnknownPricingPlan(id.to_string()))
    }

    fn pricing_country(&self, organization_id: &str) -> String {
        self.countries
            .read()
            .get(organization_id)
            .cloned()
            .unwrap_or_else(|| self.default_country.clone())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{
        AccumulateFn, ChargeFn, MeterFn, MeteringPlan, MetricKind, PlanError, PlanProvider,
        PlanRegistry, PricingPlan, RateFn, RatingPlan,
    };
    use rust_decimal::Decimal;

    pub(crate) const OBJECT_METERING: &str = r#"{
        "metering_plan_id": "object-metering",
        "measures": [
            { "name": "storage", "unit": "BYTE" },
            { "name": "light_api_calls", "unit": "CALL" },
            { "name": "heavy_api_calls", "unit": "CALL" }
        ],
        "metrics": [
            {
                "name": "storage",
                "unit": "GIGABYTE",
                "meter": { "divide": { "measure": "storage", "divisor": "1073741824" } },
                "accumulate": "max"
            },
            {
                "name": "thousand_light_api_calls",
                "unit": "THOUSAND_CALLS",
                "meter": { "divide": { "measure": "light_api_calls", "divisor": "1000" } }
            },
            {
                "name": "heavy_api_calls",
                "unit": "CALL"
            }
        ]
    }"#;

    pub(crate) const OBJECT_RATING: &str = r#"{
        "rating_plan_id": "object-rating",
        "metrics": [
            { "name": "storage" },
            { "name": "thousand_light_api_calls" },
            { "name": "heavy_api_calls", "rate": "price", "charge": "cost" }
        ]
    }"#;

    pub(crate) const OBJECT_PRICING: &str = r#"{
        "pricing_plan_id": "object-pricing",
        "metrics": [
            { "name": "storage", "prices": [
                { "country": "USA", "price": "1.00" },
                { "country": "EUR", "price": "0.7523" }
            ] },
            { "name": "thousand_light_api_calls", "prices": [
                { "country": "USA", "price": "0.03" }
            ] },
            { "name": "heavy_api_calls", "prices": [
                { "country": "USA", "price": "0.15" }
            ] }
        ]
    }"#;

    pub(crate) const CONTAINER_METERING: &str = r#"{
        "metering_plan_id": "container-metering",
        "measures": [
            { "name": "instance_memory", "unit": "GIGABYTE" },
            { "name": "running_instances", "unit": "NUMBER" }
        ],
        "metrics": [
            {
                "name": "memory",
                "unit": "GIGABYTE",
                "meter": { "consuming": { "measures": ["instance_memory", "running_instances"] } },
                "accumulate": "continuous",
                "aggregate": "continuous",
                "summarize": { "continuous": {} }
            }
        ]
    }"#;

    pub(crate) const CONTAINER_RATING: &str = r#"{
        "rating_plan_id": "container-rating",
        "metrics": [
            { "name": "memory", "rate": "continuous", "charge": { "continuous": { "unit_millis": 3600000 } } }
        ]
    }"#;

    pub(crate) const CONTAINER_PRICING: &str = r#"{
        "pricing_plan_id": "container-pricing",
        "metrics": [
            { "name": "memory", "prices": [ { "country": "USA", "price": "0.5" } ] }
        ]
    }"#;

    pub(crate) fn registry() -> PlanRegistry {
        let registry = PlanRegistry::new("USA");
        registry
            .add_metering_plan(MeteringPlan::from_json(OBJECT_METERING).unwrap())
            .unwrap();
        registry
            .add_rating_plan(RatingPlan::from_json(OBJECT_RATING).unwrap())
            .unwrap();
        registry.add_pricing_plan(PricingPlan::from_json(OBJECT_PRICING).unwrap());
        registry
            .add_metering_plan(MeteringPlan::from_json(CONTAINER_METERING).unwrap())
            .unwrap();
        registry
            .add_rating_plan(RatingPlan::from_json(CONTAINER_RATING).unwrap())
            .unwrap();
        registry.add_pricing_plan(PricingPlan::from_json(CONTAINER_PRICING).unwrap());
        registry
    }

    #[test]
    fn test_parse_metering_plan() {
        let plan = MeteringPlan::from_json(OBJECT_METERING).unwrap();
        let storage = plan.metric("storage").unwrap();
        assert_eq!(storage.accumulate, AccumulateFn::Max);
        assert_eq!(
            storage.meter_fn(),
            MeterFn::Divide {
                measure: "storage".to_string(),
                divisor: Decimal::from(1073741824),
            }
        );
        let calls = plan.metric("heavy_api_calls").unwrap();
        assert_eq!(calls.accumulate, AccumulateFn::Sum);
        assert_eq!(
            calls.meter_fn(),
            MeterFn::Measure {
                measure: "heavy_api_calls".to_string()
            }
        );
    }

    #[test]
    fn test_undeclared_measure_is_rejected() {
        let mut plan = MeteringPlan::from_json(OBJECT_METERING).unwrap();
        plan.metrics[2].meter = Some(MeterFn::Measure {
            measure: "nope".to_string(),
        });
        assert!(matches!(
            plan.validate(),
            Err(PlanError::InvalidMetric { .. })
        ));
    }

    #[test]
    fn test_mismatched_slots_are_rejected() {
        let json = CONTAINER_METERING.replace(r#""accumulate": "continuous""#, r#""accumulate": "max""#);
        assert!(MeteringPlan::from_json(&json).is_err());

        let json = CONTAINER_RATING.replace(r#""rate": "continuous""#, r#""rate": "price""#);
        assert!(RatingPlan::from_json(&json).is_err());
    }

    #[test]
    fn test_arbitrary_text_is_not_a_formula() {
        let json = OBJECT_METERING.replace(r#""accumulate": "max""#, r#""accumulate": "(a, q) => a + q""#);
        assert!(matches!(
            MeteringPlan::from_json(&json),
            Err(PlanError::Malformed(_))
        ));
    }

    #[test]
    fn test_rating_defaults_follow_kind() {
        let plan = RatingPlan::from_json(OBJECT_RATING).unwrap();
        let unlisted = plan.metric("memory", MetricKind::Continuous);
        assert_eq!(unlisted.rate, RateFn::Continuous);
        assert!(matches!(unlisted.charge, ChargeFn::Continuous { unit_millis: 3600000 }));
        assert_eq!(plan.metric("storage", MetricKind::Discrete).rate, RateFn::Price);
    }

    #[test]
    fn test_country_prices() {
        let plan = PricingPlan::from_json(OBJECT_PRICING).unwrap();
        assert_eq!(plan.price("storage", "EUR"), Decimal::new(7523, 4));
        assert_eq!(plan.price("storage", "JPN"), Decimal::ZERO);
        assert_eq!(plan.price("unknown", "USA"), Decimal::ZERO);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = registry();
        assert!(registry.load_metering_plan("object-metering").is_ok());
        assert_eq!(
            registry.load_rating_plan("missing").unwrap_err(),
            PlanError::UnknownRatingPlan("missing".to_string())
        );
        assert_eq!(registry.pricing_country("org-1"), "USA");
        registry.set_pricing_country("org-1", "EUR");
        assert_eq!(registry.pricing_country("org-1"), "EUR");
    }
}
