//! Evaluates the per metric pipeline
//! `meter -> accumulate -> aggregate -> rate -> charge`.
//!
//! The formulas themselves live in the plans; this module binds them to
//! a usage lineage and does the arithmetic. All quantity and money math
//! is done with `Decimal`.

use crate::plan::{
    AccumulateFn, AggregateFn, ChargeFn, MeterFn, MeteringPlan, MetricKind, PlanError, PricingPlan,
    RateFn, RatingPlan, SummarizeFn,
};
use crate::usage::UsageEvent;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Consumption over time: `consuming` units per millisecond since
/// `since`, on top of `consumed` unit-milliseconds already burned.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Burn {
    pub consuming: Decimal,
    pub consumed: Decimal,
    pub since: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Quantity {
    Discrete(Decimal),
    Continuous(Burn),
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cost {
    Money(Decimal),
    Burn {
        price: Decimal,
        consuming: Decimal,
        consumed: Decimal,
        since: i64,
    },
}

#[derive(Error, Debug, PartialEq)]
pub enum RatingError {
    #[error("metric {metric}: expected a {expected:?} value")]
    ShapeMismatch { metric: String, expected: MetricKind },
}

/// Milliseconds of `[since, min(now, to))` that fall inside a window of
/// width `to - from`.
fn elapsed(now: i64, since: i64, from: i64, to: i64) -> Decimal {
    let width = to.saturating_sub(from).max(0);
    let span = now.min(to).saturating_sub(since).clamp(0, width);
    Decimal::from(span)
}

/// All the slots of one metric, bound to a plan triple and a country.
#[derive(Clone, Debug, PartialEq)]
pub struct BoundMetric {
    pub name: String,
    pub unit: String,
    pub kind: MetricKind,
    pub meter: MeterFn,
    pub accumulate: AccumulateFn,
    pub aggregate: AggregateFn,
    pub summarize: SummarizeFn,
    pub rate: RateFn,
    pub charge: ChargeFn,
    pub price: Decimal,
}

impl BoundMetric {
    fn mismatch(&self) -> RatingError {
        RatingError::ShapeMismatch {
            metric: self.name.clone(),
            expected: self.kind,
        }
    }

    fn discrete(&self, q: Option<&Quantity>) -> Result<Option<Decimal>, RatingError> {
        match q {
            None => Ok(None),
            Some(Quantity::Discrete(d)) => Ok(Some(*d)),
            Some(_) => Err(self.mismatch()),
        }
    }

    fn continuous(&self, q: Option<&Quantity>) -> Result<Option<Burn>, RatingError> {
        match q {
            None => Ok(None),
            Some(Quantity::Continuous(b)) => Ok(Some(*b)),
            Some(_) => Err(self.mismatch()),
        }
    }

    /// Converts the raw measures of an event into the metric quantity.
    /// `None` when the event does not report what the metric needs.
    pub fn meter(&self, event: &UsageEvent) -> Option<Quantity> {
        let product = |measures: &[String]| {
            measures
                .iter()
                .map(|m| event.measure(m))
                .try_fold(Decimal::ONE, |acc, q| q.map(|q| acc * q))
        };
        match &self.meter {
            MeterFn::Measure { measure } => event.measure(measure).map(Quantity::Discrete),
            MeterFn::Divide { measure, divisor } => event
                .measure(measure)
                .and_then(|q| q.checked_div(*divisor))
                .map(Quantity::Discrete),
            MeterFn::Multiply { measures } => product(measures).map(Quantity::Discrete),
            MeterFn::Consuming { measures, divisor } => {
                let consuming = match divisor {
                    Some(d) => product(measures)?.checked_div(*d)?,
                    None => product(measures)?,
                };
                Some(Quantity::Continuous(Burn {
                    consuming,
                    consumed: Decimal::ZERO,
                    since: event.start,
                }))
            }
        }
    }

    /// Folds a metered quantity into a window cell. Returns `None` when
    /// the usage does not end inside `[from, to)`, in which case the
    /// cell must be left untouched.
    #[allow(clippy::too_many_arguments)]
    pub fn accumulate(
        &self,
        accumulated: Option<&Quantity>,
        quantity: &Quantity,
        _start: i64,
        end: i64,
        from: i64,
        to: i64,
    ) -> Result<Option<Quantity>, RatingError> {
        if end < from || end >= to {
            return Ok(None);
        }
        let folded = match self.accumulate {
            AccumulateFn::Sum | AccumulateFn::Max => {
                let q = self.discrete(Some(quantity))?.unwrap_or_default();
                let a = self.discrete(accumulated)?;
                Quantity::Discrete(match (self.accumulate, a) {
                    (_, None) => q,
                    (AccumulateFn::Max, Some(a)) => a.max(q),
                    (_, Some(a)) => a + q,
                })
            }
            AccumulateFn::Continuous => {
                let q = self.continuous(Some(quantity))?.ok_or_else(|| self.mismatch())?;
                let consumed = match self.continuous(accumulated)? {
                    Some(a) => a.consuming * Decimal::from(q.since - a.since) + a.consumed,
                    None => Decimal::ZERO,
                };
                Quantity::Continuous(Burn {
                    consumed,
                    consuming: q.consuming,
                    since: q.since,
                })
            }
        };
        Ok(Some(folded))
    }

    /// Folds the change of an accumulated cell, `prev` to `curr`, into
    /// a parent level value.
    pub fn aggregate(
        &self,
        level: Option<&Quantity>,
        prev: Option<&Quantity>,
        curr: &Quantity,
    ) -> Result<Quantity, RatingError> {
        match self.aggregate {
            AggregateFn::Sum => {
                let a = self.discrete(level)?.unwrap_or_default();
                let p = self.discrete(prev)?.unwrap_or_default();
                let c = self.discrete(Some(curr))?.unwrap_or_default();
                Ok(Quantity::Discrete(a + c - p))
            }
            AggregateFn::Continuous => {
                let c = self.continuous(Some(curr))?.ok_or_else(|| self.mismatch())?;
                let delta = c.consuming - self.continuous(prev)?.map_or(Decimal::ZERO, |p| p.consuming);
                Ok(Quantity::Continuous(match self.continuous(level)? {
                    Some(a) => Burn {
                        consumed: delta * Decimal::from((a.since - c.since).max(0))
                            + a.consuming * Decimal::from((c.since - a.since).max(0))
                            + a.consumed,
                        consuming: delta + a.consuming,
                        since: a.since.max(c.since),
                    },
                    None => Burn {
                        consumed: Decimal::ZERO,
                        consuming: delta,
                        since: c.since,
                    },
                }))
            }
        }
    }

    /// The metric's natural summary of a quantity at time `now`.
    pub fn summarize(&self, now: i64, quantity: &Quantity, from: i64, to: i64) -> Result<Decimal, RatingError> {
        match self.summarize {
            SummarizeFn::Quantity => Ok(self.discrete(Some(quantity))?.unwrap_or_default()),
            SummarizeFn::Continuous { unit_millis } => {
                let b = self.continuous(Some(quantity))?.ok_or_else(|| self.mismatch())?;
                Ok((b.consuming * elapsed(now, b.since, from, to) + b.consumed) / Decimal::from(unit_millis))
            }
        }
    }

    pub fn rate(&self, quantity: &Quantity) -> Result<Cost, RatingError> {
        match self.rate {
            RateFn::Price => {
                let q = self.discrete(Some(quantity))?.unwrap_or_default();
                Ok(Cost::Money(self.price * q))
            }
            RateFn::Continuous => {
                let b = self.continuous(Some(quantity))?.ok_or_else(|| self.mismatch())?;
                Ok(Cost::Burn {
                    price: self.price,
                    consuming: b.consuming,
                    consumed: b.consumed,
                    since: b.since,
                })
            }
        }
    }

    /// The chargeable amount of a window at time `now`.
    pub fn charge(&self, now: i64, cost: Option<&Cost>, from: i64, to: i64) -> Result<Decimal, RatingError> {
        match (self.charge, cost) {
            (_, None) => Ok(Decimal::ZERO),
            (ChargeFn::Cost, Some(Cost::Money(m))) => Ok(*m),
            (
                ChargeFn::Continuous { unit_millis },
                Some(Cost::Burn {
                    price,
                    consuming,
                    consumed,
                    since,
                }),
            ) => {
                let burned = *consuming * elapsed(now, *since, from, to) + *consumed;
                Ok(burned / Decimal::from(unit_millis) * *price)
            }
            _ => Err(self.mismatch()),
        }
    }
}

/// The metrics of a (metering, rating, pricing) plan triple, priced for
/// one country.
#[derive(Clone, Debug, PartialEq)]
pub struct PlanBinding {
    pub metering_plan_id: String,
    pub rating_plan_id: String,
    pub pricing_plan_id: String,
    pub country: String,
    pub metrics: Vec<BoundMetric>,
}

impl PlanBinding {
    pub fn metric(&self, name: &str) -> Option<&BoundMetric> {
        self.metrics.iter().find(|m| m.name == name)
    }
}

#[derive(Clone, Debug, Default)]
pub struct RatingEngine;

impl RatingEngine {
    /// Binds every metric of a metering plan to its rating slots and
    /// price. Fails when a rating slot does not fit the metric kind.
    pub fn bind(
        &self,
        metering: &MeteringPlan,
        rating: &RatingPlan,
        pricing: &PricingPlan,
        country: &str,
    ) -> Result<PlanBinding, PlanError> {
        let metrics = metering
            .metrics
            .iter()
            .map(|m| {
                let meter = m.meter_fn();
                let kind = meter.kind();
                let r = rating.metric(&m.name, kind);
                if r.rate.kind() != kind || r.charge.kind() != kind {
                    return Err(PlanError::InvalidMetric {
                        plan: rating.rating_plan_id.clone(),
                        metric: m.name.clone(),
                        reason: format!("rating slots do not fit a {:?} metric", kind),
                    });
                }
                Ok(BoundMetric {
                    name: m.name.clone(),
                    unit: m.unit.clone(),
                    kind,
                    meter,
                    accumulate: m.accumulate,
                    aggregate: m.aggregate,
                    summarize: m.summarize,
                    rate: r.rate,
                    charge: r.charge,
                    price: pricing.price(&m.name, country),
                })
            })
            .collect::<Result<Vec<_>, PlanError>>()?;
        Ok(PlanBinding {
            metering_plan_id: metering.metering_plan_id.clone(),
            rating_plan_id: rating.rating_plan_id.clone(),
            pricing_plan_id: pricing.pricing_plan_id.clone(),
            country: country.to_string(),
            metrics,
        })
    }
}
