//! This module folds metered usage of one resource instance into its
//! accumulated document.
//!
//! An accumulated document keeps, for every metric of the instance's
//! metering plan, the full window set: one `[current, previous]` pair per
//! dimension. Windows are anchored on the latest event end seen so far,
//! so rollover follows event time and late usage still lands in the
//! previous window when it belongs there.

use crate::key::OutputKey;
use crate::rating::{Cost, PlanBinding, Quantity, RatingError};
use crate::seqid::SequenceId;
use crate::usage::{Measure, UsageEvent};
use crate::window::{locate, Slot, WindowSet, DIMENSIONS};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{event, Level};

/// One accumulated window of one metric.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub quantity: Quantity,
    /// The quantity before the last fold into this window.
    pub previous: Option<Quantity>,
    pub cost: Option<Cost>,
    pub summary: Decimal,
    pub charge: Decimal,
    /// The event that last changed this window.
    pub processed_id: SequenceId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricWindows {
    pub metric: String,
    pub windows: WindowSet<Cell>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeteredQuantity {
    pub metric: String,
    pub quantity: Quantity,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccumulatedDoc {
    pub id: String,
    pub organization_id: String,
    pub space_id: String,
    pub consumer_id: String,
    pub resource_id: String,
    pub plan_id: String,
    pub resource_instance_id: String,
    pub metering_plan_id: String,
    pub rating_plan_id: String,
    pub pricing_plan_id: String,
    /// Time range of the last accumulated event.
    pub start: i64,
    pub end: i64,
    /// Anchor of every window set in the document.
    pub window_end: i64,
    pub processed_id: SequenceId,
    pub accumulated_usage: Vec<MetricWindows>,
    pub measured_usage: Vec<Measure>,
    pub metered_usage: Vec<MeteredQuantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collected_usage_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_usage_id: Option<String>,
    pub metered_usage_id: String,
}

impl AccumulatedDoc {
    fn new(key: &OutputKey, usage: &UsageEvent, seq: SequenceId) -> Self {
        Self {
            id: key.to_string(),
            organization_id: usage.organization_id.clone(),
            space_id: usage.space_id.clone(),
            consumer_id: usage.consumer().to_string(),
            resource_id: usage.resource_id.clone(),
            plan_id: usage.plan_id.clone(),
            resource_instance_id: usage.resource_instance_id.clone(),
            metering_plan_id: usage.metering_plan_id.clone(),
            rating_plan_id: usage.rating_plan_id.clone(),
            pricing_plan_id: usage.pricing_plan_id.clone(),
            start: usage.start,
            end: usage.end,
            window_end: usage.end,
            processed_id: seq,
            accumulated_usage: Vec::new(),
            measured_usage: Vec::new(),
            metered_usage: Vec::new(),
            collected_usage_id: None,
            normalized_usage_id: None,
            metered_usage_id: seq.to_string(),
        }
    }

    /// `plan/metering/rating/pricing`, as used by aggregated documents.
    pub fn plan_key(&self) -> String {
        [
            self.plan_id.as_str(),
            self.metering_plan_id.as_str(),
            self.rating_plan_id.as_str(),
            self.pricing_plan_id.as_str(),
        ]
        .join("/")
    }

    pub fn metric(&self, name: &str) -> Option<&WindowSet<Cell>> {
        self.accumulated_usage
            .iter()
            .find(|m| m.metric == name)
            .map(|m| &m.windows)
    }

    fn metric_mut(&mut self, name: &str) -> &mut WindowSet<Cell> {
        let i = match self.accumulated_usage.iter().position(|m| m.metric == name) {
            Some(i) => i,
            None => {
                self.accumulated_usage.push(MetricWindows {
                    metric: name.to_string(),
                    windows: WindowSet::default(),
                });
                self.accumulated_usage.len() - 1
            }
        };
        &mut self.accumulated_usage[i].windows
    }
}

#[derive(Clone, Debug, Default)]
pub struct WindowedAccumulator;

impl WindowedAccumulator {
    /// Folds one event into the accumulated document of its lineage,
    /// creating the document on first use.
    ///
    /// Windows the event cannot contribute to are left untouched. Costs,
    /// summaries and charges are computed as of the document's anchor so
    /// the result only depends on the events folded in.
    pub fn accumulate(
        &self,
        binding: &PlanBinding,
        existing: Option<AccumulatedDoc>,
        key: &OutputKey,
        usage: &UsageEvent,
        seq: SequenceId,
    ) -> Result<AccumulatedDoc, RatingError> {
        let mut doc = existing.unwrap_or_else(|| AccumulatedDoc::new(key, usage, seq));
        let anchor = doc.window_end.max(usage.end);
        if anchor > doc.window_end {
            event!(
                Level::DEBUG,
                "Shifting windows of {} from {} to {}",
                doc.id,
                doc.window_end,
                anchor
            );
            for m in doc.accumulated_usage.iter_mut() {
                m.windows.shift(doc.window_end, anchor);
            }
        }

        let mut metered = Vec::new();
        for metric in &binding.metrics {
            let quantity = match metric.meter(usage) {
                Some(q) => q,
                None => {
                    event!(
                        Level::DEBUG,
                        "Event for {} does not report metric {}",
                        doc.id,
                        metric.name
                    );
                    continue;
                }
            };
            metered.push(MeteredQuantity {
                metric: metric.name.clone(),
                quantity,
            });

            let windows = doc.metric_mut(&metric.name);
            for dimension in DIMENSIONS {
                // Usage older than the previous window is checked against
                // the current one and rejected by the boundary check.
                let slot = locate(dimension, anchor, usage.end).unwrap_or(Slot::Current);
                let (from, to) = dimension.bounds(anchor, slot.offset());
                let cell = windows.pair_mut(dimension).get_mut(slot);
                let before = cell.as_ref().map(|c| c.quantity);
                let folded =
                    match metric.accumulate(before.as_ref(), &quantity, usage.start, usage.end, from, to)? {
                        Some(q) => q,
                        None => {
                            event!(
                                Level::DEBUG,
                                "Usage ending at {} is outside {:?} window [{}, {})",
                                usage.end,
                                dimension,
                                from,
                                to
                            );
                            continue;
                        }
                    };
                let cost = metric.rate(&folded)?;
                *cell = Some(Cell {
                    summary: metric.summarize(anchor, &folded, from, to)?,
                    charge: metric.charge(anchor, Some(&cost), from, to)?,
                    quantity: folded,
                    previous: before,
                    cost: Some(cost),
                    processed_id: seq,
                });
            }
        }

        doc.start = usage.start;
        doc.end = usage.end;
        doc.window_end = anchor;
        doc.processed_id = seq;
        doc.measured_usage = usage.measured_usage.clone();
        doc.metered_usage = metered;
        doc.collected_usage_id = usage.collected_usage_id.clone();
        doc.normalized_usage_id = usage.normalized_usage_id.clone();
        doc.metered_usage_id = seq.to_string();
        Ok(doc)
    }

    /// Recomputes summaries and charges of every window as of `now`.
    pub fn charge_at(&self, binding: &PlanBinding, doc: &mut AccumulatedDoc, now: i64) -> Result<(), RatingError> {
        let anchor = doc.window_end;
        for m in doc.accumulated_usage.iter_mut() {
            let metric = match binding.metric(&m.metric) {
                Some(metric) => metric,
                None => continue,
            };
            for (dimension, slot, cell) in m.windows.cells_mut() {
                let (from, to) = dimension.bounds(anchor, slot.offset());
                cell.summary = metric.summarize(now, &cell.quantity, from, to)?;
                cell.charge = metric.charge(now, cell.cost.as_ref(), from, to)?;
            }
        }
        Ok(())
    }
}
