//! Rolls accumulated usage up the organization hierarchy.
//!
//! One aggregated document exists per organization and sampling bucket.
//! It holds the same window shape as accumulated documents at every
//! level: organization, space and consumer each keep a tree of
//! `resource -> plan -> metric` windows, and every node carries a window
//! set of charges rolled up from the nodes below it.
//!
//! Aggregation is incremental. For each accumulated lineage the document
//! remembers the window quantities it last took, and folds in only the
//! difference to the lineage's current windows. Raw usage is never
//! rescanned, and a lineage whose earlier folds were missed catches up
//! with its next accumulated document.

use crate::accumulator::AccumulatedDoc;
use crate::rating::{BoundMetric, Cost, PlanBinding, Quantity, RatingError};
use crate::seqid::SequenceId;
use crate::window::{locate, Dimension, Slot, WindowSet};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{event, Level};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregatedCell {
    pub quantity: Quantity,
    pub cost: Option<Cost>,
    pub summary: Decimal,
    pub charge: Decimal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricUsage {
    pub metric: String,
    pub windows: WindowSet<AggregatedCell>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanUsage {
    pub plan_id: String,
    pub metering_plan_id: String,
    pub rating_plan_id: String,
    pub pricing_plan_id: String,
    pub aggregated_usage: Vec<MetricUsage>,
    pub windows: WindowSet<Decimal>,
}

impl PlanUsage {
    fn metric_mut(&mut self, name: &str) -> &mut WindowSet<AggregatedCell> {
        let i = match self.aggregated_usage.iter().position(|m| m.metric == name) {
            Some(i) => i,
            None => {
                self.aggregated_usage.push(MetricUsage {
                    metric: name.to_string(),
                    windows: WindowSet::default(),
                });
                self.aggregated_usage.len() - 1
            }
        };
        &mut self.aggregated_usage[i].windows
    }

    pub fn metric(&self, name: &str) -> Option<&WindowSet<AggregatedCell>> {
        self.aggregated_usage
            .iter()
            .find(|m| m.metric == name)
            .map(|m| &m.windows)
    }

    /// `plan/metering/rating/pricing`.
    pub fn plan_key(&self) -> String {
        [
            self.plan_id.as_str(),
            self.metering_plan_id.as_str(),
            self.rating_plan_id.as_str(),
            self.pricing_plan_id.as_str(),
        ]
        .join("/")
    }

    fn shift(&mut self, from: i64, to: i64) {
        self.windows.shift(from, to);
        for m in self.aggregated_usage.iter_mut() {
            m.windows.shift(from, to);
        }
    }

    fn rollup(&mut self) {
        self.windows = rollup(self.aggregated_usage.iter().map(|m| &m.windows), |c| c.charge);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub plans: BTreeMap<String, PlanUsage>,
    pub windows: WindowSet<Decimal>,
}

impl ResourceUsage {
    fn shift(&mut self, from: i64, to: i64) {
        self.windows.shift(from, to);
        for plan in self.plans.values_mut() {
            plan.shift(from, to);
        }
    }

    fn rollup(&mut self) {
        for plan in self.plans.values_mut() {
            plan.rollup();
        }
        self.windows = rollup(self.plans.values().map(|p| &p.windows), |c| *c);
    }
}

type Resources = BTreeMap<String, ResourceUsage>;

fn shift_resources(resources: &mut Resources, from: i64, to: i64) {
    for resource in resources.values_mut() {
        resource.shift(from, to);
    }
}

fn rollup_resources(resources: &mut Resources) -> WindowSet<Decimal> {
    for resource in resources.values_mut() {
        resource.rollup();
    }
    rollup(resources.values().map(|r| &r.windows), |c| *c)
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumerUsage {
    pub resources: Resources,
    pub windows: WindowSet<Decimal>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SpaceUsage {
    pub resources: Resources,
    pub consumers: BTreeMap<String, ConsumerUsage>,
    pub windows: WindowSet<Decimal>,
}

/// The window quantities of an accumulated lineage as of its last
/// aggregation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppliedUsage {
    pub processed_id: SequenceId,
    /// Anchor of `metrics`.
    pub window_end: i64,
    pub metrics: BTreeMap<String, WindowSet<Quantity>>,
}

impl AppliedUsage {
    /// The quantities rolled forward to a later anchor.
    fn shifted(mut self, anchor: i64) -> BTreeMap<String, WindowSet<Quantity>> {
        if anchor > self.window_end {
            for windows in self.metrics.values_mut() {
                windows.shift(self.window_end, anchor);
            }
        }
        self.metrics
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregatedDoc {
    pub organization_id: String,
    /// Sampled sequence id of the bucket this document covers.
    pub id: String,
    pub window_end: i64,
    pub processed_id: Option<SequenceId>,
    pub resources: Resources,
    pub spaces: BTreeMap<String, SpaceUsage>,
    pub windows: WindowSet<Decimal>,
    /// What was last taken from each accumulated lineage.
    pub applied: BTreeMap<String, AppliedUsage>,
}

impl AggregatedDoc {
    pub fn new(organization_id: &str, id: &str, window_end: i64) -> Self {
        Self {
            organization_id: organization_id.to_string(),
            id: id.to_string(),
            window_end,
            processed_id: None,
            resources: BTreeMap::new(),
            spaces: BTreeMap::new(),
            windows: WindowSet::default(),
            applied: BTreeMap::new(),
        }
    }

    fn resource_maps_mut(&mut self) -> Vec<&mut Resources> {
        let mut maps = vec![&mut self.resources];
        for space in self.spaces.values_mut() {
            maps.push(&mut space.resources);
            for consumer in space.consumers.values_mut() {
                maps.push(&mut consumer.resources);
            }
        }
        maps
    }

    fn shift(&mut self, from: i64, to: i64) {
        self.windows.shift(from, to);
        for resources in self.resource_maps_mut() {
            shift_resources(resources, from, to);
        }
        for space in self.spaces.values_mut() {
            space.windows.shift(from, to);
            for consumer in space.consumers.values_mut() {
                consumer.windows.shift(from, to);
            }
        }
    }

    /// Recomputes the charge windows of every node from its metrics.
    pub fn rollup(&mut self) {
        self.windows = rollup_resources(&mut self.resources);
        for space in self.spaces.values_mut() {
            space.windows = rollup_resources(&mut space.resources);
            for consumer in space.consumers.values_mut() {
                consumer.windows = rollup_resources(&mut consumer.resources);
            }
        }
    }

    /// The plan keys referenced anywhere in the document.
    pub fn plans(&self) -> Vec<&PlanUsage> {
        let mut plans: Vec<&PlanUsage> = Vec::new();
        for resource in self.resources.values() {
            for plan in resource.plans.values() {
                if !plans.iter().any(|p| p.plan_key() == plan.plan_key()) {
                    plans.push(plan);
                }
            }
        }
        plans
    }

    pub fn space(&self, space_id: &str) -> Option<&SpaceUsage> {
        self.spaces.get(space_id)
    }

    pub fn consumer(&self, space_id: &str, consumer_id: &str) -> Option<&ConsumerUsage> {
        self.spaces.get(space_id)?.consumers.get(consumer_id)
    }
}

/// Sums the charges of several window sets, window by window.
fn rollup<'a, T: 'a>(
    sets: impl IntoIterator<Item = &'a WindowSet<T>>,
    charge: impl Fn(&T) -> Decimal,
) -> WindowSet<Decimal> {
    let mut total = WindowSet::default();
    for set in sets {
        for (dimension, slot, cell) in set.cells() {
            let sum = total.pair_mut(dimension).get_mut(slot);
            let value = sum.unwrap_or_default() + charge(cell);
            *sum = Some(value);
        }
    }
    total
}

fn plan_node<'a>(resources: &'a mut Resources, doc: &AccumulatedDoc) -> &'a mut PlanUsage {
    resources
        .entry(doc.resource_id.clone())
        .or_default()
        .plans
        .entry(doc.plan_key())
        .or_insert_with(|| PlanUsage {
            plan_id: doc.plan_id.clone(),
            metering_plan_id: doc.metering_plan_id.clone(),
            rating_plan_id: doc.rating_plan_id.clone(),
            pricing_plan_id: doc.pricing_plan_id.clone(),
            ..Default::default()
        })
}

/// Folds the change of one accumulated window, `before` to `after`,
/// into the matching aggregated window.
fn fold_cell(
    metric: &BoundMetric,
    windows: &mut WindowSet<AggregatedCell>,
    dimension: Dimension,
    slot: Slot,
    anchor: i64,
    before: Option<&Quantity>,
    after: &Quantity,
) -> Result<(), RatingError> {
    let (from, to) = dimension.bounds(anchor, slot.offset());
    let level = windows.pair_mut(dimension).get_mut(slot);
    let quantity = metric.aggregate(level.as_ref().map(|l| &l.quantity), before, after)?;
    let cost = metric.rate(&quantity)?;
    *level = Some(AggregatedCell {
        summary: metric.summarize(anchor, &quantity, from, to)?,
        charge: metric.charge(anchor, Some(&cost), from, to)?,
        quantity,
        cost: Some(cost),
    });
    Ok(())
}

#[derive(Clone, Debug, Default)]
pub struct HierarchicalAggregator;

impl HierarchicalAggregator {
    /// Folds what changed in an accumulated document since its lineage
    /// was last applied into the aggregated document of its organization.
    ///
    /// Returns `None` when the accumulated document, or a later one of
    /// the same lineage, was already applied. That happens on redelivery
    /// and when replaying a superseded document.
    pub fn aggregate(
        &self,
        binding: &PlanBinding,
        existing: Option<AggregatedDoc>,
        accumulated: &AccumulatedDoc,
        id: &str,
    ) -> Result<Option<AggregatedDoc>, RatingError> {
        let mut doc = existing.unwrap_or_else(|| {
            AggregatedDoc::new(&accumulated.organization_id, id, accumulated.window_end)
        });
        let lineage = accumulated.id.clone();
        if let Some(applied) = doc.applied.get(&lineage) {
            if applied.processed_id >= accumulated.processed_id {
                event!(
                    Level::DEBUG,
                    "Ignoring {} at {}, already applied {}",
                    lineage,
                    accumulated.processed_id,
                    applied.processed_id
                );
                return Ok(None);
            }
        }

        let source = accumulated.window_end;
        let mut taken = doc
            .applied
            .remove(&lineage)
            .map(|applied| applied.shifted(source))
            .unwrap_or_default();
        let anchor = doc.window_end.max(source);
        if anchor > doc.window_end {
            let from = doc.window_end;
            doc.shift(from, anchor);
        }

        let space = doc.spaces.entry(accumulated.space_id.clone()).or_default();
        let consumer = space
            .consumers
            .entry(accumulated.consumer_id.clone())
            .or_default();
        let mut nodes = [
            plan_node(&mut doc.resources, accumulated),
            plan_node(&mut space.resources, accumulated),
            plan_node(&mut consumer.resources, accumulated),
        ];

        let mut now_taken = BTreeMap::new();
        for m in &accumulated.accumulated_usage {
            let metric = match binding.metric(&m.metric) {
                Some(metric) => metric,
                None => {
                    event!(Level::WARN, "Metric {} is not in the bound plan", m.metric);
                    continue;
                }
            };
            let before = taken.remove(&m.metric).unwrap_or_default();
            let mut after = WindowSet::default();
            for (dimension, slot, cell) in m.windows.cells() {
                *after.pair_mut(dimension).get_mut(slot) = Some(cell.quantity);
                let last = before.pair(dimension).get(slot);
                if last == Some(&cell.quantity) {
                    continue;
                }
                // Accumulated windows are anchored on their own document.
                let (from, _) = dimension.bounds(source, slot.offset());
                let target = match locate(dimension, anchor, from) {
                    Some(target) => target,
                    None => continue,
                };
                for node in nodes.iter_mut() {
                    fold_cell(metric, node.metric_mut(&m.metric), dimension, target, anchor, last, &cell.quantity)?;
                }
            }
            now_taken.insert(m.metric.clone(), after);
        }

        doc.rollup();
        doc.applied.insert(
            lineage,
            AppliedUsage {
                processed_id: accumulated.processed_id,
                window_end: source,
                metrics: now_taken,
            },
        );
        doc.processed_id = doc.processed_id.max(Some(accumulated.processed_id));
        doc.window_end = anchor;
        doc.id = id.to_string();
        Ok(Some(doc))
    }

    /// Recomputes summaries and charges as of `now`, then rolls them up.
    /// Plans without a binding keep their stored values.
    pub fn charge_at(
        &self,
        bindings: &HashMap<String, PlanBinding>,
        doc: &mut AggregatedDoc,
        now: i64,
    ) -> Result<(), RatingError> {
        let anchor = doc.window_end;
        for resources in doc.resource_maps_mut() {
            for plan in resources.values_mut().flat_map(|r| r.plans.values_mut()) {
                let binding = match bindings.get(&plan.plan_key()) {
                    Some(binding) => binding,
                    None => continue,
                };
                for m in plan.aggregated_usage.iter_mut() {
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
            }
        }
        doc.rollup();
        Ok(())
    }
}
