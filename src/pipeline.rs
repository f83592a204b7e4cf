use crate::accumulator::{AccumulatedDoc, WindowedAccumulator};
use crate::aggregator::{AggregatedDoc, HierarchicalAggregator};
use crate::config::EngineConfig;
use crate::dedup::DedupFilter;
use crate::error::UsageError;
use crate::health::HealthMonitor;
use crate::key::{build_key, dedup_value, OutputKey};
use crate::lock::KeyLocker;
use crate::partition::{Operation, PartitionRef, Partitioner};
use crate::plan::{PlanError, PlanProvider};
use crate::producer::{publish, Producer};
use crate::rating::{PlanBinding, RatingEngine};
use crate::reducer::{ReducerConfig, ReducerKind};
use crate::retry::RetryPolicy;
use crate::seqid::{pad16, SequenceId, SequenceIdGenerator, SequenceState};
use crate::store::{get_doc, put_doc, DocumentStore, StoreError};
use crate::usage::UsageEvent;
use crate::window::Dimension;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{event, Level};

pub const ACCUMULATED_DB: &str = "accumulated";
pub const AGGREGATED_DB: &str = "aggregated";
pub const ERRORS_DB: &str = "errors";

#[derive(Clone, Debug, PartialEq)]
pub enum SubmitOutcome {
    Accepted,
    /// Already accumulated, nothing changed.
    Duplicate,
    Rejected(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStage {
    Accumulate,
    Aggregate,
}

impl ErrorStage {
    fn as_str(&self) -> &'static str {
        match self {
            ErrorStage::Accumulate => "accumulate",
            ErrorStage::Aggregate => "aggregate",
        }
    }
}

/// Usage that could not be fully processed, kept in the errors database.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: String,
    pub stage: ErrorStage,
    pub reason: String,
    pub usage: UsageEvent,
    /// The accumulated document whose aggregation failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accumulated: Option<AccumulatedDoc>,
    #[serde(default)]
    pub replayed: bool,
}

fn accumulated_id(okey: &str) -> String {
    format!("k/{}", okey)
}

fn corrupt(key: &str, e: serde_json::Error) -> UsageError {
    StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    }
    .into()
}

/// The month after, the month of, and the month before a time. Documents
/// are looked up in that order so they carry over month boundaries.
fn neighbour_months(time: i64) -> [i64; 3] {
    [
        Dimension::Month.bounds(time, 1).0,
        time,
        Dimension::Month.bounds(time, 0).0 - 1,
    ]
}

/// This is the entry point for the library.
///
/// A `UsagePipeline` takes usage events through deduplication,
/// accumulation per resource instance and aggregation per organization,
/// persisting every document in a `DocumentStore` and publishing it to
/// a `Producer` when one is attached.
///
/// Events for the same lineage are serialized with a per key lock. The
/// pipeline is meant to be shared by every worker of a process.
pub struct UsagePipeline {
    config: EngineConfig,
    plans: Arc<dyn PlanProvider>,
    store: Arc<dyn DocumentStore>,
    producer: Option<Arc<dyn Producer>>,
    rating: RatingEngine,
    accumulator: WindowedAccumulator,
    aggregator: HierarchicalAggregator,
    accumulate_reducer: ReducerConfig,
    aggregate_reducer: ReducerConfig,
    partitioner: Partitioner,
    errors: Partitioner,
    dedup: DedupFilter,
    locks: KeyLocker,
    sequence: SequenceIdGenerator,
    health: HealthMonitor,
    retry: RetryPolicy,
}

impl UsagePipeline {
    pub fn new(config: EngineConfig, plans: Arc<dyn PlanProvider>, store: Arc<dyn DocumentStore>) -> Self {
        UsagePipeline {
            plans,
            store,
            producer: None,
            rating: RatingEngine,
            accumulator: WindowedAccumulator,
            aggregator: HierarchicalAggregator,
            accumulate_reducer: ReducerConfig::new(ReducerKind::Accumulator, config.secured),
            aggregate_reducer: ReducerConfig::new(ReducerKind::Aggregator, config.secured),
            partitioner: Partitioner::new(config.partitions),
            errors: Partitioner::singleton(),
            dedup: DedupFilter::new(config.dedup_capacity, config.dedup_max_age_secs.saturating_mul(1000)),
            locks: KeyLocker::new(),
            sequence: SequenceIdGenerator::new(
                config.app_index,
                config.cluster_index,
                0,
                SequenceState::new(),
            ),
            health: HealthMonitor::new(config.health_threshold_millis),
            retry: config.retry_policy(),
            config,
        }
    }

    /// Publishes every accumulated and aggregated document.
    pub fn with_producer(mut self, producer: Arc<dyn Producer>) -> Self {
        self.producer = Some(producer);
        self
    }

    pub fn with_partitioner(mut self, partitioner: Partitioner) -> Self {
        self.partitioner = partitioner;
        self
    }

    pub fn with_sequence(mut self, sequence: SequenceIdGenerator) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    /// The dedup filter, e.g. to persist it across restarts.
    pub fn dedup(&self) -> &DedupFilter {
        &self.dedup
    }

    pub fn reducer(&self, kind: ReducerKind) -> &ReducerConfig {
        match kind {
            ReducerKind::Accumulator => &self.accumulate_reducer,
            ReducerKind::Aggregator => &self.aggregate_reducer,
        }
    }

    fn bind(
        &self,
        organization_id: &str,
        metering_plan_id: &str,
        rating_plan_id: &str,
        pricing_plan_id: &str,
    ) -> Result<PlanBinding, PlanError> {
        let metering = self.plans.load_metering_plan(metering_plan_id)?;
        let rating = self.plans.load_rating_plan(rating_plan_id)?;
        let pricing = self.plans.load_pricing_plan(pricing_plan_id)?;
        let country = self.plans.pricing_country(organization_id);
        self.rating.bind(&metering, &rating, &pricing, &country)
    }

    fn emit<T: Serialize>(&self, topic: &str, doc: &T) {
        if let Some(producer) = &self.producer {
            if let Err(e) = publish(producer.as_ref(), topic, doc) {
                event!(Level::ERROR, "Failed to publish to {}: {}", topic, e);
            }
        }
    }

    /// Processes one usage event.
    ///
    /// Invalid events and events whose plans cannot be resolved are
    /// rejected. Events already accumulated are reported as duplicates.
    /// Transient store failures are retried, then returned so the queue
    /// can redeliver the event later.
    pub fn submit(&self, usage: &UsageEvent) -> Result<SubmitOutcome, UsageError> {
        if let Err(reason) = usage.validate() {
            event!(
                Level::WARN,
                "Rejecting usage of {}: {}",
                usage.resource_instance_id,
                reason
            );
            return Ok(SubmitOutcome::Rejected(reason));
        }

        let key = build_key(usage);
        let okey = self
            .accumulate_reducer
            .output_keys(usage)
            .into_iter()
            .next()
            .unwrap_or_else(|| key.to_string());
        let dedup = dedup_value(&key, usage);
        if self.dedup.has(&dedup) {
            event!(Level::DEBUG, "Duplicate usage {}", dedup);
            return Ok(SubmitOutcome::Duplicate);
        }

        let binding = match self.bind(
            &usage.organization_id,
            &usage.metering_plan_id,
            &usage.rating_plan_id,
            &usage.pricing_plan_id,
        ) {
            Ok(binding) => binding,
            Err(e) => return self.reject(usage, &okey, e.into()),
        };

        match self.accumulate(usage, &okey, &dedup, &binding) {
            Ok(outcome) => {
                self.health.record_success();
                Ok(outcome)
            }
            Err(e) if e.is_configuration() => self.reject(usage, &okey, e),
            Err(e) => {
                if e.is_transient() {
                    self.health.record_failure();
                }
                event!(Level::ERROR, "Failed to accumulate usage {}: {}", okey, e);
                Err(e)
            }
        }
    }

    fn reject(&self, usage: &UsageEvent, okey: &str, error: UsageError) -> Result<SubmitOutcome, UsageError> {
        event!(Level::ERROR, "Cannot process usage {}: {}", okey, error);
        self.record_error(ErrorStage::Accumulate, usage, okey, None, &error)?;
        Ok(SubmitOutcome::Rejected(error.to_string()))
    }

    fn record_error(
        &self,
        stage: ErrorStage,
        usage: &UsageEvent,
        okey: &str,
        accumulated: Option<&AccumulatedDoc>,
        error: &UsageError,
    ) -> Result<(), UsageError> {
        let seq = self.sequence.next();
        let id = format!("k/{}/{}/t/{}", stage.as_str(), okey, seq);
        let record = ErrorRecord {
            id: id.clone(),
            stage,
            reason: error.to_string(),
            usage: usage.clone(),
            accumulated: accumulated.cloned(),
            replayed: false,
        };
        let partition = self.errors.route(ERRORS_DB, seq.time, Operation::Write)?;
        self.retry.run("record usage error", || {
            Ok(put_doc(self.store.as_ref(), ERRORS_DB, partition, &id, &record)?)
        })?;
        event!(Level::INFO, "Recorded {} error {}", stage.as_str(), id);
        self.emit(&self.config.error_topic, &record);
        Ok(())
    }

    fn accumulate(
        &self,
        usage: &UsageEvent,
        okey: &str,
        dedup: &str,
        binding: &PlanBinding,
    ) -> Result<SubmitOutcome, UsageError> {
        let _guard = self.locks.lock(okey);
        if self.dedup.has(dedup) {
            event!(Level::DEBUG, "Duplicate usage {}", dedup);
            return Ok(SubmitOutcome::Duplicate);
        }

        let seq = self.sequence.next();
        let times = neighbour_months(usage.end);
        let existing = self
            .retry
            .run("read accumulated usage", || self.find_accumulated(okey, &times))?;
        let key = build_key(usage);
        let doc = self
            .accumulator
            .accumulate(binding, existing, &key, usage, seq)?;
        self.retry
            .run("write accumulated usage", || self.write_accumulated(okey, &doc))?;
        self.dedup.add(dedup);
        event!(Level::DEBUG, "Accumulated usage {} at {}", okey, seq);
        self.emit(&self.config.accumulated_topic, &doc);

        if let Err(e) = self.aggregate(usage, &doc, binding) {
            event!(Level::ERROR, "Failed to aggregate usage {}: {}", okey, e);
            self.record_error(ErrorStage::Aggregate, usage, okey, Some(&doc), &e)?;
        }
        Ok(SubmitOutcome::Accepted)
    }

    /// The newest document of a lineage among the partitions of `times`.
    fn find_accumulated(&self, okey: &str, times: &[i64]) -> Result<Option<AccumulatedDoc>, UsageError> {
        let id = accumulated_id(okey);
        let mut visited: Vec<PartitionRef> = Vec::new();
        let mut found: Option<AccumulatedDoc> = None;
        for time in times {
            let partition = self.partitioner.route(okey, *time, Operation::Read)?;
            if visited.contains(&partition) {
                continue;
            }
            visited.push(partition);
            let doc: Option<AccumulatedDoc> = get_doc(self.store.as_ref(), ACCUMULATED_DB, partition, &id)?;
            if let Some(doc) = doc {
                if found.as_ref().map_or(true, |f| doc.processed_id > f.processed_id) {
                    found = Some(doc);
                }
            }
        }
        Ok(found)
    }

    /// Writes a document unless the stored one comes from a later event.
    fn write_accumulated(&self, okey: &str, doc: &AccumulatedDoc) -> Result<(), UsageError> {
        let partition = self.partitioner.route(okey, doc.window_end, Operation::Write)?;
        let id = accumulated_id(okey);
        let stored: Option<AccumulatedDoc> = get_doc(self.store.as_ref(), ACCUMULATED_DB, partition, &id)?;
        if let Some(stored) = stored {
            if stored.processed_id >= doc.processed_id {
                return Err(StoreError::Conflict {
                    key: id,
                    stored: stored.processed_id.to_string(),
                    attempted: doc.processed_id.to_string(),
                }
                .into());
            }
        }
        put_doc(self.store.as_ref(), ACCUMULATED_DB, partition, &id, doc)?;
        Ok(())
    }

    /// The latest aggregated document of an organization at or before
    /// the bucket of `time`, looking back one month at most.
    fn latest_aggregated(&self, organization_id: &str, time: i64) -> Result<Option<AggregatedDoc>, UsageError> {
        let bucket = time.div_euclid(self.config.sampling_millis.max(1)) * self.config.sampling_millis.max(1);
        let prefix = format!("k/{}/t/", organization_id);
        let upper = format!("{}{}~", prefix, pad16(bucket));
        let from = Dimension::Month.bounds(bucket, -1).0;
        for partition in self
            .partitioner
            .route_range(organization_id, bucket, from, Operation::Read)?
        {
            let docs = self.store.range(AGGREGATED_DB, partition, &prefix)?;
            // Space and consumer documents of a space named `t` share the
            // prefix; organization documents have no further segment.
            let latest = docs
                .into_iter()
                .filter(|(k, _)| *k <= upper)
                .filter(|(k, _)| k.strip_prefix(&prefix).map_or(false, |rest| !rest.contains('/')))
                .last();
            if let Some((key, value)) = latest {
                return serde_json::from_value(value)
                    .map(Some)
                    .map_err(|e| corrupt(&key, e));
            }
        }
        Ok(None)
    }

    /// Refuses to replace an organization document that changed since
    /// the one the new fold started from was read.
    fn check_aggregated(
        &self,
        partition: PartitionRef,
        id: &str,
        base: Option<SequenceId>,
        attempted: Option<SequenceId>,
    ) -> Result<(), UsageError> {
        let stored: Option<AggregatedDoc> = get_doc(self.store.as_ref(), AGGREGATED_DB, partition, id)?;
        if let Some(stored) = stored {
            if stored.processed_id > base {
                let render = |seq: Option<SequenceId>| seq.map(|s| s.to_string()).unwrap_or_default();
                return Err(StoreError::Conflict {
                    key: id.to_string(),
                    stored: render(stored.processed_id),
                    attempted: render(attempted),
                }
                .into());
            }
        }
        Ok(())
    }

    fn aggregate(&self, usage: &UsageEvent, accumulated: &AccumulatedDoc, binding: &PlanBinding) -> Result<(), UsageError> {
        let seq = accumulated.processed_id;
        let keys = self.aggregate_reducer.output_keys(usage);
        let times = self
            .aggregate_reducer
            .output_times(&seq, self.config.sampling_millis);
        let bucket = times.first().cloned().unwrap_or_else(|| seq.to_string());
        let _guard = self.locks.lock(&format!("aggregated:{}", usage.organization_id));

        let existing = self.retry.run("read aggregated usage", || {
            self.latest_aggregated(&usage.organization_id, seq.time)
        })?;
        let base = existing.as_ref().and_then(|doc| doc.processed_id);
        let doc = match self.aggregator.aggregate(binding, existing, accumulated, &bucket)? {
            Some(doc) => doc,
            None => return Ok(()),
        };

        let docs = [
            serde_json::to_value(&doc),
            serde_json::to_value(doc.consumer(&usage.space_id, usage.consumer())),
            serde_json::to_value(doc.space(&usage.space_id)),
            Ok(json!({
                "id": accumulated.id,
                "organization_id": usage.organization_id,
                "processed_id": seq.to_string(),
                "aggregated_id": bucket,
            })),
        ];
        let mut writes = Vec::new();
        for ((key, time), value) in keys.iter().zip(times.iter()).zip(docs) {
            let id = format!("k/{}/t/{}", key, time);
            let value = value.map_err(|e| corrupt(&id, e))?;
            let partition = self.partitioner.route(key, seq.time, Operation::Write)?;
            writes.push((partition, id, value));
        }
        // The organization document records the applied lineages, so it
        // is checked first and written last. A failure before it leaves
        // the lineage unapplied and a replay writes everything again.
        if !writes.is_empty() {
            writes.rotate_left(1);
        }
        if let Some((partition, id, _)) = writes.last() {
            self.retry.run("check aggregated usage", || {
                self.check_aggregated(*partition, id, base, doc.processed_id)
            })?;
        }
        for (partition, id, value) in &writes {
            self.retry.run("write aggregated usage", || {
                Ok(self.store.put(AGGREGATED_DB, *partition, id, value.clone())?)
            })?;
        }
        event!(
            Level::DEBUG,
            "Aggregated {} into {} bucket {}",
            accumulated.id,
            usage.organization_id,
            bucket
        );
        self.emit(&self.config.aggregated_topic, &doc);
        Ok(())
    }

    /// Runs the aggregation of every parked accumulated document again.
    /// Returns how many were aggregated this time.
    pub fn replay_failed(&self) -> Result<usize, UsageError> {
        let partition = self.errors.route(ERRORS_DB, 0, Operation::Read)?;
        let prefix = format!("k/{}/", ErrorStage::Aggregate.as_str());
        let mut replayed = 0;
        for (key, value) in self.store.range(ERRORS_DB, partition, &prefix)? {
            let mut record: ErrorRecord = serde_json::from_value(value).map_err(|e| corrupt(&key, e))?;
            if record.replayed {
                continue;
            }
            let accumulated = match &record.accumulated {
                Some(accumulated) => accumulated,
                None => continue,
            };
            let binding = self.bind(
                &accumulated.organization_id,
                &accumulated.metering_plan_id,
                &accumulated.rating_plan_id,
                &accumulated.pricing_plan_id,
            )?;
            let result = {
                let _guard = self.locks.lock(&accumulated.id);
                self.aggregate(&record.usage, accumulated, &binding)
            };
            match result {
                Ok(()) => {
                    record.replayed = true;
                    put_doc(self.store.as_ref(), ERRORS_DB, partition, &key, &record)?;
                    event!(Level::INFO, "Replayed {}", key);
                    replayed += 1;
                }
                Err(e) => {
                    event!(Level::WARN, "Replay of {} failed again: {}", key, e);
                }
            }
        }
        Ok(replayed)
    }

    /// The accumulated document of a lineage, charged as of `time`.
    pub fn retrieve_accumulated(&self, key: &OutputKey, time: i64) -> Result<Option<AccumulatedDoc>, UsageError> {
        let okey = key.to_string();
        let times = neighbour_months(time);
        let mut doc = match self
            .retry
            .run("read accumulated usage", || self.find_accumulated(&okey, &times[1..]))?
        {
            Some(doc) => doc,
            None => return Ok(None),
        };
        let binding = self.bind(
            &doc.organization_id,
            &doc.metering_plan_id,
            &doc.rating_plan_id,
            &doc.pricing_plan_id,
        )?;
        self.accumulator.charge_at(&binding, &mut doc, time)?;
        Ok(Some(doc))
    }

    /// The aggregated document of an organization, charged as of `time`.
    pub fn retrieve_aggregated(&self, organization_id: &str, time: i64) -> Result<Option<AggregatedDoc>, UsageError> {
        let mut doc = match self.retry.run("read aggregated usage", || {
            self.latest_aggregated(organization_id, time)
        })? {
            Some(doc) => doc,
            None => return Ok(None),
        };
        let mut bindings = HashMap::new();
        for plan in doc.plans() {
            let binding = self.bind(
                organization_id,
                &plan.metering_plan_id,
                &plan.rating_plan_id,
                &plan.pricing_plan_id,
            )?;
            bindings.insert(plan.plan_key(), binding);
        }
        self.aggregator.charge_at(&bindings, &mut doc, time)?;
        Ok(Some(doc))
    }

    /// Like `retrieve_aggregated`, as of now.
    pub fn current_aggregated(&self, organization_id: &str) -> Result<Option<AggregatedDoc>, UsageError> {
        self.retrieve_aggregated(organization_id, Utc::now().timestamp_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::{SubmitOutcome, UsagePipeline, ACCUMULATED_DB, AGGREGATED_DB, ERRORS_DB};
    use crate::accumulator::tests::{calls_event, NOVEMBER};
    use crate::accumulator::AccumulatedDoc;
    use crate::config::EngineConfig;
    use crate::error::UsageError;
    use crate::key::build_key;
    use crate::partition::PartitionRef;
    use crate::plan::tests::registry;
    use crate::producer::DummyProducer;
    use crate::rating::Quantity;
    use crate::seqid::{SequenceIdGenerator, SequenceState};
    use crate::store::tests::FlakyStore;
    use crate::store::{DocumentStore, MemoryStore, StoreError};
    use crate::usage::tests::storage_event;
    use crate::window::Dimension;
    use chrono::Utc;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn config() -> EngineConfig {
        EngineConfig {
            retry_initial_millis: 1,
            retry_max_millis: 2,
            retry_max_elapsed_millis: 20,
            ..EngineConfig::default()
        }
    }

    fn pipeline(store: Arc<dyn DocumentStore>) -> UsagePipeline {
        UsagePipeline::new(config(), Arc::new(registry()), store)
    }

    fn quantity(doc: &AccumulatedDoc, metric: &str, dimension: Dimension, previous: bool) -> Option<Quantity> {
        let pair = doc.metric(metric)?.pair(dimension);
        let cell = if previous { &pair.previous } else { &pair.current };
        cell.as_ref().map(|c| c.quantity)
    }

    fn d(v: i64) -> Option<Quantity> {
        Some(Quantity::Discrete(Decimal::from(v)))
    }

    /// Refuses aggregated writes under a key prefix, and can hide
    /// aggregated documents from range reads as a lagging replica would.
    struct AggregationFaults {
        inner: MemoryStore,
        failing: Mutex<Option<String>>,
        hidden: AtomicBool,
    }

    impl AggregationFaults {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                failing: Mutex::new(None),
                hidden: AtomicBool::new(false),
            }
        }

        fn fail(&self, prefix: Option<&str>) {
            *self.failing.lock() = prefix.map(str::to_string);
        }
    }

    impl DocumentStore for AggregationFaults {
        fn get(&self, db: &str, partition: PartitionRef, key: &str) -> Result<Option<Value>, StoreError> {
            self.inner.get(db, partition, key)
        }

        fn put(&self, db: &str, partition: PartitionRef, key: &str, doc: Value) -> Result<(), StoreError> {
            let failing = self.failing.lock().clone();
            if let Some(prefix) = failing {
                if db == AGGREGATED_DB && key.starts_with(&prefix) {
                    return Err(StoreError::Unavailable(format!("cannot write {}", key)));
                }
            }
            self.inner.put(db, partition, key, doc)
        }

        fn range(&self, db: &str, partition: PartitionRef, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
            if db == AGGREGATED_DB && self.hidden.load(Ordering::SeqCst) {
                return Ok(Vec::new());
            }
            self.inner.range(db, partition, prefix)
        }
    }

    #[test]
    fn test_storage_end_to_end() {
        let pipeline = pipeline(Arc::new(MemoryStore::new()));
        let usage = storage_event(1073741824, NOVEMBER, NOVEMBER + 1000);
        assert_eq!(pipeline.submit(&usage).unwrap(), SubmitOutcome::Accepted);

        let doc = pipeline
            .retrieve_accumulated(&build_key(&usage), NOVEMBER + 1000)
            .unwrap()
            .unwrap();
        assert_eq!(
            quantity(&doc, "storage", Dimension::Month, false),
            Some(Quantity::Discrete(Decimal::ONE))
        );
        assert!(pipeline.health().healthy());
    }

    #[test]
    fn test_calls_are_summed_and_rated() {
        let store = Arc::new(MemoryStore::new());
        let producer = DummyProducer::default();
        let pipeline = pipeline(store.clone()).with_producer(Arc::new(producer.clone()));
        let first = calls_event(100, NOVEMBER + 100);
        assert_eq!(pipeline.submit(&first).unwrap(), SubmitOutcome::Accepted);
        assert_eq!(
            pipeline.submit(&calls_event(50, NOVEMBER + 200)).unwrap(),
            SubmitOutcome::Accepted
        );

        let doc = pipeline
            .retrieve_accumulated(&build_key(&first), NOVEMBER + 200)
            .unwrap()
            .unwrap();
        let month = doc
            .metric("heavy_api_calls")
            .unwrap()
            .pair(Dimension::Month)
            .current
            .clone()
            .unwrap();
        assert_eq!(Some(month.quantity), d(150));
        assert_eq!(month.charge, Decimal::new(225, 1));

        let aggregated = pipeline.current_aggregated("org-1").unwrap().unwrap();
        assert_eq!(aggregated.windows.pair(Dimension::Month).current, Some(Decimal::new(225, 1)));
        assert_eq!(
            aggregated.consumer("space-1", "app-1").unwrap().windows.pair(Dimension::Month).current,
            Some(Decimal::new(225, 1))
        );

        assert_eq!(producer.documents("accumulated-usage").len(), 2);
        assert_eq!(producer.documents("aggregated-usage").len(), 2);
        assert_eq!(store.count(ACCUMULATED_DB), 1);
        // Organization, consumer and space documents share a bucket, one
        // marker per accumulated document.
        assert_eq!(store.count(AGGREGATED_DB), 5);
    }

    #[test]
    fn test_resubmission_is_idempotent() {
        let pipeline = pipeline(Arc::new(MemoryStore::new()));
        let usage = calls_event(100, NOVEMBER);
        assert_eq!(pipeline.submit(&usage).unwrap(), SubmitOutcome::Accepted);
        for _ in 0..3 {
            assert_eq!(pipeline.submit(&usage).unwrap(), SubmitOutcome::Duplicate);
        }
        let doc = pipeline
            .retrieve_accumulated(&build_key(&usage), NOVEMBER)
            .unwrap()
            .unwrap();
        assert_eq!(quantity(&doc, "heavy_api_calls", Dimension::Forever, false), d(100));
        let aggregated = pipeline.current_aggregated("org-1").unwrap().unwrap();
        assert_eq!(aggregated.windows.pair(Dimension::Forever).current, Some(Decimal::from(15)));
    }

    #[test]
    fn test_dedup_id_extends_the_lineage() {
        let pipeline = pipeline(Arc::new(MemoryStore::new()));
        let mut first = calls_event(10, NOVEMBER);
        first.dedup_id = Some("a".to_string());
        let mut second = first.clone();
        second.dedup_id = Some("b".to_string());
        assert_eq!(pipeline.submit(&first).unwrap(), SubmitOutcome::Accepted);
        assert_eq!(pipeline.submit(&second).unwrap(), SubmitOutcome::Accepted);
        assert_eq!(pipeline.submit(&second).unwrap(), SubmitOutcome::Duplicate);

        let doc = pipeline
            .retrieve_accumulated(&build_key(&second), NOVEMBER)
            .unwrap()
            .unwrap();
        assert_eq!(quantity(&doc, "heavy_api_calls", Dimension::Forever, false), d(10));
        let aggregated = pipeline.current_aggregated("org-1").unwrap().unwrap();
        assert_eq!(aggregated.windows.pair(Dimension::Forever).current, Some(Decimal::new(300, 2)));
    }

    #[test]
    fn test_invalid_usage_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(store.clone());
        let mut usage = calls_event(1, NOVEMBER);
        usage.organization_id = "".to_string();
        assert!(matches!(pipeline.submit(&usage).unwrap(), SubmitOutcome::Rejected(_)));
        assert_eq!(store.count(ACCUMULATED_DB), 0);
        assert_eq!(store.count(ERRORS_DB), 0);
    }

    #[test]
    fn test_unknown_plan_goes_to_error_lineage() {
        let store = Arc::new(MemoryStore::new());
        let producer = DummyProducer::default();
        let pipeline = pipeline(store.clone()).with_producer(Arc::new(producer.clone()));
        let mut usage = calls_event(1, NOVEMBER);
        usage.metering_plan_id = "missing".to_string();
        assert_eq!(
            pipeline.submit(&usage).unwrap(),
            SubmitOutcome::Rejected("unknown metering plan missing".to_string())
        );
        assert_eq!(store.count(ACCUMULATED_DB), 0);
        assert_eq!(store.count(ERRORS_DB), 1);
        let errors = producer.documents("usage-errors");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["stage"], "accumulate");

        // Other usage keeps flowing.
        assert_eq!(pipeline.submit(&calls_event(1, NOVEMBER)).unwrap(), SubmitOutcome::Accepted);
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let pipeline = pipeline(Arc::new(FlakyStore::new(2)));
        let usage = calls_event(7, NOVEMBER);
        assert_eq!(pipeline.submit(&usage).unwrap(), SubmitOutcome::Accepted);
        assert!(pipeline.health().healthy());
    }

    #[test]
    fn test_exhausted_retries_report_failure() {
        let pipeline = pipeline(Arc::new(FlakyStore::new(usize::MAX)));
        let usage = calls_event(7, NOVEMBER);
        let err = pipeline.submit(&usage).unwrap_err();
        assert!(err.is_transient());
        let later = Utc::now().timestamp_millis() + config().health_threshold_millis + 1000;
        assert!(!pipeline.health().healthy_at(later));
        // Not marked as seen, so a redelivery is processed again.
        assert!(pipeline.dedup().is_empty());
    }

    #[test]
    fn test_concurrent_submissions_on_one_lineage() {
        let pipeline = Arc::new(pipeline(Arc::new(MemoryStore::new())));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let pipeline = Arc::clone(&pipeline);
                thread::spawn(move || {
                    for i in 0..10 {
                        let usage = calls_event(1, NOVEMBER + t * 100 + i);
                        assert_eq!(pipeline.submit(&usage).unwrap(), SubmitOutcome::Accepted);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let doc = pipeline
            .retrieve_accumulated(&build_key(&calls_event(1, NOVEMBER)), NOVEMBER + 1000)
            .unwrap()
            .unwrap();
        assert_eq!(quantity(&doc, "heavy_api_calls", Dimension::Forever, false), d(80));
        let aggregated = pipeline.current_aggregated("org-1").unwrap().unwrap();
        assert_eq!(aggregated.windows.pair(Dimension::Forever).current, Some(Decimal::new(1200, 2)));
    }

    #[test]
    fn test_late_usage_carries_into_next_month_document() {
        let pipeline = pipeline(Arc::new(MemoryStore::new()));
        let recent = NOVEMBER + 86400000;
        let late = NOVEMBER - 86400000;
        pipeline.submit(&calls_event(10, recent)).unwrap();
        pipeline.submit(&calls_event(7, late)).unwrap();

        let doc = pipeline
            .retrieve_accumulated(&build_key(&calls_event(1, recent)), recent)
            .unwrap()
            .unwrap();
        assert_eq!(quantity(&doc, "heavy_api_calls", Dimension::Month, false), d(10));
        assert_eq!(quantity(&doc, "heavy_api_calls", Dimension::Month, true), d(7));
        assert_eq!(quantity(&doc, "heavy_api_calls", Dimension::Forever, false), d(17));
    }

    fn forever_charge(pipeline: &UsagePipeline) -> Option<Decimal> {
        pipeline
            .current_aggregated("org-1")
            .unwrap()
            .and_then(|doc| doc.windows.pair(Dimension::Forever).current)
    }

    #[test]
    fn test_parked_aggregation_is_replayed() {
        let store = Arc::new(AggregationFaults::new());
        store.fail(Some("k/"));
        let pipeline = pipeline(store.clone());
        let usage = calls_event(20, NOVEMBER);
        assert_eq!(pipeline.submit(&usage).unwrap(), SubmitOutcome::Accepted);
        assert_eq!(store.inner.count(ACCUMULATED_DB), 1);
        assert_eq!(store.inner.count(ERRORS_DB), 1);
        assert!(pipeline.current_aggregated("org-1").unwrap().is_none());

        assert_eq!(pipeline.replay_failed().unwrap(), 0);
        store.fail(None);
        assert_eq!(pipeline.replay_failed().unwrap(), 1);
        assert_eq!(pipeline.replay_failed().unwrap(), 0);

        let aggregated = pipeline.current_aggregated("org-1").unwrap().unwrap();
        assert_eq!(aggregated.windows.pair(Dimension::Month).current, Some(Decimal::from(3)));
    }

    #[test]
    fn test_parked_aggregation_superseded_by_later_usage() {
        let store = Arc::new(AggregationFaults::new());
        store.fail(Some("k/"));
        let pipeline = pipeline(store.clone());
        assert_eq!(pipeline.submit(&calls_event(20, NOVEMBER)).unwrap(), SubmitOutcome::Accepted);
        store.fail(None);
        assert_eq!(pipeline.submit(&calls_event(10, NOVEMBER + 10)).unwrap(), SubmitOutcome::Accepted);
        assert_eq!(forever_charge(&pipeline), Some(Decimal::new(450, 2)));

        // The later document carried the parked usage along.
        assert_eq!(pipeline.replay_failed().unwrap(), 1);
        assert_eq!(forever_charge(&pipeline), Some(Decimal::new(450, 2)));
        let doc = pipeline
            .retrieve_accumulated(&build_key(&calls_event(1, NOVEMBER)), NOVEMBER + 10)
            .unwrap()
            .unwrap();
        assert_eq!(quantity(&doc, "heavy_api_calls", Dimension::Forever, false), d(30));
    }

    #[test]
    fn test_partial_aggregated_write_is_rewritten() {
        let store = Arc::new(AggregationFaults::new());
        store.fail(Some("k/org-1/space-1/t/"));
        let pipeline = pipeline(store.clone());
        assert_eq!(pipeline.submit(&calls_event(20, NOVEMBER)).unwrap(), SubmitOutcome::Accepted);
        // Only the consumer document made it.
        assert_eq!(store.inner.count(AGGREGATED_DB), 1);
        assert_eq!(store.inner.count(ERRORS_DB), 1);
        assert!(pipeline.current_aggregated("org-1").unwrap().is_none());

        store.fail(None);
        assert_eq!(pipeline.replay_failed().unwrap(), 1);
        // Organization, consumer, space and marker.
        assert_eq!(store.inner.count(AGGREGATED_DB), 4);
        let aggregated = pipeline.current_aggregated("org-1").unwrap().unwrap();
        assert_eq!(
            aggregated.consumer("space-1", "app-1").unwrap().windows.pair(Dimension::Month).current,
            Some(Decimal::from(3))
        );
    }

    #[test]
    fn test_stale_aggregated_write_is_refused() {
        let store = Arc::new(AggregationFaults::new());
        let pipeline = pipeline(store.clone());
        pipeline.submit(&calls_event(10, NOVEMBER)).unwrap();

        // The stored bucket is not visible, so the fold starts from
        // nothing and must not replace it.
        store.hidden.store(true, Ordering::SeqCst);
        assert_eq!(pipeline.submit(&calls_event(20, NOVEMBER + 10)).unwrap(), SubmitOutcome::Accepted);
        store.hidden.store(false, Ordering::SeqCst);
        assert_eq!(store.inner.count(ERRORS_DB), 1);
        assert_eq!(forever_charge(&pipeline), Some(Decimal::new(150, 2)));

        assert_eq!(pipeline.replay_failed().unwrap(), 1);
        assert_eq!(forever_charge(&pipeline), Some(Decimal::new(450, 2)));
    }

    #[test]
    fn test_stale_accumulated_write_is_refused() {
        let store = Arc::new(MemoryStore::new());
        let ahead = SequenceIdGenerator::new(0, 0, 0, SequenceState::new());
        ahead.next_at(Utc::now().timestamp_millis() + 86400000);
        let leader = pipeline(store.clone()).with_sequence(ahead);
        assert_eq!(leader.submit(&calls_event(10, NOVEMBER)).unwrap(), SubmitOutcome::Accepted);

        let lagging = pipeline(store.clone());
        let err = lagging.submit(&calls_event(20, NOVEMBER + 10)).unwrap_err();
        assert!(matches!(err, UsageError::Store(StoreError::Conflict { .. })));
        assert!(!err.is_transient());
        assert!(lagging.dedup().is_empty());

        let doc = lagging
            .retrieve_accumulated(&build_key(&calls_event(1, NOVEMBER)), NOVEMBER + 10)
            .unwrap()
            .unwrap();
        assert_eq!(quantity(&doc, "heavy_api_calls", Dimension::Forever, false), d(10));
        assert_eq!(store.count(ACCUMULATED_DB), 1);
    }

    #[test]
    fn test_space_named_t_does_not_shadow_organization() {
        let store = Arc::new(AggregationFaults::new());
        // Organization buckets start with the zero padded time.
        store.fail(Some("k/org-1/t/00"));
        let pipeline = pipeline(store.clone());
        let mut usage = calls_event(20, NOVEMBER);
        usage.space_id = "t".to_string();
        usage.consumer_id = Some("0app".to_string());
        assert_eq!(pipeline.submit(&usage).unwrap(), SubmitOutcome::Accepted);
        assert_eq!(store.inner.count(AGGREGATED_DB), 3);
        assert!(pipeline.current_aggregated("org-1").unwrap().is_none());

        store.fail(None);
        assert_eq!(pipeline.replay_failed().unwrap(), 1);
        let aggregated = pipeline.current_aggregated("org-1").unwrap().unwrap();
        assert!(aggregated.consumer("t", "0app").is_some());
        assert_eq!(aggregated.windows.pair(Dimension::Month).current, Some(Decimal::from(3)));
    }

    #[test]
    fn test_unbounded_dedup_age() {
        let config = EngineConfig {
            dedup_max_age_secs: i64::MAX,
            ..config()
        };
        let pipeline = UsagePipeline::new(config, Arc::new(registry()), Arc::new(MemoryStore::new()));
        let usage = calls_event(5, NOVEMBER);
        assert_eq!(pipeline.submit(&usage).unwrap(), SubmitOutcome::Accepted);
        assert_eq!(pipeline.submit(&usage).unwrap(), SubmitOutcome::Duplicate);
    }
}
