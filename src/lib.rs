pub mod accumulator;
pub mod aggregator;
pub mod config;
pub mod dedup;
pub mod error;
pub mod health;
pub mod key;
pub mod lock;
pub mod partition;
pub mod pipeline;
pub mod plan;
pub mod producer;
pub mod rating;
pub mod reducer;
pub mod retry;
pub mod seqid;
pub mod store;
pub mod usage;
pub mod window;

pub use accumulator::{AccumulatedDoc, WindowedAccumulator};
pub use aggregator::{AggregatedDoc, HierarchicalAggregator};
pub use config::EngineConfig;
pub use error::UsageError;
pub use key::{build_key, OutputKey};
pub use pipeline::{SubmitOutcome, UsagePipeline};
pub use plan::{MeteringPlan, PlanProvider, PlanRegistry, PricingPlan, RatingPlan};
pub use producer::{KafkaConfig, KafkaProducer, Producer};
pub use rating::{PlanBinding, RatingEngine};
pub use store::{DocumentStore, MemoryStore};
pub use usage::{Measure, UsageEvent};
pub use window::Dimension;
