extern crate usage_aggregator;

use clap::Parser;
use std::fs;
use std::sync::Arc;
use usage_aggregator::{
    build_key, EngineConfig, KafkaConfig, KafkaProducer, MemoryStore, MeteringPlan, PlanRegistry,
    PricingPlan, RatingPlan, UsageEvent, UsagePipeline,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON array of usage events
    #[arg(short, long, default_value = "demos/data/usage.json")]
    usage: String,

    #[arg(long, default_value = "demos/data/object-metering.json")]
    metering: String,

    #[arg(long, default_value = "demos/data/object-rating.json")]
    rating: String,

    #[arg(long, default_value = "demos/data/object-pricing.json")]
    pricing: String,

    /// Kafka broker server in the host:port form, documents are only
    /// printed when missing
    #[arg(short, long)]
    bootstrap_server: Option<String>,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt::init();

    let config = EngineConfig::from_env().unwrap();
    let plans = PlanRegistry::new(&config.default_country);
    plans
        .add_metering_plan(MeteringPlan::from_json(&fs::read_to_string(&args.metering).unwrap()).unwrap())
        .unwrap();
    plans
        .add_rating_plan(RatingPlan::from_json(&fs::read_to_string(&args.rating).unwrap()).unwrap())
        .unwrap();
    plans.add_pricing_plan(PricingPlan::from_json(&fs::read_to_string(&args.pricing).unwrap()).unwrap());

    let mut pipeline = UsagePipeline::new(config, Arc::new(plans), Arc::new(MemoryStore::new()));
    if let Some(bootstrap_server) = &args.bootstrap_server {
        let kafka_config = KafkaConfig::new_producer_config(bootstrap_server, None);
        pipeline = pipeline.with_producer(Arc::new(KafkaProducer::new(kafka_config).unwrap()));
    }

    let events: Vec<UsageEvent> = serde_json::from_str(&fs::read_to_string(&args.usage).unwrap()).unwrap();
    for usage in &events {
        let outcome = pipeline.submit(usage).unwrap();
        println!("{} at {}: {:?}", build_key(usage), usage.end, outcome);
    }

    for usage in &events {
        if let Some(doc) = pipeline.retrieve_accumulated(&build_key(usage), usage.end).unwrap() {
            println!("{}", serde_json::to_string_pretty(&doc).unwrap());
        }
    }

    let mut organizations: Vec<&str> = events.iter().map(|u| u.organization_id.as_str()).collect();
    organizations.sort();
    organizations.dedup();
    for organization_id in organizations {
        if let Some(doc) = pipeline.current_aggregated(organization_id).unwrap() {
            println!("{}", serde_json::to_string_pretty(&doc).unwrap());
        }
    }
}
