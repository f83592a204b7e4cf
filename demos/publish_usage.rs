extern crate usage_aggregator;

use clap::Parser;
use std::fs;
use usage_aggregator::producer::publish;
use usage_aggregator::{KafkaConfig, KafkaProducer, UsageEvent};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Kafka broker server in the host:port form
    #[arg(short, long)]
    bootstrap_server: String,

    /// Kafka topic to produce onto
    #[arg(short, long, default_value = "usage")]
    topic: String,

    /// JSON array of usage events
    #[arg(short, long, default_value = "demos/data/usage.json")]
    usage: String,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt::init();

    let kafka_config = KafkaConfig::new_producer_config(args.bootstrap_server.as_str(), None);
    let producer = KafkaProducer::new(kafka_config).unwrap();

    let events: Vec<UsageEvent> = serde_json::from_str(&fs::read_to_string(&args.usage).unwrap()).unwrap();
    for usage in &events {
        publish(&producer, &args.topic, usage).unwrap();
    }
}
