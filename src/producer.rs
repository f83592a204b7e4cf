//! This module provides an abstraction over a Kafka producer so the
//! pipeline can publish accumulated and aggregated documents without
//! depending on the rdkafka ThreadedProducer.
//!
//! It also simplify unit tests.

use rdkafka::config::ClientConfig as RdKafkaConfig;
use rdkafka::producer::{BaseRecord, ThreadedProducer};
use rdkafka::producer::{DeliveryResult, ProducerContext};
use rdkafka::ClientContext;
#[cfg(test)]
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
#[cfg(test)]
use std::sync::Arc;
use thiserror::Error;
use tracing::{event, Level};

/// This structure wraps the parameters to initialize a producer.
/// This struct is there in order not to expose the rdkafka
/// details outside.
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    config_map: HashMap<String, String>,
}

impl KafkaConfig {
    pub fn new_producer_config(
        bootstrap_servers: &str,
        override_params: Option<HashMap<String, String>>,
    ) -> Self {
        let mut config_map: HashMap<String, String> = HashMap::new();
        config_map.insert("bootstrap.servers".to_string(), bootstrap_servers.into());
        // Documents for one lineage must not be reordered by retries.
        config_map.insert("enable.idempotence".to_string(), "true".to_string());

        let config = Self { config_map };

        apply_override_params(config, override_params)
    }
}

impl From<KafkaConfig> for RdKafkaConfig {
    fn from(item: KafkaConfig) -> Self {
        let mut config_obj = RdKafkaConfig::new();
        for (key, val) in item.config_map.iter() {
            config_obj.set(key, val);
        }
        config_obj
    }
}

fn apply_override_params<V>(
    mut config: KafkaConfig,
    override_params: Option<HashMap<String, V>>,
) -> KafkaConfig
where
    V: Into<String>,
{
    if let Some(params) = override_params {
        for (param, value) in params {
            config.config_map.insert(param, value.into());
        }
    }
    config
}

struct CaptureErrorContext;

impl ClientContext for CaptureErrorContext {}

impl ProducerContext for CaptureErrorContext {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult, _delivery_opaque: Self::DeliveryOpaque) {
        match result {
            Ok(_) => {
                event!(Level::DEBUG, "Document produced.")
            }
            Err((kafka_err, _)) => {
                event!(Level::ERROR, "Document production failed. {}", kafka_err)
            }
        }
    }
}

/// Kafka producer errors.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Failed to send a kafka message.
    #[error("failed to send kafka message")]
    SendFailed(#[source] rdkafka::error::KafkaError),

    /// Failed to create a kafka producer because of the invalid configuration.
    #[error("failed to create kafka producer: invalid kafka config")]
    InvalidConfig(#[source] rdkafka::error::KafkaError),

    #[error("failed to encode document")]
    Encode(#[source] serde_json::Error),
}

/// A basic Kafka Producer trait, shared by every worker of the
/// pipeline.
pub trait Producer: Send + Sync {
    fn send(&self, topic_name: &str, payload: &[u8]) -> Result<(), ClientError>;
}

/// Encodes a document as JSON and sends it to a topic.
pub fn publish<T: Serialize>(producer: &dyn Producer, topic_name: &str, doc: &T) -> Result<(), ClientError> {
    let payload = serde_json::to_vec(doc).map_err(ClientError::Encode)?;
    producer.send(topic_name, &payload)
}

pub struct KafkaProducer {
    producer: ThreadedProducer<CaptureErrorContext>,
}

impl KafkaProducer {
    pub fn new(config: KafkaConfig) -> Result<KafkaProducer, ClientError> {
        let producer_config: RdKafkaConfig = config.into();
        let producer = producer_config
            .create_with_context(CaptureErrorContext)
            .map_err(ClientError::InvalidConfig)?;
        Ok(KafkaProducer { producer })
    }
}

impl Producer for KafkaProducer {
    fn send(&self, topic_name: &str, payload: &[u8]) -> Result<(), ClientError> {
        let record: BaseRecord<'_, [u8], [u8]> = BaseRecord::to(topic_name).payload(payload);
        self.producer
            .send(record)
            .map_err(|(error, _message)| ClientError::SendFailed(error))
    }
}

#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct DummyProducer {
    pub messages: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

#[cfg(test)]
impl DummyProducer {
    pub(crate) fn topics(&self) -> Vec<String> {
        self.messages.lock().iter().map(|(t, _)| t.clone()).collect()
    }

    pub(crate) fn documents(&self, topic_name: &str) -> Vec<serde_json::Value> {
        self.messages
            .lock()
            .iter()
            .filter(|(t, _)| t == topic_name)
            .filter_map(|(_, payload)| serde_json::from_slice(payload).ok())
            .collect()
    }
}

#[cfg(test)]
impl Producer for DummyProducer {
    fn send(&self, topic_name: &str, payload: &[u8]) -> Result<(), ClientError> {
        self.messages
            .lock()
            .push((topic_name.to_string(), payload.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{publish, DummyProducer, KafkaConfig, Producer};
    use rdkafka::config::ClientConfig as RdKafkaConfig;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_build_producer_configuration() {
        let config = KafkaConfig::new_producer_config(
            "localhost:9092",
            Some(HashMap::from([(
                "queued.max.messages.kbytes".to_string(),
                "1000000".to_string(),
            )])),
        );

        let rdkafka_config: RdKafkaConfig = config.into();
        assert_eq!(
            rdkafka_config.get("queued.max.messages.kbytes"),
            Some("1000000")
        );
        assert_eq!(rdkafka_config.get("enable.idempotence"), Some("true"));
    }

    #[test]
    fn test_overrides_win() {
        let config = KafkaConfig::new_producer_config(
            "localhost:9092",
            Some(HashMap::from([(
                "enable.idempotence".to_string(),
                "false".to_string(),
            )])),
        );
        let rdkafka_config: RdKafkaConfig = config.into();
        assert_eq!(rdkafka_config.get("enable.idempotence"), Some("false"));
    }

    #[test]
    fn test_publish_json() {
        let producer = DummyProducer::default();
        let res = publish(&producer, "accumulated-usage", &json!({"id": "org-1"}));
        assert!(res.is_ok());
        assert!(producer.send("other", "raw".as_bytes()).is_ok());

        assert_eq!(producer.topics(), vec!["accumulated-usage", "other"]);
        assert_eq!(producer.documents("accumulated-usage")[0]["id"], "org-1");
    }
}
