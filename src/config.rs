//! Engine configuration, read from `USAGE_*` environment variables.

use crate::dedup::{DEFAULT_CAPACITY, DEFAULT_MAX_AGE_MILLIS};
use crate::plan::DEFAULT_COUNTRY;
use crate::retry::RetryPolicy;
use ::config::{Config, Environment};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unsupported reducer kind {0}")]
    UnsupportedReducer(String),

    #[error("failed to load configuration")]
    Load(#[from] ::config::ConfigError),
}

fn default_dedup_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_dedup_max_age_secs() -> i64 {
    DEFAULT_MAX_AGE_MILLIS / 1000
}

fn default_sampling_millis() -> i64 {
    86400000
}

fn default_health_threshold_millis() -> i64 {
    60000
}

fn default_retry_initial_millis() -> u64 {
    50
}

fn default_retry_max_millis() -> u64 {
    2000
}

fn default_retry_max_elapsed_millis() -> u64 {
    10000
}

fn default_country() -> String {
    DEFAULT_COUNTRY.to_string()
}

fn default_partitions() -> u32 {
    4
}

fn default_accumulated_topic() -> String {
    "accumulated-usage".to_string()
}

fn default_aggregated_topic() -> String {
    "aggregated-usage".to_string()
}

fn default_error_topic() -> String {
    "usage-errors".to_string()
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct EngineConfig {
    /// Whether reducers require authorization scopes.
    #[serde(default)]
    pub secured: bool,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    #[serde(default = "default_dedup_max_age_secs")]
    pub dedup_max_age_secs: i64,
    /// Granularity of aggregated document buckets.
    #[serde(default = "default_sampling_millis")]
    pub sampling_millis: i64,
    #[serde(default = "default_health_threshold_millis")]
    pub health_threshold_millis: i64,
    #[serde(default = "default_retry_initial_millis")]
    pub retry_initial_millis: u64,
    #[serde(default = "default_retry_max_millis")]
    pub retry_max_millis: u64,
    #[serde(default = "default_retry_max_elapsed_millis")]
    pub retry_max_elapsed_millis: u64,
    #[serde(default = "default_country")]
    pub default_country: String,
    #[serde(default)]
    pub app_index: u32,
    #[serde(default)]
    pub cluster_index: u32,
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    #[serde(default = "default_accumulated_topic")]
    pub accumulated_topic: String,
    #[serde(default = "default_aggregated_topic")]
    pub aggregated_topic: String,
    #[serde(default = "default_error_topic")]
    pub error_topic: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            secured: false,
            dedup_capacity: default_dedup_capacity(),
            dedup_max_age_secs: default_dedup_max_age_secs(),
            sampling_millis: default_sampling_millis(),
            health_threshold_millis: default_health_threshold_millis(),
            retry_initial_millis: default_retry_initial_millis(),
            retry_max_millis: default_retry_max_millis(),
            retry_max_elapsed_millis: default_retry_max_elapsed_millis(),
            default_country: default_country(),
            app_index: 0,
            cluster_index: 0,
            partitions: default_partitions(),
            accumulated_topic: default_accumulated_topic(),
            aggregated_topic: default_aggregated_topic(),
            error_topic: default_error_topic(),
        }
    }
}

impl EngineConfig {
    /// Loads the configuration from the environment, e.g.
    /// `USAGE_DEDUP_CAPACITY=500`. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("USAGE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_millis: self.retry_initial_millis,
            max_millis: self.retry_max_millis,
            max_elapsed_millis: self.retry_max_elapsed_millis,
        }
    }
}
