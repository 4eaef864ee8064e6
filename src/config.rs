//! Layered configuration for a virtual consumer instance.
//!
//! Same layering mechanism as `app::config::Config` (`app/config.rs`): a
//! `Defaults` [`Source`] for built-in values, an `Environment` source with a
//! crate-specific prefix, and finally explicit fields supplied by the caller
//! (the demo binary's CLI args, or a library caller's own struct). The
//! profile-file and theme layers are dropped — there is no interactive TUI
//! left to persist a profile for.

use std::collections::HashMap;

use chrono::Utc;
use config::{Config as ConfigRs, ConfigError, Environment, Map, Source, Value};
use serde::{Deserialize, Serialize};

/// Prefix used to generate a default virtual consumer id from the host name.
pub const DEFAULT_CONSUMER_ID_PREFIX: &str = "sideline-spout-";

/// Environment variable prefix consulted for overrides, e.g.
/// `SIDELINE_SPOUT_KAFKA_BROKERS`.
const ENV_PREFIX: &str = "SIDELINE_SPOUT";

/// Resolved configuration for one virtual consumer instance.
#[derive(Debug, Deserialize, Serialize)]
pub struct VirtualConsumerConfig {
    /// Unique id for this virtual consumer instance.
    pub virtual_consumer_id: String,
    /// Kafka-compatible bootstrap servers the log consumer connects to.
    pub kafka_brokers: String,
    /// Topic (namespace) this instance consumes from.
    pub kafka_topic: String,
    /// Consumer group id passed to the underlying client.
    pub kafka_group_id: String,
    /// Additional client properties applied verbatim to the Kafka client.
    pub kafka_properties: Option<HashMap<String, String>>,
    /// Selects the [`crate::retry::RetryPolicy`] implementation; see
    /// `crate::registry::retry_policy_for`.
    pub failed_msg_retry_manager_class: String,
    /// Selects the [`crate::persistence::PersistenceAdapter`] implementation;
    /// see `crate::registry::persistence_adapter_for`.
    pub persistence_manager_class: String,
    /// Selects the [`crate::metrics::MetricsRecorder`] implementation; see
    /// `crate::registry::metrics_recorder_for`.
    pub metrics_recorder_class: String,
    /// Selects the [`crate::deserializer::Deserializer`] implementation; see
    /// `crate::registry::deserializer_for`.
    pub deserializer_class: String,
    /// How many virtual consumer peers share this topic's partitions.
    pub num_consumers: u32,
    /// This instance's index among `num_consumers` peers.
    pub consumer_index: u32,
}

impl VirtualConsumerConfig {
    /// Loads configuration from defaults, environment, and explicit
    /// fields, in that precedence order (explicit fields win).
    ///
    /// Precedence, 1 is highest:
    /// 1. `explicit_fields`
    /// 2. Environment variables prefixed `SIDELINE_SPOUT_`
    /// 3. Built-in defaults
    pub fn new<S>(explicit_fields: S) -> anyhow::Result<Self>
    where
        S: Source + Send + Sync + 'static,
    {
        let config = ConfigRs::builder()
            .add_source(Defaults)
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("_"))
            .add_source(explicit_fields)
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

/// Built-in default values, mirroring the `app::config::Defaults` source.
#[derive(Debug)]
struct Defaults;

impl Source for Defaults {
    fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
        Box::new(Defaults)
    }

    fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
        let mut cfg = Map::new();

        cfg.insert(
            String::from("virtual_consumer_id"),
            Value::from(generate_consumer_id()),
        );
        cfg.insert(
            String::from("kafka_group_id"),
            Value::from(generate_consumer_id()),
        );
        cfg.insert(
            String::from("failed_msg_retry_manager_class"),
            Value::from("never"),
        );
        cfg.insert(
            String::from("persistence_manager_class"),
            Value::from("in_memory"),
        );
        cfg.insert(
            String::from("metrics_recorder_class"),
            Value::from("tracing"),
        );
        cfg.insert(String::from("deserializer_class"), Value::from("identity"));
        cfg.insert(String::from("num_consumers"), Value::from(1));
        cfg.insert(String::from("consumer_index"), Value::from(0));

        Ok(cfg)
    }
}

/// Generates a default id from the host name, falling back to the current
/// UTC epoch millis if the host name cannot be resolved, exactly as
/// `generate_group_id` does.
fn generate_consumer_id() -> String {
    match gethostname::gethostname().into_string() {
        Ok(name) => format!("{DEFAULT_CONSUMER_ID_PREFIX}{name}"),
        Err(_) => {
            tracing::error!("failed to get hostname");
            format!("{DEFAULT_CONSUMER_ID_PREFIX}{}", Utc::now().timestamp_millis())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{Map, Value};

    #[derive(Debug)]
    struct Explicit(Map<String, Value>);

    impl Source for Explicit {
        fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
            Box::new(Explicit(self.0.clone()))
        }

        fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn defaults_fill_in_when_explicit_fields_are_absent() {
        let mut explicit = Map::new();
        explicit.insert(String::from("kafka_brokers"), Value::from("localhost:9092"));
        explicit.insert(String::from("kafka_topic"), Value::from("orders"));

        let config = VirtualConsumerConfig::new(Explicit(explicit)).unwrap();
        assert_eq!(config.kafka_brokers, "localhost:9092");
        assert_eq!(config.kafka_topic, "orders");
        assert_eq!(config.persistence_manager_class, "in_memory");
        assert_eq!(config.num_consumers, 1);
    }

    #[test]
    fn explicit_fields_override_defaults() {
        let mut explicit = Map::new();
        explicit.insert(String::from("kafka_brokers"), Value::from("localhost:9092"));
        explicit.insert(String::from("kafka_topic"), Value::from("orders"));
        explicit.insert(
            String::from("persistence_manager_class"),
            Value::from("filesystem:/tmp/x"),
        );

        let config = VirtualConsumerConfig::new(Explicit(explicit)).unwrap();
        assert_eq!(config.persistence_manager_class, "filesystem:/tmp/x");
    }
}
