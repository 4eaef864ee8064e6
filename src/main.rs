//! Demo supervisor binary: wires one [`VirtualConsumer`] from configuration
//! and drives its `next_tuple`/`ack`/`flush_state` loop until stopped.
//!
//! Mirrors the shape of `init_env` then a run loop, minus the TUI,
//! schema-registry client, and log-file capture layer, none of which have a
//! counterpart once the interactive viewer is gone.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use config::{ConfigError, Map, Source, Value};
use sideline_spout::message::VirtualConsumerId;
use sideline_spout::{config::VirtualConsumerConfig, VirtualConsumer};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Runs a single virtual consumer against a Kafka-compatible topic.
#[derive(Clone, Debug, Default, Parser)]
#[command()]
struct Cli {
    /// Kafka-compatible bootstrap servers to connect to.
    #[arg(short, long)]
    brokers: Option<String>,
    /// Topic (namespace) to consume from.
    #[arg(short, long)]
    topic: Option<String>,
    /// Consumer group id. Defaults to a host-derived value.
    #[arg(short, long)]
    group_id: Option<String>,
    /// Selects the retry policy: `never`, `fixed_count:<n>`, or
    /// `exponential_backoff:<n>:<initial_ms>:<max_ms>`.
    #[arg(long)]
    retry_policy: Option<String>,
    /// Selects the persistence adapter: `in_memory` or `filesystem:<root>`.
    #[arg(long)]
    persistence: Option<String>,
    /// Selects the deserializer: `identity`.
    #[arg(long)]
    deserializer: Option<String>,
    /// How many virtual consumer peers share this topic's partitions.
    #[arg(long)]
    num_consumers: Option<u32>,
    /// This instance's index among its peers.
    #[arg(long)]
    consumer_index: Option<u32>,
}

impl Source for Cli {
    fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
        Box::new(self.clone())
    }

    fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
        let mut cfg = Map::new();

        if let Some(brokers) = self.brokers.as_ref() {
            cfg.insert(String::from("kafka_brokers"), Value::from(brokers.clone()));
        }
        if let Some(topic) = self.topic.as_ref() {
            cfg.insert(String::from("kafka_topic"), Value::from(topic.clone()));
        }
        if let Some(group_id) = self.group_id.as_ref() {
            cfg.insert(String::from("kafka_group_id"), Value::from(group_id.clone()));
        }
        if let Some(retry_policy) = self.retry_policy.as_ref() {
            cfg.insert(
                String::from("failed_msg_retry_manager_class"),
                Value::from(retry_policy.clone()),
            );
        }
        if let Some(persistence) = self.persistence.as_ref() {
            cfg.insert(
                String::from("persistence_manager_class"),
                Value::from(persistence.clone()),
            );
        }
        if let Some(deserializer) = self.deserializer.as_ref() {
            cfg.insert(
                String::from("deserializer_class"),
                Value::from(deserializer.clone()),
            );
        }
        if let Some(num_consumers) = self.num_consumers {
            cfg.insert(String::from("num_consumers"), Value::from(num_consumers));
        }
        if let Some(consumer_index) = self.consumer_index {
            cfg.insert(String::from("consumer_index"), Value::from(consumer_index));
        }

        Ok(cfg)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_env();

    let args = Cli::parse();
    let config = VirtualConsumerConfig::new(args).context("create virtual consumer config")?;

    run(config).await
}

/// Loads `.env` and installs the global `tracing` subscriber, minus the
/// file-capture layer that had no viewer left to feed.
fn init_env() {
    let dot_env_result = dotenvy::dotenv();

    let global_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt().with_env_filter(global_filter).init();

    match dot_env_result {
        Ok(path) => tracing::info!(".env file loaded from {}", path.display()),
        Err(dotenvy::Error::Io(io)) if io.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("no .env file found")
        }
        Err(e) => tracing::warn!("failed to load .env file: {}", e),
    }
}

async fn run(config: VirtualConsumerConfig) -> anyhow::Result<()> {
    let log_consumer_config = sideline_spout::log_consumer::kafka::KafkaLogConsumerConfig {
        brokers: config.kafka_brokers.clone(),
        topic: config.kafka_topic.clone(),
        group_id: config.kafka_group_id.clone(),
        num_consumers: config.num_consumers,
        consumer_index: config.consumer_index,
        extra_properties: config.kafka_properties.clone().unwrap_or_default(),
    };

    let log_consumer =
        sideline_spout::log_consumer::kafka::RdKafkaLogConsumer::new(log_consumer_config);

    let retry_policy = sideline_spout::registry::retry_policy_for(&config.failed_msg_retry_manager_class)
        .context("resolve retry policy")?;
    let persistence_adapter =
        sideline_spout::registry::persistence_adapter_for(&config.persistence_manager_class)
            .context("resolve persistence adapter")?;
    let metrics_recorder = sideline_spout::registry::metrics_recorder_for(&config.metrics_recorder_class)
        .context("resolve metrics recorder")?;
    let deserializer = sideline_spout::registry::deserializer_for(&config.deserializer_class)
        .context("resolve deserializer")?;

    let mut consumer = VirtualConsumer::new(
        VirtualConsumerId::new(config.virtual_consumer_id.clone()),
        None,
        log_consumer,
        sideline_spout::filter::FilterChain::new(),
        retry_policy,
        persistence_adapter,
        metrics_recorder,
        deserializer,
        sideline_spout::ConsumerState::new(),
        None,
    );

    consumer.open().await?;
    tracing::info!(
        id = %consumer.get_virtual_spout_id(),
        topic = %config.kafka_topic,
        "virtual consumer running"
    );

    let stop_handle = consumer.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, requesting stop");
            stop_handle.request_stop();
        }
    });

    let flush_every = Duration::from_secs(5);
    let mut last_flush = tokio::time::Instant::now();

    while !consumer.is_stop_requested() {
        match consumer.next_tuple().await {
            Ok(Some(message)) => {
                consumer.ack(&message.id).await?;
            }
            Ok(None) => tokio::time::sleep(Duration::from_millis(50)).await,
            Err(err) => {
                tracing::error!("error polling virtual consumer: {}", err);
                break;
            }
        }

        if last_flush.elapsed() >= flush_every {
            if let Err(err) = consumer.flush_state().await {
                tracing::error!("error flushing virtual consumer state: {}", err);
            }
            last_flush = tokio::time::Instant::now();
        }
    }

    consumer.close().await?;
    Ok(())
}
