//! [`LogConsumer`] implementation on top of `rdkafka`.
//!
//! A `StreamConsumer` driven through a [`ConsumerContext`] for
//! rebalance/commit/stats logging, one split `StreamPartitionQueue` task per
//! assigned partition feeding a bounded channel, and a `TopicPartitionList`
//! for seek/assign/unsubscribe. Consumed records feed the engine's
//! `next_record` poll rather than a display channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::consumer::stream_consumer::StreamPartitionQueue;
use rdkafka::consumer::{
    Consumer as RDConsumer, ConsumerContext as RDConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::KafkaResult;
use rdkafka::message::Message as RDMessage;
use rdkafka::{ClientConfig, ClientContext, Offset, Statistics, TopicPartitionList};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::message::{Partition, Record};
use crate::state::ConsumerState;

use super::LogConsumer;

/// Hooks into librdkafka's lifecycle events, routing everything through
/// `tracing`.
struct KafkaContext;

impl ClientContext for KafkaContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        match level {
            RDKafkaLogLevel::Emerg
            | RDKafkaLogLevel::Alert
            | RDKafkaLogLevel::Critical
            | RDKafkaLogLevel::Error => tracing::error!("{} {}", fac, log_message),
            RDKafkaLogLevel::Warning => tracing::warn!("{} {}", fac, log_message),
            RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => {
                tracing::info!("{} {}", fac, log_message)
            }
            RDKafkaLogLevel::Debug => tracing::debug!("{} {}", fac, log_message),
        }
    }

    fn stats(&self, statistics: Statistics) {
        tracing::debug!("consumer statistics: {} messages in queue", statistics.msg_cnt);
    }
}

impl RDConsumerContext for KafkaContext {
    fn pre_rebalance(
        &self,
        _base_consumer: &rdkafka::consumer::BaseConsumer<Self>,
        rebalance: &Rebalance<'_>,
    ) {
        tracing::debug!("rebalance initiated: {:?}", rebalance);
    }

    fn post_rebalance(
        &self,
        _base_consumer: &rdkafka::consumer::BaseConsumer<Self>,
        rebalance: &Rebalance,
    ) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                for element in tpl.elements() {
                    tracing::info!(
                        "assigned partition {} on {}",
                        element.partition(),
                        element.topic()
                    );
                }
            }
            Rebalance::Revoke(tpl) => {
                for element in tpl.elements() {
                    tracing::info!(
                        "revoked partition {} on {}",
                        element.partition(),
                        element.topic()
                    );
                }
            }
            Rebalance::Error(err) => tracing::error!("error during rebalance: {}", err),
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => {
                for element in offsets.elements() {
                    tracing::debug!(
                        "committed offset {:?} on partition {} in topic {}",
                        element.offset(),
                        element.partition(),
                        element.topic()
                    );
                }
            }
            Err(err) => tracing::error!("error committing consumer offsets: {}", err),
        }
    }
}

/// Parameters needed to open an [`RdKafkaLogConsumer`] against a topic,
/// assigning this instance's deterministic share of its partitions.
#[derive(derive_builder::Builder, Clone)]
pub struct KafkaLogConsumerConfig {
    pub brokers: String,
    pub topic: String,
    pub group_id: String,
    #[builder(default = "1")]
    pub num_consumers: u32,
    #[builder(default)]
    pub consumer_index: u32,
    #[builder(default)]
    pub extra_properties: HashMap<String, String>,
}

impl KafkaLogConsumerConfig {
    pub fn builder() -> KafkaLogConsumerConfigBuilder {
        KafkaLogConsumerConfigBuilder::default()
    }
}

/// `LogConsumer` on top of a real Kafka-compatible broker.
pub struct RdKafkaLogConsumer {
    config: KafkaLogConsumerConfig,
    consumer: Option<Arc<StreamConsumer<KafkaContext>>>,
    receiver: Option<mpsc::Receiver<Record>>,
    assigned: Vec<i32>,
}

impl RdKafkaLogConsumer {
    pub fn new(config: KafkaLogConsumerConfig) -> Self {
        Self {
            config,
            consumer: None,
            receiver: None,
            assigned: Vec::new(),
        }
    }

    /// Deterministic modulo split of a topic's partitions across
    /// `num_consumers` peers, as the design calls for in place of
    /// broker-side consumer-group rebalancing across virtual consumers.
    fn partitions_for_index(all: &[i32], num_consumers: u32, consumer_index: u32) -> Vec<i32> {
        all.iter()
            .copied()
            .filter(|p| (*p as u32) % num_consumers.max(1) == consumer_index)
            .collect()
    }
}

#[async_trait]
impl LogConsumer for RdKafkaLogConsumer {
    async fn open(&mut self, starting_state: &ConsumerState) -> Result<()> {
        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", &self.config.brokers);
        client_config.set("group.id", &self.config.group_id);
        client_config.set("auto.offset.reset", "earliest");
        client_config.set("enable.auto.commit", "false");
        client_config.extend(self.config.extra_properties.clone());

        let consumer: StreamConsumer<KafkaContext> = client_config
            .set_log_level(RDKafkaLogLevel::Debug)
            .create_with_context(KafkaContext)
            .map_err(|err| Error::TransientIo(err.into()))?;

        let metadata = consumer
            .fetch_metadata(Some(&self.config.topic), Duration::from_secs(10))
            .map_err(|err| Error::TransientIo(err.into()))?;

        let all_partitions: Vec<i32> = metadata
            .topics()
            .first()
            .ok_or_else(|| Error::ProtocolMisuse(format!("unknown topic {}", self.config.topic)))?
            .partitions()
            .iter()
            .map(|p| p.id())
            .collect();

        let assigned = Self::partitions_for_index(
            &all_partitions,
            self.config.num_consumers,
            self.config.consumer_index,
        );

        let mut assignment = TopicPartitionList::with_capacity(assigned.len());
        for partition in &assigned {
            let part = Partition::new(self.config.topic.clone(), *partition);
            match starting_state.get(&part) {
                Some(offset) => assignment
                    .add_partition_offset(&self.config.topic, *partition, Offset::Offset(offset))
                    .map_err(|err| Error::TransientIo(err.into()))?,
                None => {
                    let _ = assignment.add_partition(&self.config.topic, *partition);
                }
            }
        }

        consumer
            .assign(&assignment)
            .map_err(|err| Error::TransientIo(err.into()))?;

        let consumer = Arc::new(consumer);
        let (sender, receiver) = mpsc::channel(1024);

        for partition in &assigned {
            let queue: StreamPartitionQueue<KafkaContext> = consumer
                .split_partition_queue(&self.config.topic, *partition)
                .ok_or_else(|| {
                    Error::ProtocolMisuse(format!("partition queue not available for {partition}"))
                })?;

            let task_consumer = Arc::clone(&consumer);
            let task_sender = sender.clone();
            tokio::spawn(async move {
                let result = queue
                    .stream()
                    .try_for_each(|borrowed| {
                        let task_sender = task_sender.clone();
                        let task_consumer = Arc::clone(&task_consumer);
                        async move {
                            let record = Record {
                                namespace: String::from(borrowed.topic()),
                                partition: borrowed.partition(),
                                offset: borrowed.offset(),
                                values: borrowed.payload().map(|p| p.to_vec()).unwrap_or_default(),
                            };

                            if let Err(err) = task_sender.send(record).await {
                                tracing::error!(
                                    "failed to forward record to engine channel: {}",
                                    err
                                );
                            }

                            drop(task_consumer);
                            Ok(())
                        }
                    })
                    .await;

                if let Err(err) = result {
                    tracing::error!("error during partition consumer task: {}", err);
                }
            });
        }

        // the main StreamConsumer must still be polled periodically for
        // rebalance/stats callbacks to fire, per rdkafka's docs, even with
        // every partition's queue split off.
        let keepalive_consumer = Arc::clone(&consumer);
        tokio::spawn(async move {
            loop {
                let _ = keepalive_consumer.recv().await;
            }
        });

        self.consumer = Some(consumer);
        self.receiver = Some(receiver);
        self.assigned = assigned;
        Ok(())
    }

    async fn next_record(&mut self) -> Result<Option<Record>> {
        let receiver = self
            .receiver
            .as_mut()
            .ok_or_else(|| Error::ProtocolMisuse("next_record called before open".into()))?;

        Ok(receiver.try_recv().ok())
    }

    async fn commit_offset(&mut self, partition: &Partition, offset: i64) -> Result<()> {
        let consumer = self
            .consumer
            .as_ref()
            .ok_or_else(|| Error::ProtocolMisuse("commit_offset called before open".into()))?;

        let mut tpl = TopicPartitionList::with_capacity(1);
        tpl.add_partition_offset(&partition.namespace, partition.partition, Offset::Offset(offset))
            .map_err(|err| Error::TransientIo(err.into()))?;

        consumer
            .commit(&tpl, rdkafka::consumer::CommitMode::Async)
            .map_err(|err| Error::TransientIo(err.into()))
    }

    async fn get_current_state(&self) -> Result<ConsumerState> {
        let consumer = self
            .consumer
            .as_ref()
            .ok_or_else(|| Error::ProtocolMisuse("get_current_state called before open".into()))?;

        let assignment = consumer
            .assignment()
            .map_err(|err| Error::TransientIo(err.into()))?;

        let committed = consumer
            .committed_offsets(assignment, Duration::from_secs(10))
            .map_err(|err| Error::TransientIo(err.into()))?;

        let mut state = ConsumerState::new();
        for element in committed.elements() {
            if let rdkafka::Offset::Offset(offset) = element.offset() {
                state.set(
                    Partition::new(element.topic(), element.partition()),
                    offset,
                );
            }
        }
        Ok(state)
    }

    async fn get_max_lag(&self) -> Result<i64> {
        let consumer = self
            .consumer
            .as_ref()
            .ok_or_else(|| Error::ProtocolMisuse("get_max_lag called before open".into()))?;

        let assignment = consumer
            .assignment()
            .map_err(|err| Error::TransientIo(err.into()))?;
        let committed = consumer
            .committed_offsets(assignment, Duration::from_secs(10))
            .map_err(|err| Error::TransientIo(err.into()))?;

        let mut committed_by_partition = HashMap::new();
        for element in committed.elements() {
            if let rdkafka::Offset::Offset(offset) = element.offset() {
                committed_by_partition.insert(
                    Partition::new(element.topic(), element.partition()),
                    offset,
                );
            }
        }

        let mut max_lag = 0i64;
        for partition in &self.assigned {
            let (low, high) = consumer
                .fetch_watermarks(&self.config.topic, *partition, Duration::from_secs(10))
                .map_err(|err| Error::TransientIo(err.into()))?;
            let _ = low;

            let key = Partition::new(self.config.topic.clone(), *partition);
            let committed_offset = committed_by_partition.get(&key).copied().unwrap_or(-1);
            max_lag = max_lag.max(high - committed_offset);
        }
        Ok(max_lag)
    }

    async fn unsubscribe_consumer_partition(&mut self, partition: &Partition) -> Result<()> {
        let consumer = self.consumer.as_ref().ok_or_else(|| {
            Error::ProtocolMisuse("unsubscribe_consumer_partition called before open".into())
        })?;

        let mut assignment = consumer
            .assignment()
            .map_err(|err| Error::TransientIo(err.into()))?;

        assignment.set_all_offsets(Offset::Invalid).ok();
        let remaining: Vec<_> = assignment
            .elements()
            .iter()
            .filter(|e| !(e.topic() == partition.namespace && e.partition() == partition.partition))
            .map(|e| (e.topic().to_string(), e.partition()))
            .collect();

        let mut new_assignment = TopicPartitionList::with_capacity(remaining.len());
        for (topic, part) in remaining {
            let _ = new_assignment.add_partition(&topic, part);
        }

        consumer
            .assign(&new_assignment)
            .map_err(|err| Error::TransientIo(err.into()))?;

        self.assigned.retain(|p| *p != partition.partition);
        tracing::info!(
            "unsubscribed partition {} on {}",
            partition.partition,
            partition.namespace
        );
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.consumer = None;
        self.receiver = None;
        Ok(())
    }
}
