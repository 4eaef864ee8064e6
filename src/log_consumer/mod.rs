//! Abstraction over a partitioned, offset-addressed log.
//!
//! A [`VirtualConsumer`](crate::virtual_consumer::VirtualConsumer) never
//! talks to the log client directly; it drives an implementation of this
//! trait. This is the same collaborator boundary drawn around the Kafka
//! client in `kafka.rs`'s `Consumer`, generalized so a future implementation
//! could sit on a different log technology without touching the engine.

pub mod kafka;

use async_trait::async_trait;

use crate::message::{Partition, Record};
use crate::state::ConsumerState;

/// Driven by a [`crate::virtual_consumer::VirtualConsumer`] to read records,
/// commit progress, and manage partition subscriptions over the partitions'
/// lifetime.
#[async_trait]
pub trait LogConsumer: Send + Sync {
    /// Subscribes to the given partitions, seeking each to the offset named
    /// in `starting_state` (absent entries seek to the log's default, e.g.
    /// earliest or last committed).
    async fn open(&mut self, starting_state: &ConsumerState) -> crate::error::Result<()>;

    /// Returns the next available record across all subscribed partitions,
    /// or `None` if none is currently available (never blocks indefinitely).
    async fn next_record(&mut self) -> crate::error::Result<Option<Record>>;

    /// Commits `offset` (inclusive) as processed for `partition`.
    async fn commit_offset(
        &mut self,
        partition: &Partition,
        offset: i64,
    ) -> crate::error::Result<()>;

    /// Returns the most recently committed offsets across subscribed
    /// partitions.
    async fn get_current_state(&self) -> crate::error::Result<ConsumerState>;

    /// Returns the maximum, across subscribed partitions, of (partition's
    /// high watermark − committed offset). Zero if there are no subscribed
    /// partitions.
    async fn get_max_lag(&self) -> crate::error::Result<i64>;

    /// Stops consuming from a single partition, e.g. once its bounded
    /// ending offset has been reached, without disturbing the others.
    async fn unsubscribe_consumer_partition(
        &mut self,
        partition: &Partition,
    ) -> crate::error::Result<()>;

    /// Releases all underlying resources. No further calls are made after
    /// this returns.
    async fn close(&mut self) -> crate::error::Result<()>;
}
