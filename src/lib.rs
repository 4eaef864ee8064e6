//! A sidelineable stream-consumption engine for partitioned, offset-addressed
//! logs: a virtual consumer instance that applies a filter chain, tracks
//! in-flight records, retries failures under a pluggable policy, and can be
//! bounded to a replay range that completes and unsubscribes on its own.

pub mod config;
pub mod deserializer;
pub mod error;
pub mod filter;
pub mod log_consumer;
pub mod message;
pub mod metrics;
pub mod persistence;
pub mod registry;
pub mod retry;
pub mod state;
pub mod virtual_consumer;

pub use error::{Error, Result};
pub use message::{Message, MessageId, Partition, Record, SidelineRequestId, VirtualConsumerId};
pub use state::ConsumerState;
pub use virtual_consumer::{VirtualConsumer, VirtualConsumerState};
