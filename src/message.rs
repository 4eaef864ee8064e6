//! Core data model: records pulled from the log, the identifiers used to
//! track them in flight, and the messages handed downstream.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Non-empty string that uniquely identifies a virtual consumer within the
/// enclosing system. Never mutated after it is set on `open`.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct VirtualConsumerId(String);

impl VirtualConsumerId {
    /// Creates a new [`VirtualConsumerId`].
    ///
    /// # Panics
    ///
    /// Panics if `id` is empty; an empty id is a caller bug, not a runtime
    /// condition to recover from.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        assert!(!id.is_empty(), "virtual consumer id must not be empty");
        Self(id)
    }
}

impl AsRef<str> for VirtualConsumerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for VirtualConsumerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque token associated with a bounded replay; if present when a virtual
/// consumer completes, the persistence adapter is instructed to clear that
/// request's stored offsets.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct SidelineRequestId(String);

impl SidelineRequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl AsRef<str> for SidelineRequestId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for SidelineRequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A namespace (topic) and partition pair; the unit that a [`crate::state::ConsumerState`]
/// maps to an offset.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Partition {
    pub namespace: String,
    pub partition: i32,
}

impl Partition {
    pub fn new(namespace: impl Into<String>, partition: i32) -> Self {
        Self {
            namespace: namespace.into(),
            partition,
        }
    }
}

impl Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.namespace, self.partition)
    }
}

/// A record pulled from the log. Immutable once produced by a
/// [`crate::log_consumer::LogConsumer`].
#[derive(Clone, Debug)]
pub struct Record {
    pub namespace: String,
    pub partition: i32,
    pub offset: i64,
    pub values: Vec<u8>,
}

impl Record {
    pub fn partition_key(&self) -> Partition {
        Partition::new(self.namespace.clone(), self.partition)
    }
}

/// Immutable tuple used as the in-flight key and ack/fail token. Equality and
/// hash cover all four fields.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct MessageId {
    pub namespace: String,
    pub partition: i32,
    pub offset: i64,
    pub virtual_consumer_id: VirtualConsumerId,
}

impl MessageId {
    pub fn new(record: &Record, virtual_consumer_id: VirtualConsumerId) -> Self {
        Self {
            namespace: record.namespace.clone(),
            partition: record.partition,
            offset: record.offset,
            virtual_consumer_id,
        }
    }

    pub fn partition_key(&self) -> Partition {
        Partition::new(self.namespace.clone(), self.partition)
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}@{}",
            self.namespace, self.partition, self.offset, self.virtual_consumer_id
        )
    }
}

/// The unit emitted downstream. Owned by the virtual consumer's in-flight
/// table until `ack`/terminal `fail` resolves it.
#[derive(Clone, Debug)]
pub struct Message {
    pub id: MessageId,
    pub values: Vec<u8>,
}

impl Message {
    pub fn new(id: MessageId, values: Vec<u8>) -> Self {
        Self { id, values }
    }
}
