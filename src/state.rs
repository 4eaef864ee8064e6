//! Snapshot of committed or bounding offsets, keyed by (namespace, partition).
//!
//! Used in three roles: the *starting* bound (inclusive lower seek offset,
//! absent meaning seek to earliest/last-committed), the *ending* bound
//! (inclusive upper offset, absent meaning unbounded), and the live
//! *committed frontier* reported by the log consumer.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::message::Partition;

/// Mapping from (namespace, partition) to an offset.
///
/// The invariant from the design: the key set identifies the exact
/// partitions a virtual consumer subscribes to initially. When a partition
/// is unsubscribed mid-lifetime its entry is removed here (from the *live*
/// state) while it remains present in the *configured* ending bound, which
/// is a separate `ConsumerState` value entirely.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ConsumerState {
    offsets: HashMap<Partition, i64>,
}

impl ConsumerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_offsets(offsets: HashMap<Partition, i64>) -> Self {
        Self { offsets }
    }

    pub fn get(&self, partition: &Partition) -> Option<i64> {
        self.offsets.get(partition).copied()
    }

    pub fn set(&mut self, partition: Partition, offset: i64) {
        self.offsets.insert(partition, offset);
    }

    /// Removes a partition from the live state. Used when a partition is
    /// unsubscribed after its bounded range completes.
    pub fn remove(&mut self, partition: &Partition) -> Option<i64> {
        self.offsets.remove(partition)
    }

    pub fn partitions(&self) -> impl Iterator<Item = &Partition> {
        self.offsets.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Partition, &i64)> {
        self.offsets.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }
}

impl FromIterator<(Partition, i64)> for ConsumerState {
    fn from_iter<T: IntoIterator<Item = (Partition, i64)>>(iter: T) -> Self {
        Self {
            offsets: iter.into_iter().collect(),
        }
    }
}
