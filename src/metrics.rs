//! Counters emitted for each virtual consumer. Named `<virtual_consumer_id>.<event>`
//! so a single process hosting several instances reports distinguishable
//! series, matching the naming the design calls for in place of reflection-based
//! metric registration.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::message::VirtualConsumerId;

/// Sink for the fixed set of counters the engine emits.
pub trait MetricsRecorder: Send + Sync {
    fn incr_filtered(&self, virtual_consumer_id: &VirtualConsumerId);
    fn incr_fail(&self, virtual_consumer_id: &VirtualConsumerId);
    fn incr_exceeded_retry_limit(&self, virtual_consumer_id: &VirtualConsumerId);
}

/// Logs each increment at `debug` via `tracing`, routing all diagnostic
/// output through `tracing` macros rather than println or a bespoke logger.
#[derive(Default)]
pub struct TracingMetricsRecorder;

impl MetricsRecorder for TracingMetricsRecorder {
    fn incr_filtered(&self, virtual_consumer_id: &VirtualConsumerId) {
        tracing::debug!(consumer = %virtual_consumer_id, "{}.filtered", virtual_consumer_id);
    }

    fn incr_fail(&self, virtual_consumer_id: &VirtualConsumerId) {
        tracing::debug!(consumer = %virtual_consumer_id, "{}.fail", virtual_consumer_id);
    }

    fn incr_exceeded_retry_limit(&self, virtual_consumer_id: &VirtualConsumerId) {
        tracing::warn!(
            consumer = %virtual_consumer_id,
            "{}.exceeded_retry_limit",
            virtual_consumer_id
        );
    }
}

/// Discards all counters. Default for tests that don't care about metrics.
#[derive(Default)]
pub struct NoopMetricsRecorder;

impl MetricsRecorder for NoopMetricsRecorder {
    fn incr_filtered(&self, _virtual_consumer_id: &VirtualConsumerId) {}
    fn incr_fail(&self, _virtual_consumer_id: &VirtualConsumerId) {}
    fn incr_exceeded_retry_limit(&self, _virtual_consumer_id: &VirtualConsumerId) {}
}

/// In-process counters, queryable by tests that need to assert on counts
/// rather than just on log output.
#[derive(Default)]
pub struct CountingMetricsRecorder {
    filtered: DashMap<VirtualConsumerId, AtomicU64>,
    fail: DashMap<VirtualConsumerId, AtomicU64>,
    exceeded_retry_limit: DashMap<VirtualConsumerId, AtomicU64>,
}

impl CountingMetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(map: &DashMap<VirtualConsumerId, AtomicU64>, id: &VirtualConsumerId) {
        map.entry(id.clone())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    fn read(map: &DashMap<VirtualConsumerId, AtomicU64>, id: &VirtualConsumerId) -> u64 {
        map.get(id).map(|v| v.load(Ordering::Relaxed)).unwrap_or(0)
    }

    pub fn filtered_count(&self, id: &VirtualConsumerId) -> u64 {
        Self::read(&self.filtered, id)
    }

    pub fn fail_count(&self, id: &VirtualConsumerId) -> u64 {
        Self::read(&self.fail, id)
    }

    pub fn exceeded_retry_limit_count(&self, id: &VirtualConsumerId) -> u64 {
        Self::read(&self.exceeded_retry_limit, id)
    }
}

impl MetricsRecorder for CountingMetricsRecorder {
    fn incr_filtered(&self, virtual_consumer_id: &VirtualConsumerId) {
        Self::bump(&self.filtered, virtual_consumer_id);
    }

    fn incr_fail(&self, virtual_consumer_id: &VirtualConsumerId) {
        Self::bump(&self.fail, virtual_consumer_id);
    }

    fn incr_exceeded_retry_limit(&self, virtual_consumer_id: &VirtualConsumerId) {
        Self::bump(&self.exceeded_retry_limit, virtual_consumer_id);
    }
}
