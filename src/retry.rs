//! Pluggable retry strategy for failed messages.
//!
//! Mirrors the `SchemaClient` collaborator-trait pattern (`kafka/schema.rs`):
//! an `#[async_trait]` interface with a handful of concrete implementations
//! selected by configuration, each owning whatever state it needs to decide
//! when (or whether) a failed message comes back around.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::message::MessageId;

/// Decides whether, and when, a failed message should be retried.
///
/// Implementations track their own per-message bookkeeping. `failed` and
/// `acked` are called exactly once per message outcome; `next_failed_message_to_retry`
/// is polled by the virtual consumer's main loop to find work that has
/// become eligible.
#[async_trait]
pub trait RetryPolicy: Send + Sync {
    /// Records that `id` failed processing and should be considered for
    /// retry (or abandoned, at the policy's discretion).
    async fn failed(&self, id: MessageId);

    /// Records that `id` was eventually acked; clears any retry bookkeeping.
    async fn acked(&self, id: MessageId);

    /// Returns true if `id` is still eligible for another retry attempt.
    /// Called with the bookkeeping from `id`'s *prior* failures only — the
    /// caller asks this before telling the policy about the failure in
    /// hand, per the failed-message protocol: check first, then record. A
    /// policy that has exhausted its budget for `id` returns false, which
    /// the virtual consumer treats as a terminal failure: the message is
    /// dropped and the exceeded-retry-limit counter is incremented.
    async fn retry_further(&self, id: &MessageId) -> bool;

    /// Returns the next previously-failed id that has become eligible to be
    /// retried right now, if any. Called once per poll iteration.
    async fn next_failed_message_to_retry(&self) -> Option<MessageId>;
}

/// Never retries; the first failure is terminal.
#[derive(Default)]
pub struct NeverRetryPolicy;

#[async_trait]
impl RetryPolicy for NeverRetryPolicy {
    async fn failed(&self, _id: MessageId) {}

    async fn acked(&self, _id: MessageId) {}

    async fn retry_further(&self, _id: &MessageId) -> bool {
        false
    }

    async fn next_failed_message_to_retry(&self) -> Option<MessageId> {
        None
    }
}

/// Retries up to a fixed number of attempts, replaying failed messages
/// immediately (no backoff).
pub struct FixedCountRetryPolicy {
    max_retries: u32,
    attempts: DashMap<MessageId, u32>,
    pending: DashMap<MessageId, ()>,
}

impl FixedCountRetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            attempts: DashMap::new(),
            pending: DashMap::new(),
        }
    }
}

#[async_trait]
impl RetryPolicy for FixedCountRetryPolicy {
    async fn failed(&self, id: MessageId) {
        let attempts = {
            let mut entry = self.attempts.entry(id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        if attempts <= self.max_retries {
            self.pending.insert(id, ());
        }
    }

    async fn acked(&self, id: MessageId) {
        self.attempts.remove(&id);
        self.pending.remove(&id);
    }

    async fn retry_further(&self, id: &MessageId) -> bool {
        let attempts_so_far = self.attempts.get(id).map(|a| *a).unwrap_or(0);
        attempts_so_far < self.max_retries
    }

    async fn next_failed_message_to_retry(&self) -> Option<MessageId> {
        let next = self.pending.iter().next().map(|entry| entry.key().clone());
        if let Some(id) = &next {
            self.pending.remove(id);
        }
        next
    }
}

/// Retries with exponentially increasing delay between attempts, up to a
/// fixed attempt ceiling.
pub struct ExponentialBackoffRetryPolicy {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    attempts: DashMap<MessageId, u32>,
    eligible_at: DashMap<MessageId, DateTime<Utc>>,
    clock_offset_ms: AtomicI64,
}

impl ExponentialBackoffRetryPolicy {
    pub fn new(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            attempts: DashMap::new(),
            eligible_at: DashMap::new(),
            clock_offset_ms: AtomicI64::new(0),
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let scale = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let millis = self
            .initial_delay
            .as_millis()
            .saturating_mul(scale as u128)
            .min(self.max_delay.as_millis());
        Duration::from_millis(millis as u64)
    }

    /// Test seam: lets unit tests simulate the passage of time without
    /// sleeping, by nudging what `now()` reports.
    #[cfg(test)]
    fn advance_clock(&self, by: Duration) {
        self.clock_offset_ms
            .fetch_add(by.as_millis() as i64, Ordering::Relaxed);
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::milliseconds(self.clock_offset_ms.load(Ordering::Relaxed))
    }
}

#[async_trait]
impl RetryPolicy for ExponentialBackoffRetryPolicy {
    async fn failed(&self, id: MessageId) {
        let attempt = {
            let mut entry = self.attempts.entry(id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        if attempt > self.max_retries {
            self.eligible_at.remove(&id);
            return;
        }

        let eligible = self.now() + chrono::Duration::from_std(self.delay_for(attempt)).unwrap();
        self.eligible_at.insert(id, eligible);
    }

    async fn acked(&self, id: MessageId) {
        self.attempts.remove(&id);
        self.eligible_at.remove(&id);
    }

    async fn retry_further(&self, id: &MessageId) -> bool {
        let attempts_so_far = self.attempts.get(id).map(|a| *a).unwrap_or(0);
        attempts_so_far < self.max_retries
    }

    async fn next_failed_message_to_retry(&self) -> Option<MessageId> {
        let now = self.now();
        let ready = self
            .eligible_at
            .iter()
            .find(|entry| *entry.value() <= now)
            .map(|entry| entry.key().clone());

        if let Some(id) = &ready {
            self.eligible_at.remove(id);
        }
        ready
    }
}

/// Per-message retry counts, exposed for a persistence adapter or metrics
/// recorder that wants a snapshot rather than going through the trait.
pub fn snapshot_attempts(attempts: &DashMap<MessageId, u32>) -> HashMap<MessageId, u32> {
    attempts
        .iter()
        .map(|entry| (entry.key().clone(), *entry.value()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::VirtualConsumerId;

    fn id(offset: i64) -> MessageId {
        MessageId {
            namespace: "orders".into(),
            partition: 0,
            offset,
            virtual_consumer_id: VirtualConsumerId::new("vc-1"),
        }
    }

    #[tokio::test]
    async fn never_retry_is_terminal_on_first_failure() {
        let policy = NeverRetryPolicy;
        let message = id(1);
        policy.failed(message.clone()).await;
        assert!(!policy.retry_further(&message).await);
        assert!(policy.next_failed_message_to_retry().await.is_none());
    }

    #[tokio::test]
    async fn fixed_count_allows_retries_up_to_budget() {
        // Mirrors the check-before-record protocol `VirtualConsumer::fail`
        // actually uses: `retry_further` is asked about a failure before
        // `failed` records it.
        let policy = FixedCountRetryPolicy::new(2);
        let message = id(1);

        assert!(policy.retry_further(&message).await);
        policy.failed(message.clone()).await;
        assert_eq!(
            policy.next_failed_message_to_retry().await,
            Some(message.clone())
        );

        assert!(policy.retry_further(&message).await);
        policy.failed(message.clone()).await;

        assert!(!policy.retry_further(&message).await);
    }

    #[tokio::test]
    async fn fixed_count_acked_clears_bookkeeping() {
        let policy = FixedCountRetryPolicy::new(3);
        let message = id(1);
        policy.failed(message.clone()).await;
        policy.acked(message.clone()).await;
        assert!(policy.retry_further(&message).await);
        assert!(policy.next_failed_message_to_retry().await.is_none());
    }

    #[tokio::test]
    async fn exponential_backoff_delays_eligibility() {
        let policy = ExponentialBackoffRetryPolicy::new(
            3,
            Duration::from_millis(100),
            Duration::from_secs(10),
        );
        let message = id(1);
        policy.failed(message.clone()).await;

        assert!(policy.next_failed_message_to_retry().await.is_none());

        policy.advance_clock(Duration::from_millis(150));
        assert_eq!(
            policy.next_failed_message_to_retry().await,
            Some(message.clone())
        );
    }

    #[tokio::test]
    async fn exponential_backoff_exhausts_after_max_retries() {
        let policy = ExponentialBackoffRetryPolicy::new(
            1,
            Duration::from_millis(10),
            Duration::from_secs(1),
        );
        let message = id(1);

        assert!(policy.retry_further(&message).await);
        policy.failed(message.clone()).await;

        assert!(!policy.retry_further(&message).await);
    }
}
