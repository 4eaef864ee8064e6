//! Orchestrates a single logical consumer against a partitioned log: the
//! `nextTuple`/`ack`/`fail` protocol, completion detection, and cooperative
//! stop signaling. This is the core the rest of the crate exists to support.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::deserializer::Deserializer;
use crate::error::{Error, Result};
use crate::filter::FilterChain;
use crate::log_consumer::LogConsumer;
use crate::message::{Message, MessageId, Partition, SidelineRequestId, VirtualConsumerId};
use crate::metrics::MetricsRecorder;
use crate::persistence::{PersistenceAdapter, StateKey};
use crate::retry::RetryPolicy;
use crate::state::ConsumerState;

/// Lifecycle states a [`VirtualConsumer`] moves through. `Opened` is
/// instantaneous inside `open()` itself — there is no separate
/// collaborator-instantiation phase to gate on since constructor injection
/// already built the collaborators — so the externally observable states
/// are `Created`, `Running`, `Completing`, and `Closed`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VirtualConsumerState {
    Created,
    Running,
    Completing,
    Closed,
}

/// Cooperative cancellation channel. Rust has no per-thread interrupt flag
/// to observe-and-clear the way the source system's `isStopRequested` does;
/// this is the direct analogue: an atomic flag plus a `Notify` so a task
/// blocked waiting on the next poll wakes promptly once stop is requested.
#[derive(Default)]
struct StopToken {
    requested: AtomicBool,
    notify: Notify,
}

impl StopToken {
    fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// A single logical consumer instance against a partitioned, offset-addressed
/// log. Owns its [`LogConsumer`] exclusively; `close` consumes `self` so a
/// use-after-close is a compile error rather than a runtime check.
pub struct VirtualConsumer<L: LogConsumer> {
    id: VirtualConsumerId,
    sideline_request_id: Option<SidelineRequestId>,
    log_consumer: L,
    filter_chain: FilterChain,
    retry_policy: Box<dyn RetryPolicy>,
    persistence_adapter: Box<dyn PersistenceAdapter>,
    metrics_recorder: Box<dyn MetricsRecorder>,
    deserializer: Box<dyn Deserializer>,
    in_flight: dashmap::DashMap<MessageId, Message>,
    state: VirtualConsumerState,
    starting_state: ConsumerState,
    ending_state: Option<ConsumerState>,
    completed: bool,
    stop_token: Arc<StopToken>,
    filters_applied: std::sync::atomic::AtomicU64,
}

impl<L: LogConsumer> VirtualConsumer<L> {
    /// Builds a not-yet-opened virtual consumer from its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: VirtualConsumerId,
        sideline_request_id: Option<SidelineRequestId>,
        log_consumer: L,
        filter_chain: FilterChain,
        retry_policy: Box<dyn RetryPolicy>,
        persistence_adapter: Box<dyn PersistenceAdapter>,
        metrics_recorder: Box<dyn MetricsRecorder>,
        deserializer: Box<dyn Deserializer>,
        starting_state: ConsumerState,
        ending_state: Option<ConsumerState>,
    ) -> Self {
        Self {
            id,
            sideline_request_id,
            log_consumer,
            filter_chain,
            retry_policy,
            persistence_adapter,
            metrics_recorder,
            deserializer,
            in_flight: dashmap::DashMap::new(),
            state: VirtualConsumerState::Created,
            starting_state,
            ending_state,
            completed: false,
            stop_token: Arc::new(StopToken::default()),
            filters_applied: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Opens the log consumer against this instance's starting state,
    /// preferring a previously persisted offset set if one exists. Fails
    /// with [`Error::ProtocolMisuse`] if already opened.
    pub async fn open(&mut self) -> Result<()> {
        if self.state != VirtualConsumerState::Created {
            return Err(Error::ProtocolMisuse(format!(
                "open called twice on virtual consumer {}",
                self.id
            )));
        }

        let persisted = self
            .persistence_adapter
            .get_state(&StateKey::Consumer(self.id.clone()))
            .await?;

        let effective_starting = persisted.unwrap_or_else(|| self.starting_state.clone());

        self.log_consumer.open(&effective_starting).await?;
        self.state = VirtualConsumerState::Running;
        tracing::info!(consumer = %self.id, "virtual consumer opened");
        Ok(())
    }

    /// Idempotent-on-state-machine close: if this instance completed, erases
    /// persisted consumer state (and clears the associated sideline request,
    /// if any); otherwise flushes current state so a restart resumes
    /// correctly. Takes `self` by value so a use-after-close is a compile
    /// error.
    pub async fn close(mut self) -> Result<()> {
        if self.completed {
            self.persistence_adapter
                .delete_state(&StateKey::Consumer(self.id.clone()))
                .await?;

            if let Some(sideline_request_id) = self.sideline_request_id.clone() {
                self.persistence_adapter
                    .delete_state(&StateKey::SidelineRequest(
                        self.id.clone(),
                        sideline_request_id,
                    ))
                    .await?;
            }
        } else {
            self.flush_state().await?;
        }

        self.log_consumer.close().await?;
        self.state = VirtualConsumerState::Closed;
        tracing::info!(consumer = %self.id, completed = self.completed, "virtual consumer closed");
        Ok(())
    }

    /// Pulls one emittable record, following the algorithm in order: retry
    /// queue first, then the log, applying the ending bound and filter
    /// chain before returning.
    pub async fn next_tuple(&mut self) -> Result<Option<Message>> {
        self.require_running_or_completing("next_tuple")?;

        if let Some(retry_id) = self.retry_policy.next_failed_message_to_retry().await {
            match self.in_flight.get(&retry_id) {
                Some(message) => return Ok(Some(message.clone())),
                None => {
                    tracing::warn!(id = %retry_id, "retry policy returned an id no longer in-flight");
                    self.retry_policy.acked(retry_id).await;
                }
            }
        }

        let Some(record) = self.log_consumer.next_record().await? else {
            return Ok(None);
        };

        let partition = record.partition_key();
        let message_id = MessageId::new(&record, self.id.clone());

        if let Some(ending) = &self.ending_state {
            let ending_offset = ending.get(&partition).ok_or_else(|| {
                Error::ProtocolMisuse(format!(
                    "log consumer produced partition {partition} outside the configured ending bound"
                ))
            })?;

            if record.offset > ending_offset {
                self.log_consumer
                    .unsubscribe_consumer_partition(&partition)
                    .await?;
                tracing::info!(consumer = %self.id, %partition, "ending bound reached, unsubscribed");
                return Ok(None);
            }
        }

        let values = self.deserializer.deserialize(&record).await?;
        let message = Message::new(message_id.clone(), values);

        if self.filter_chain.filter(&message) {
            self.filters_applied.fetch_add(1, Ordering::Relaxed);
            self.metrics_recorder.incr_filtered(&self.id);
            self.ack(&message_id).await?;
            return Ok(None);
        }

        self.in_flight.insert(message_id, message.clone());
        Ok(Some(message))
    }

    /// Commits the message's offset, removes it from the in-flight table,
    /// and informs the retry policy. Safe to call twice with the same id.
    pub async fn ack(&mut self, id: &MessageId) -> Result<()> {
        if id.virtual_consumer_id != self.id {
            return Err(Error::IllegalArgument(id.clone()));
        }

        self.log_consumer
            .commit_offset(&id.partition_key(), id.offset)
            .await?;
        self.in_flight.remove(id);
        self.retry_policy.acked(id.clone()).await;
        Ok(())
    }

    /// Routes a failure to the retry policy; terminal failures (retry
    /// budget exhausted) commit the offset and drop the in-flight entry the
    /// same way a successful ack would.
    pub async fn fail(&mut self, id: &MessageId) -> Result<()> {
        if id.virtual_consumer_id != self.id {
            return Err(Error::IllegalArgument(id.clone()));
        }

        if !self.retry_policy.retry_further(id).await {
            self.log_consumer
                .commit_offset(&id.partition_key(), id.offset)
                .await?;
            self.in_flight.remove(id);
            self.retry_policy.acked(id.clone()).await;
            self.metrics_recorder.incr_exceeded_retry_limit(&self.id);
            return Ok(());
        }

        self.retry_policy.failed(id.clone()).await;
        self.metrics_recorder.incr_fail(&self.id);
        Ok(())
    }

    /// Commits current state to persistence, then attempts completion.
    pub async fn flush_state(&mut self) -> Result<()> {
        let state = self.log_consumer.get_current_state().await?;
        self.persistence_adapter
            .put_state(&StateKey::Consumer(self.id.clone()), &state)
            .await?;
        self.attempt_to_complete().await
    }

    /// No-op unless an ending bound is configured and the in-flight table is
    /// empty. Otherwise unsubscribes every partition that has reached its
    /// ending offset, and — once all have — marks the instance completed
    /// and requests a stop.
    pub async fn attempt_to_complete(&mut self) -> Result<()> {
        let Some(ending) = self.ending_state.clone() else {
            return Ok(());
        };

        if !self.in_flight.is_empty() {
            return Ok(());
        }

        let committed = self.log_consumer.get_current_state().await?;

        let mut all_done = true;
        for (partition, committed_offset) in committed.iter() {
            let ending_offset = ending.get(partition).ok_or_else(|| {
                Error::ProtocolMisuse(format!(
                    "completion check found partition {partition} outside the configured ending bound"
                ))
            })?;

            if *committed_offset < ending_offset {
                all_done = false;
                continue;
            }

            self.log_consumer
                .unsubscribe_consumer_partition(partition)
                .await?;
        }

        if all_done {
            self.completed = true;
            self.state = VirtualConsumerState::Completing;
            self.request_stop();
            tracing::info!(consumer = %self.id, "virtual consumer completed");
        }

        Ok(())
    }

    /// Requests a cooperative stop. Valid from any state after `Created`;
    /// idempotent.
    pub fn request_stop(&self) {
        self.stop_token.request();
    }

    /// True once `request_stop` has been observed, from this or another
    /// thread holding a clone of the stop handle.
    pub fn is_stop_requested(&self) -> bool {
        self.stop_token.is_requested()
    }

    /// A clonable handle that lets another thread call `request_stop`
    /// without holding a reference to the whole instance.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            token: Arc::clone(&self.stop_token),
        }
    }

    pub async fn get_current_state(&self) -> Result<ConsumerState> {
        self.log_consumer.get_current_state().await
    }

    pub async fn get_max_lag(&self) -> Result<i64> {
        self.log_consumer.get_max_lag().await
    }

    pub fn get_number_of_filters_applied(&self) -> u64 {
        self.filters_applied.load(Ordering::Relaxed)
    }

    pub fn get_virtual_spout_id(&self) -> &VirtualConsumerId {
        &self.id
    }

    fn require_running_or_completing(&self, op: &str) -> Result<()> {
        match self.state {
            VirtualConsumerState::Running | VirtualConsumerState::Completing => Ok(()),
            _ => Err(Error::ProtocolMisuse(format!(
                "{op} called while virtual consumer {} is in state {:?}",
                self.id, self.state
            ))),
        }
    }
}

/// Handle letting a supervisor thread request a stop without a reference
/// into the owning [`VirtualConsumer`].
#[derive(Clone)]
pub struct StopHandle {
    token: Arc<StopToken>,
}

impl StopHandle {
    pub fn request_stop(&self) {
        self.token.request();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.token.is_requested()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deserializer::IdentityDeserializer;
    use crate::filter::PredicateFilterStep;
    use crate::message::Record;
    use crate::metrics::NoopMetricsRecorder;
    use crate::persistence::InMemoryPersistenceAdapter;
    use crate::retry::{FixedCountRetryPolicy, NeverRetryPolicy};
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// In-memory [`LogConsumer`] fake driven by a scripted queue of records
    /// per partition, with configurable watermarks for lag reporting.
    struct MockLogConsumer {
        queues: Mutex<HashMap<Partition, VecDeque<i64>>>,
        namespace: String,
        committed: Mutex<HashMap<Partition, i64>>,
        watermarks: HashMap<Partition, i64>,
        unsubscribed: Mutex<Vec<Partition>>,
        opened: Mutex<bool>,
    }

    impl MockLogConsumer {
        fn new(namespace: &str, offsets: HashMap<i32, Vec<i64>>) -> Self {
            let mut queues = HashMap::new();
            let mut watermarks = HashMap::new();
            for (partition, offsets) in offsets {
                let key = Partition::new(namespace, partition);
                watermarks.insert(key.clone(), offsets.iter().copied().max().unwrap_or(0));
                queues.insert(key, offsets.into_iter().collect());
            }

            Self {
                queues: Mutex::new(queues),
                namespace: namespace.to_string(),
                committed: Mutex::new(HashMap::new()),
                watermarks,
                unsubscribed: Mutex::new(Vec::new()),
                opened: Mutex::new(false),
            }
        }

        fn committed_offsets(&self) -> HashMap<Partition, i64> {
            self.committed.lock().unwrap().clone()
        }

        fn unsubscribed_partitions(&self) -> Vec<Partition> {
            self.unsubscribed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LogConsumer for MockLogConsumer {
        async fn open(&mut self, _starting_state: &ConsumerState) -> Result<()> {
            *self.opened.lock().unwrap() = true;
            Ok(())
        }

        async fn next_record(&mut self) -> Result<Option<Record>> {
            let mut queues = self.queues.lock().unwrap();
            for (partition, offsets) in queues.iter_mut() {
                if let Some(offset) = offsets.pop_front() {
                    return Ok(Some(Record {
                        namespace: partition.namespace.clone(),
                        partition: partition.partition,
                        offset,
                        values: format!("{{\"offset\":{offset}}}").into_bytes(),
                    }));
                }
            }
            Ok(None)
        }

        async fn commit_offset(&mut self, partition: &Partition, offset: i64) -> Result<()> {
            let mut committed = self.committed.lock().unwrap();
            let entry = committed.entry(partition.clone()).or_insert(-1);
            if offset > *entry {
                *entry = offset;
            }
            Ok(())
        }

        async fn get_current_state(&self) -> Result<ConsumerState> {
            Ok(self.committed_offsets().into_iter().collect())
        }

        async fn get_max_lag(&self) -> Result<i64> {
            let committed = self.committed.lock().unwrap();
            Ok(self
                .watermarks
                .iter()
                .map(|(p, high)| high - committed.get(p).copied().unwrap_or(-1))
                .max()
                .unwrap_or(0))
        }

        async fn unsubscribe_consumer_partition(&mut self, partition: &Partition) -> Result<()> {
            self.unsubscribed.lock().unwrap().push(partition.clone());
            self.queues.lock().unwrap().remove(partition);
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            let _ = &self.namespace;
            Ok(())
        }
    }

    fn build(
        log_consumer: MockLogConsumer,
        ending_state: Option<ConsumerState>,
        retry_policy: Box<dyn RetryPolicy>,
    ) -> VirtualConsumer<MockLogConsumer> {
        VirtualConsumer::new(
            VirtualConsumerId::new("vc-1"),
            None,
            log_consumer,
            FilterChain::new(),
            retry_policy,
            Box::new(InMemoryPersistenceAdapter::new()),
            Box::new(NoopMetricsRecorder),
            Box::new(IdentityDeserializer),
            ConsumerState::new(),
            ending_state,
        )
    }

    #[tokio::test]
    async fn firehose_emits_in_order_and_commits_highest_acked() {
        let log = MockLogConsumer::new("orders", HashMap::from([(0, vec![10, 11, 12])]));
        let mut vc = build(log, None, Box::new(NeverRetryPolicy));
        vc.open().await.unwrap();

        let mut seen = Vec::new();
        while let Some(message) = vc.next_tuple().await.unwrap() {
            seen.push(message.id.offset);
            vc.ack(&message.id).await.unwrap();
        }

        assert_eq!(seen, vec![10, 11, 12]);
        let state = vc.get_current_state().await.unwrap();
        assert_eq!(state.get(&Partition::new("orders", 0)), Some(12));
    }

    #[tokio::test]
    async fn filtered_record_commits_but_never_emits() {
        let log = MockLogConsumer::new("orders", HashMap::from([(0, vec![10, 11, 12])]));
        let mut vc = build(log, None, Box::new(NeverRetryPolicy));
        vc.filter_chain
            .push(Box::new(PredicateFilterStep::new(|m: &Message| {
                m.id.offset == 11
            })));
        vc.open().await.unwrap();

        let mut seen = Vec::new();
        loop {
            match vc.next_tuple().await.unwrap() {
                Some(message) => {
                    seen.push(message.id.offset);
                    vc.ack(&message.id).await.unwrap();
                }
                None => {
                    if vc.log_consumer.queues.lock().unwrap().values().all(|q| q.is_empty()) {
                        break;
                    }
                }
            }
        }

        assert_eq!(seen, vec![10, 12]);
        assert_eq!(vc.get_number_of_filters_applied(), 1);
        let state = vc.get_current_state().await.unwrap();
        assert!(state.get(&Partition::new("orders", 0)).unwrap() >= 12);
    }

    #[tokio::test]
    async fn bounded_range_completes_and_requests_stop() {
        let log = MockLogConsumer::new("orders", HashMap::from([(0, vec![5, 6, 7, 8, 9])]));
        let mut ending = ConsumerState::new();
        ending.set(Partition::new("orders", 0), 8);

        let mut vc = build(log, Some(ending), Box::new(NeverRetryPolicy));
        vc.open().await.unwrap();

        let mut seen = Vec::new();
        loop {
            match vc.next_tuple().await.unwrap() {
                Some(message) => {
                    seen.push(message.id.offset);
                    vc.ack(&message.id).await.unwrap();
                }
                None => break,
            }
        }

        assert_eq!(seen, vec![5, 6, 7, 8]);
        assert!(!vc.is_stop_requested());

        vc.flush_state().await.unwrap();
        assert!(vc.is_stop_requested());
        assert!(vc.completed);
    }

    #[tokio::test]
    async fn retry_then_succeed_replays_same_message_id() {
        let log = MockLogConsumer::new("orders", HashMap::from([(0, vec![42])]));
        let mut vc = build(log, None, Box::new(FixedCountRetryPolicy::new(2)));
        vc.open().await.unwrap();

        let first = vc.next_tuple().await.unwrap().unwrap();
        assert_eq!(first.id.offset, 42);
        vc.fail(&first.id).await.unwrap();

        assert!(vc.in_flight.contains_key(&first.id));

        let retried = vc.next_tuple().await.unwrap().unwrap();
        assert_eq!(retried.id, first.id);
        vc.ack(&retried.id).await.unwrap();

        assert!(vc.in_flight.is_empty());
        let state = vc.get_current_state().await.unwrap();
        assert_eq!(state.get(&Partition::new("orders", 0)), Some(42));
    }

    #[tokio::test]
    async fn retry_budget_exhausted_commits_and_counts() {
        let log = MockLogConsumer::new("orders", HashMap::from([(0, vec![42])]));
        let mut vc = build(log, None, Box::new(FixedCountRetryPolicy::new(0)));
        vc.open().await.unwrap();

        let first = vc.next_tuple().await.unwrap().unwrap();
        vc.fail(&first.id).await.unwrap();

        assert!(vc.in_flight.is_empty());
        let state = vc.get_current_state().await.unwrap();
        assert_eq!(state.get(&Partition::new("orders", 0)), Some(42));
    }

    #[tokio::test]
    async fn stop_requested_from_another_thread_is_observed() {
        let log = MockLogConsumer::new("orders", HashMap::from([(0, vec![])]));
        let mut vc = build(log, None, Box::new(NeverRetryPolicy));
        vc.open().await.unwrap();

        let handle = vc.stop_handle();
        assert!(!vc.is_stop_requested());

        let joined = tokio::spawn(async move {
            handle.request_stop();
        });
        joined.await.unwrap();

        assert!(vc.is_stop_requested());
    }

    #[tokio::test]
    async fn open_twice_is_protocol_misuse_and_state_is_unchanged() {
        let log = MockLogConsumer::new("orders", HashMap::from([(0, vec![1])]));
        let mut vc = build(log, None, Box::new(NeverRetryPolicy));
        vc.open().await.unwrap();

        let err = vc.open().await.unwrap_err();
        assert!(matches!(err, Error::ProtocolMisuse(_)));
        assert_eq!(vc.state, VirtualConsumerState::Running);
    }

    #[tokio::test]
    async fn ack_with_foreign_message_id_is_illegal_argument() {
        let log = MockLogConsumer::new("orders", HashMap::from([(0, vec![1])]));
        let mut vc = build(log, None, Box::new(NeverRetryPolicy));
        vc.open().await.unwrap();

        let foreign = MessageId {
            namespace: "orders".into(),
            partition: 0,
            offset: 1,
            virtual_consumer_id: VirtualConsumerId::new("someone-else"),
        };

        let err = vc.ack(&foreign).await.unwrap_err();
        assert!(matches!(err, Error::IllegalArgument(_)));
    }

    #[tokio::test]
    async fn acking_same_id_twice_is_a_no_op_second_time() {
        let log = MockLogConsumer::new("orders", HashMap::from([(0, vec![1])]));
        let mut vc = build(log, None, Box::new(NeverRetryPolicy));
        vc.open().await.unwrap();

        let message = vc.next_tuple().await.unwrap().unwrap();
        vc.ack(&message.id).await.unwrap();
        vc.ack(&message.id).await.unwrap();

        let state = vc.get_current_state().await.unwrap();
        assert_eq!(state.get(&Partition::new("orders", 0)), Some(1));
    }
}
