//! Consumer-group membership over librdkafka.
//!
//! Each [`join`](ConsumerGroup::join) creates a `BaseConsumer` driven by a
//! dedicated OS thread. librdkafka runs rebalance callbacks on the thread that
//! polls, so blocking that thread is how a revocation waits for the worker:
//!
//! ```text
//!  driver thread                         worker task
//!  ─────────────                         ───────────
//!  poll() ─► message ─► partition feed ─► PartitionStream
//!  poll() ─► pre_rebalance(Revoke)
//!              send Revoked { ack } ───► stop task, flush commit
//!              block on ack        ◄──── ack.complete()
//!            return ─► group rebalances
//!  poll() ─► post_rebalance(Assign)
//!              send Assigned { stream } ─► spawn task
//! ```
//!
//! Feeds are bounded. A partition whose consumer falls behind is paused
//! until its backlog drains, so one slow partition never stalls the others.

use crate::error::map_kafka_error;
use beacon_core::log::{
    ConsumerGroup, GroupMembership, LogCoordinates, LogError, LogMessage, MemberHandle,
    MembershipEvent, PartitionStream, RevocationAck, TopicPartition,
};
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc as std_mpsc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Default per-partition feed capacity.
pub const DEFAULT_BUFFER_SIZE: usize = 256;

/// Default session timeout, matching the worker's default.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default broker heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

static NEXT_MEMBER: AtomicU64 = AtomicU64::new(0);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A Kafka consumer group.
///
/// # Example
///
/// ```no_run
/// use beacon_redpanda::RedpandaConsumerGroup;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), beacon_core::LogError> {
/// let group = RedpandaConsumerGroup::builder()
///     .brokers("kafka-1:9092")
///     .group_id("analytics-group")
///     .session_timeout(Duration::from_secs(30))
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RedpandaConsumerGroup {
    brokers: String,
    group_id: String,
    session_timeout: Duration,
    heartbeat_interval: Duration,
    auto_offset_reset: String,
    buffer_size: usize,
    revoke_timeout: Duration,
    request_timeout: Duration,
}

impl RedpandaConsumerGroup {
    /// Start a builder.
    #[must_use]
    pub fn builder() -> RedpandaConsumerGroupBuilder {
        RedpandaConsumerGroupBuilder::new()
    }

    /// Session timeout reported to the coordinator.
    #[must_use]
    pub const fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    fn client_config(&self, member_id: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            .set("client.id", member_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set("session.timeout.ms", self.session_timeout.as_millis().to_string())
            .set("heartbeat.interval.ms", self.heartbeat_interval.as_millis().to_string())
            .set("partition.assignment.strategy", "range");
        config
    }
}

impl ConsumerGroup for RedpandaConsumerGroup {
    fn group_id(&self) -> &str {
        &self.group_id
    }

    fn join<'a>(
        &'a self,
        topics: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn GroupMembership>, LogError>> + Send + 'a>>
    {
        Box::pin(async move {
            let member_id = format!(
                "{}-{}-{}",
                self.group_id,
                std::process::id(),
                NEXT_MEMBER.fetch_add(1, Ordering::Relaxed)
            );
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let context = GroupContext {
                member_id: member_id.clone(),
                events: events_tx,
                feeds: Mutex::new(HashMap::new()),
                owned: Mutex::new(HashSet::new()),
                fault: Mutex::new(None),
                closed: AtomicBool::new(false),
                last_poll: Mutex::new(Instant::now()),
                buffer_size: self.buffer_size,
                revoke_timeout: self.revoke_timeout,
                request_timeout: self.request_timeout,
            };

            let consumer: BaseConsumer<GroupContext> = self
                .client_config(&member_id)
                .create_with_context(context)
                .map_err(|e| LogError::Transport(format!("Failed to create consumer: {e}")))?;
            let consumer = Arc::new(consumer);

            // Reach the cluster before subscribing so join fails like a connect.
            let probe = Arc::clone(&consumer);
            let timeout = self.request_timeout;
            tokio::task::spawn_blocking(move || {
                probe
                    .fetch_metadata(None, Timeout::After(timeout))
                    .map(|_| ())
                    .map_err(|e| map_kafka_error(&e, timeout))
            })
            .await
            .map_err(|e| LogError::Transport(format!("Metadata probe aborted: {e}")))??;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| map_kafka_error(&e, timeout))?;

            let driver = Arc::clone(&consumer);
            let thread = std::thread::Builder::new()
                .name(format!("beacon-consumer-{member_id}"))
                .spawn(move || drive(&driver))
                .map_err(|e| LogError::Transport(format!("Failed to start consumer thread: {e}")))?;

            tracing::info!(
                group_id = %self.group_id,
                member_id = %member_id,
                topics = ?topics,
                "Joined consumer group"
            );

            let membership: Box<dyn GroupMembership> = Box::new(RedpandaMembership {
                member_id,
                events: events_rx,
                handle: Arc::new(RedpandaMemberHandle { consumer }),
                driver: Some(thread),
            });
            Ok(membership)
        })
    }
}

/// Builder for [`RedpandaConsumerGroup`].
#[derive(Debug, Clone)]
pub struct RedpandaConsumerGroupBuilder {
    brokers: Option<String>,
    group_id: Option<String>,
    session_timeout: Duration,
    heartbeat_interval: Duration,
    auto_offset_reset: String,
    buffer_size: usize,
    revoke_timeout: Option<Duration>,
    request_timeout: Duration,
}

impl RedpandaConsumerGroupBuilder {
    fn new() -> Self {
        Self {
            brokers: None,
            group_id: None,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            auto_offset_reset: "earliest".to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            revoke_timeout: None,
            request_timeout: crate::producer::DEFAULT_TIMEOUT,
        }
    }

    /// Comma-separated bootstrap servers. Required.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Consumer group id. Required.
    #[must_use]
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// How long the coordinator waits for heartbeats before expiring a member.
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Protocol heartbeat interval sent by librdkafka's background thread.
    #[must_use]
    pub const fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Where a group with no checkpoint starts: `"earliest"` (default) or
    /// `"latest"`.
    #[must_use]
    pub fn auto_offset_reset(mut self, reset: impl Into<String>) -> Self {
        self.auto_offset_reset = reset.into();
        self
    }

    /// Messages buffered per partition before it is paused.
    #[must_use]
    pub const fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Longest a revocation waits for the worker's ack. Defaults to the
    /// session timeout.
    #[must_use]
    pub const fn revoke_timeout(mut self, timeout: Duration) -> Self {
        self.revoke_timeout = Some(timeout);
        self
    }

    /// Deadline for metadata probes and synchronous commits.
    #[must_use]
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Validate the settings.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::NotConnected`] without brokers and
    /// [`LogError::Transport`] for an empty group id or zero buffer.
    pub fn build(self) -> Result<RedpandaConsumerGroup, LogError> {
        let brokers = self
            .brokers
            .filter(|b| !b.trim().is_empty())
            .ok_or(LogError::NotConnected)?;
        let group_id = self
            .group_id
            .filter(|g| !g.trim().is_empty())
            .ok_or_else(|| LogError::Transport("Consumer group id is required".to_string()))?;
        if self.buffer_size == 0 {
            return Err(LogError::Transport("Buffer size must be positive".to_string()));
        }

        Ok(RedpandaConsumerGroup {
            brokers,
            group_id,
            session_timeout: self.session_timeout,
            heartbeat_interval: self.heartbeat_interval,
            auto_offset_reset: self.auto_offset_reset,
            buffer_size: self.buffer_size,
            revoke_timeout: self.revoke_timeout.unwrap_or(self.session_timeout),
            request_timeout: self.request_timeout,
        })
    }
}

/// Bounded channel into one partition's stream, plus what did not fit.
struct Feed {
    sender: mpsc::Sender<LogMessage>,
    backlog: VecDeque<LogMessage>,
    paused: bool,
}

impl Feed {
    /// Move backlog into the channel. Returns `true` once the backlog is empty.
    fn drain(&mut self) -> bool {
        while let Some(message) = self.backlog.pop_front() {
            match self.sender.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(message)) => {
                    self.backlog.push_front(message);
                    return false;
                }
                Err(TrySendError::Closed(_)) => {
                    self.backlog.clear();
                }
            }
        }
        true
    }
}

/// State shared by the driver thread, rebalance callbacks and member handles.
struct GroupContext {
    member_id: String,
    events: mpsc::UnboundedSender<Result<MembershipEvent, LogError>>,
    feeds: Mutex<HashMap<TopicPartition, Feed>>,
    owned: Mutex<HashSet<TopicPartition>>,
    fault: Mutex<Option<LogError>>,
    closed: AtomicBool,
    last_poll: Mutex<Instant>,
    buffer_size: usize,
    revoke_timeout: Duration,
    request_timeout: Duration,
}

impl GroupContext {
    fn owns(&self, partition: &TopicPartition) -> bool {
        lock(&self.owned).contains(partition)
    }

    fn set_fault(&self, error: LogError) {
        *lock(&self.fault) = Some(error);
    }

    fn clear_fault(&self) {
        *lock(&self.fault) = None;
    }

    fn deliver(&self, consumer: &BaseConsumer<Self>, message: LogMessage) {
        let partition = message.coordinates.topic_partition();
        let mut feeds = lock(&self.feeds);
        let Some(feed) = feeds.get_mut(&partition) else {
            tracing::debug!(
                coordinates = %message.coordinates,
                "Dropping message for a partition that is not assigned"
            );
            return;
        };
        feed.backlog.push_back(message);
        if !feed.drain() && !feed.paused {
            set_paused(consumer, &partition, true);
            feed.paused = true;
        }
    }

    fn drain_backlogs(&self, consumer: &BaseConsumer<Self>) {
        let mut feeds = lock(&self.feeds);
        for (partition, feed) in feeds.iter_mut() {
            if feed.paused && feed.drain() {
                set_paused(consumer, partition, false);
                feed.paused = false;
            }
        }
    }

    fn assign(&self, partitions: Vec<TopicPartition>) {
        let mut feeds = lock(&self.feeds);
        let mut owned = lock(&self.owned);
        for partition in partitions {
            let (sender, receiver) = mpsc::channel(self.buffer_size);
            feeds.insert(
                partition.clone(),
                Feed {
                    sender,
                    backlog: VecDeque::new(),
                    paused: false,
                },
            );
            owned.insert(partition.clone());
            tracing::info!(member_id = %self.member_id, partition = %partition, "Partition assigned");
            let event = MembershipEvent::Assigned {
                partition,
                messages: partition_stream(receiver),
            };
            if self.events.send(Ok(event)).is_err() {
                tracing::debug!("Membership dropped, assignment ignored");
            }
        }
    }

    /// Hand each revoked partition to the worker and block until all acks are
    /// released or the revoke timeout passes.
    fn revoke(&self, partitions: Vec<TopicPartition>) {
        if partitions.is_empty() {
            return;
        }
        let (released_tx, released_rx) = std_mpsc::channel();
        for partition in &partitions {
            let released = released_tx.clone();
            let ack = RevocationAck::new(move || {
                let _ = released.send(());
            });
            // A closed receiver drops the ack, which releases at once.
            let _ = self.events.send(Ok(MembershipEvent::Revoked {
                partition: partition.clone(),
                ack,
            }));
        }
        drop(released_tx);

        let deadline = Instant::now() + self.revoke_timeout;
        let mut released = 0;
        while released < partitions.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match released_rx.recv_timeout(remaining) {
                Ok(()) => released += 1,
                Err(std_mpsc::RecvTimeoutError::Timeout) => {
                    tracing::error!(
                        member_id = %self.member_id,
                        pending = partitions.len() - released,
                        timeout = ?self.revoke_timeout,
                        "Revocation not acknowledged in time, releasing partitions"
                    );
                    break;
                }
                Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        let mut feeds = lock(&self.feeds);
        let mut owned = lock(&self.owned);
        for partition in &partitions {
            feeds.remove(partition);
            owned.remove(partition);
            tracing::info!(member_id = %self.member_id, partition = %partition, "Partition revoked");
        }
    }
}

impl ClientContext for GroupContext {
    fn error(&self, error: KafkaError, reason: &str) {
        let mapped = map_kafka_error(&error, self.request_timeout);
        tracing::warn!(member_id = %self.member_id, error = %error, reason, "Consumer client error");
        if mapped.is_connection() || matches!(mapped, LogError::MembershipLost(_)) {
            self.set_fault(mapped);
        }
    }
}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(list) => self.revoke(partitions_of(list)),
            Rebalance::Assign(_) => {}
            Rebalance::Error(error) => {
                tracing::warn!(member_id = %self.member_id, error = %error, "Rebalance failed");
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(list) = rebalance {
            self.clear_fault();
            self.assign(partitions_of(list));
        }
    }
}

fn partitions_of(list: &TopicPartitionList) -> Vec<TopicPartition> {
    list.elements()
        .iter()
        .map(|element| TopicPartition::new(element.topic(), element.partition()))
        .collect()
}

fn set_paused(consumer: &BaseConsumer<GroupContext>, partition: &TopicPartition, paused: bool) {
    let mut list = TopicPartitionList::new();
    list.add_partition(&partition.topic, partition.partition);
    let result = if paused {
        consumer.pause(&list)
    } else {
        consumer.resume(&list)
    };
    match result {
        Ok(()) => tracing::debug!(partition = %partition, paused, "Partition flow changed"),
        Err(error) => tracing::warn!(partition = %partition, error = %error, "Pause/resume failed"),
    }
}

fn partition_stream(mut receiver: mpsc::Receiver<LogMessage>) -> PartitionStream {
    Box::pin(async_stream::stream! {
        while let Some(message) = receiver.recv().await {
            yield Ok::<_, LogError>(message);
        }
    })
}

/// Poll loop of one membership. Runs until the membership is dropped or left.
fn drive(consumer: &BaseConsumer<GroupContext>) {
    let context = consumer.context();
    while !context.closed.load(Ordering::Acquire) && !context.events.is_closed() {
        context.drain_backlogs(consumer);
        let polled = consumer.poll(POLL_INTERVAL);
        *lock(&context.last_poll) = Instant::now();
        match polled {
            None => {}
            Some(Ok(message)) => {
                context.clear_fault();
                let message = LogMessage {
                    coordinates: LogCoordinates::new(
                        message.topic(),
                        message.partition(),
                        message.offset(),
                    ),
                    key: message.key().map(<[u8]>::to_vec),
                    payload: message.payload().map(<[u8]>::to_vec),
                };
                context.deliver(consumer, message);
            }
            Some(Err(error)) => {
                let mapped = map_kafka_error(&error, context.request_timeout);
                tracing::warn!(member_id = %context.member_id, error = %error, "Poll failed");
                context.set_fault(mapped);
            }
        }
    }

    // Leaving revokes through the usual callback; keep polling until it ran.
    consumer.unsubscribe();
    let deadline = Instant::now() + context.revoke_timeout;
    while Instant::now() < deadline {
        let _ = consumer.poll(POLL_INTERVAL);
        match consumer.assignment() {
            Ok(assignment) if assignment.count() > 0 => {}
            _ => break,
        }
    }
    context.closed.store(true, Ordering::Release);
    tracing::info!(member_id = %context.member_id, "Consumer loop stopped");
}

/// One live membership of a [`RedpandaConsumerGroup`].
struct RedpandaMembership {
    member_id: String,
    events: mpsc::UnboundedReceiver<Result<MembershipEvent, LogError>>,
    handle: Arc<RedpandaMemberHandle>,
    driver: Option<JoinHandle<()>>,
}

impl GroupMembership for RedpandaMembership {
    fn member_id(&self) -> &str {
        &self.member_id
    }

    fn next_event(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Option<Result<MembershipEvent, LogError>>> + Send + '_>>
    {
        Box::pin(self.events.recv())
    }

    fn handle(&self) -> Arc<dyn MemberHandle> {
        self.handle.clone()
    }

    fn leave(mut self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), LogError>> + Send>> {
        Box::pin(async move {
            self.handle.consumer.context().closed.store(true, Ordering::Release);
            // Revocations raised while leaving are released by dropping them.
            self.events.close();
            while let Ok(event) = self.events.try_recv() {
                drop(event);
            }
            if let Some(driver) = self.driver.take() {
                tokio::task::spawn_blocking(move || driver.join())
                    .await
                    .map_err(|e| LogError::Transport(format!("Leave aborted: {e}")))?
                    .map_err(|_| LogError::Transport("Consumer thread panicked".to_string()))?;
            }
            tracing::info!(member_id = %self.member_id, "Left consumer group");
            Ok(())
        })
    }
}

impl Drop for RedpandaMembership {
    fn drop(&mut self) {
        self.handle
            .consumer
            .context()
            .closed
            .store(true, Ordering::Release);
    }
}

/// Commits and liveness checks for a [`RedpandaMembership`].
struct RedpandaMemberHandle {
    consumer: Arc<BaseConsumer<GroupContext>>,
}

impl MemberHandle for RedpandaMemberHandle {
    fn commit<'a>(
        &'a self,
        partition: &'a TopicPartition,
        next_offset: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), LogError>> + Send + 'a>> {
        Box::pin(async move {
            let context = self.consumer.context();
            if !context.owns(partition) {
                return Err(LogError::NotOwner(partition.clone()));
            }
            let timeout = context.request_timeout;
            let mut list = TopicPartitionList::new();
            list.add_partition_offset(
                &partition.topic,
                partition.partition,
                Offset::Offset(next_offset),
            )
            .map_err(|e| map_kafka_error(&e, timeout))?;

            let consumer = Arc::clone(&self.consumer);
            tokio::task::spawn_blocking(move || consumer.commit(&list, CommitMode::Sync))
                .await
                .map_err(|e| LogError::Transport(format!("Commit aborted: {e}")))?
                .map_err(|e| map_kafka_error(&e, timeout))?;
            tracing::debug!(partition = %partition, next_offset, "Checkpoint committed");
            Ok(())
        })
    }

    fn heartbeat(&self) -> Pin<Box<dyn Future<Output = Result<(), LogError>> + Send + '_>> {
        Box::pin(async move {
            let context = self.consumer.context();
            if context.closed.load(Ordering::Acquire) {
                return Err(LogError::NotConnected);
            }
            // librdkafka heartbeats in the background; what can die here is
            // the poll loop, and a stalled loop gets the member expired.
            let since_poll = lock(&context.last_poll).elapsed();
            if since_poll > context.revoke_timeout {
                return Err(LogError::MembershipLost(format!(
                    "Consumer loop stalled for {since_poll:?}"
                )));
            }
            let fault = lock(&context.fault).clone();
            match fault {
                None => Ok(()),
                Some(LogError::MembershipLost(reason)) => Err(LogError::MembershipLost(reason)),
                Some(_) => {
                    let consumer = Arc::clone(&self.consumer);
                    let timeout = context.request_timeout;
                    tokio::task::spawn_blocking(move || {
                        consumer
                            .fetch_metadata(None, Timeout::After(timeout))
                            .map(|_| ())
                            .map_err(|e| map_kafka_error(&e, timeout))
                    })
                    .await
                    .map_err(|e| LogError::Transport(format!("Metadata probe aborted: {e}")))??;
                    context.clear_fault();
                    Ok(())
                }
            }
        })
    }
}
