//! Consumer-group worker.
//!
//! A [`Worker`] joins the group, runs one [`PartitionTask`] per assigned
//! partition and keeps the membership alive with a [`LivenessSignaler`].
//!
//! ```text
//!  Disconnected ──► JoiningGroup ──► Assigned(p..) ──► Processing
//!        ▲               ▲                 ▲               │
//!        │               │ rejoin          └─ Reassigned ◄─┤ rebalance
//!        │               └─────────────────────────────────┤ lost / halted
//!        └──────────────── ShuttingDown ◄──────────────────┘ shutdown
//! ```
//!
//! # Rebalance
//!
//! A revoked partition is removed from the task map, stopped between messages
//! and awaited before the revocation is acknowledged, so the next owner never
//! overlaps with an in-flight message here.
//!
//! # Loss of the session
//!
//! When heartbeats report the membership lost, the coordinator has already
//! handed the partitions on. Partition tasks are aborted without committing
//! and the worker joins again. A halted partition, a log error or failing
//! heartbeats instead stop the remaining partitions cleanly between messages,
//! leave, and rejoin after a delay.

use crate::liveness::{LivenessExit, LivenessSignaler};
use crate::metrics::WorkerMetrics;
use crate::partition::{PartitionExit, PartitionTask};
use crate::processor::MessageProcessor;
use crate::readiness::Readiness;
use crate::retry::{Backoff, RetryPolicy};
use crate::stopped;
use beacon_core::event::all_topics;
use beacon_core::log::{
    ConsumerGroup, GroupMembership, LogError, MemberHandle, MembershipEvent, PartitionStream,
    TopicPartition,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;

/// Observable lifecycle of a [`Worker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    /// Not a group member
    Disconnected,
    /// Joining, or waiting to retry a join
    JoiningGroup,
    /// Membership changed; these partitions are owned now
    Assigned(Vec<TopicPartition>),
    /// Consuming the owned partitions
    Processing,
    /// A revocation is being handled
    Reassigned,
    /// Draining before leaving for good
    ShuttingDown,
}

/// Errors returned by [`Worker::run`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// The group could not be joined within the retry budget
    #[error("Failed to join consumer group after {attempts} attempts: {source}")]
    Connection {
        /// Join attempts made
        attempts: usize,
        /// Error of the final attempt
        source: LogError,
    },

    /// The options are inconsistent
    #[error("Invalid worker configuration: {0}")]
    Config(String),
}

/// Tuning for a [`Worker`].
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Topics to subscribe to
    pub topics: Vec<String>,
    /// Commit after this many finished messages per partition
    pub commit_every: usize,
    /// Partitions allowed to process a message at the same time
    pub max_in_flight: usize,
    /// Delay between heartbeats
    pub heartbeat_interval: Duration,
    /// Session timeout the group was configured with
    pub session_timeout: Duration,
    /// Budget for each join
    pub join_retry: RetryPolicy,
    /// Pause between leaving and rejoining after a failure
    pub rejoin_delay: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            topics: all_topics(),
            commit_every: 1,
            max_in_flight: 16,
            heartbeat_interval: Duration::from_secs(3),
            session_timeout: Duration::from_secs(30),
            join_retry: RetryPolicy::constant(30, Duration::from_secs(2)),
            rejoin_delay: Duration::from_secs(1),
        }
    }
}

impl WorkerOptions {
    /// Check the options for consistency.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Config`] when no topic is given, a count is
    /// zero, or heartbeats are not comfortably inside the session timeout.
    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.topics.is_empty() {
            return Err(WorkerError::Config("at least one topic is required".to_string()));
        }
        if self.commit_every == 0 {
            return Err(WorkerError::Config("commit_every must be positive".to_string()));
        }
        if self.max_in_flight == 0 {
            return Err(WorkerError::Config("max_in_flight must be positive".to_string()));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval * 3 >= self.session_timeout {
            return Err(WorkerError::Config(format!(
                "heartbeat interval {:?} must be below a third of the session timeout {:?}",
                self.heartbeat_interval, self.session_timeout
            )));
        }
        Ok(())
    }
}

enum SessionEnd {
    Shutdown,
    Rejoin { reason: String, fenced: bool },
}

/// Aborts the task when dropped.
struct TaskGuard<T>(JoinHandle<T>);

impl<T> Drop for TaskGuard<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct PartitionHandle {
    id: u64,
    stop: watch::Sender<bool>,
    task: TaskGuard<PartitionExit>,
}

impl PartitionHandle {
    async fn stop(mut self) {
        self.stop.send_replace(true);
        if let Err(error) = (&mut self.task.0).await {
            tracing::warn!(error = %error, "Partition task did not stop cleanly");
        }
    }
}

type PartitionExits = mpsc::UnboundedSender<(TopicPartition, u64, PartitionExit)>;

/// A group member that processes every partition it is assigned.
pub struct Worker {
    group: Arc<dyn ConsumerGroup>,
    processor: MessageProcessor,
    options: WorkerOptions,
    readiness: Option<Arc<Readiness>>,
    state: watch::Sender<WorkerState>,
}

impl Worker {
    /// Worker for `group` with default options.
    #[must_use]
    pub fn new(group: Arc<dyn ConsumerGroup>, processor: MessageProcessor) -> Self {
        let (state, _) = watch::channel(WorkerState::Disconnected);
        Self {
            group,
            processor,
            options: WorkerOptions::default(),
            readiness: None,
            state,
        }
    }

    /// Replace the options.
    #[must_use]
    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    /// Report the log connection to `readiness`.
    #[must_use]
    pub fn with_readiness(mut self, readiness: Arc<Readiness>) -> Self {
        self.readiness = Some(readiness);
        self
    }

    /// Options in effect.
    #[must_use]
    pub const fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Subscribe to lifecycle changes.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Consume until `shutdown` is set.
    ///
    /// On shutdown in-flight messages finish, checkpoints are flushed and the
    /// group is left before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Config`] for invalid options and
    /// [`WorkerError::Connection`] when a join exhausts its retry budget.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        self.options.validate()?;
        let group_id = self.group.group_id().to_string();
        tracing::info!(group_id = %group_id, topics = ?self.options.topics, "Worker starting");

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }
            self.set_state(WorkerState::JoiningGroup);

            let membership = match self.join(&mut shutdown).await {
                Ok(Some(membership)) => membership,
                Ok(None) => break Ok(()),
                Err(error) => break Err(error),
            };
            self.set_log_connected(true);

            match self.run_session(membership, &mut shutdown).await {
                SessionEnd::Shutdown => break Ok(()),
                SessionEnd::Rejoin { reason, fenced } => {
                    WorkerMetrics::record_rejoin();
                    tracing::warn!(group_id = %group_id, reason = %reason, fenced, "Rejoining consumer group");
                    if !fenced {
                        let delay = self.options.rejoin_delay;
                        tokio::select! {
                            biased;
                            () = stopped(&mut shutdown) => break Ok(()),
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        };

        self.set_log_connected(false);
        WorkerMetrics::set_owned_partitions(0);
        self.set_state(WorkerState::Disconnected);
        tracing::info!(group_id = %group_id, "Worker stopped");
        result
    }

    async fn join(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Box<dyn GroupMembership>>, WorkerError> {
        let mut backoff = Backoff::new(self.options.join_retry.clone());
        loop {
            match self.group.join(&self.options.topics).await {
                Ok(membership) => {
                    tracing::info!(
                        group_id = %self.group.group_id(),
                        member_id = %membership.member_id(),
                        "Joined consumer group"
                    );
                    return Ok(Some(membership));
                }
                Err(error) => {
                    self.set_log_connected(false);
                    let attempts = backoff.attempt() + 1;
                    let Some(delay) = backoff.next_delay() else {
                        tracing::error!(attempts, error = %error, "Giving up joining consumer group");
                        return Err(WorkerError::Connection {
                            attempts,
                            source: error,
                        });
                    };
                    tracing::warn!(attempts, error = %error, ?delay, "Join failed, retrying");
                    tokio::select! {
                        biased;
                        () = stopped(shutdown) => return Ok(None),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn run_session(
        &self,
        mut membership: Box<dyn GroupMembership>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let member = membership.handle();
        let member_id = membership.member_id().to_string();
        let permits = Arc::new(Semaphore::new(self.options.max_in_flight));
        let (exits_tx, mut exits_rx) = mpsc::unbounded_channel::<(TopicPartition, u64, PartitionExit)>();
        let (liveness_stop, liveness_stop_rx) = watch::channel(false);
        let mut liveness = TaskGuard(tokio::spawn(
            LivenessSignaler::new(Arc::clone(&member), self.options.heartbeat_interval)
                .run(liveness_stop_rx),
        ));
        let mut partitions: HashMap<TopicPartition, PartitionHandle> = HashMap::new();
        let mut next_task_id = 0u64;
        let mut liveness_finished = false;

        self.set_state(WorkerState::Assigned(Vec::new()));

        let end = loop {
            tokio::select! {
                biased;
                () = stopped(shutdown) => break SessionEnd::Shutdown,
                exit = &mut liveness.0 => {
                    liveness_finished = true;
                    break match exit {
                        Ok(LivenessExit::MembershipLost(reason)) => SessionEnd::Rejoin { reason, fenced: true },
                        Ok(LivenessExit::Failed(error)) => SessionEnd::Rejoin { reason: error.to_string(), fenced: false },
                        Ok(LivenessExit::Stopped) => SessionEnd::Rejoin {
                            reason: "liveness stopped".to_string(),
                            fenced: false,
                        },
                        Err(error) => SessionEnd::Rejoin { reason: error.to_string(), fenced: false },
                    };
                }
                Some((partition, id, exit)) = exits_rx.recv() => {
                    if partitions.get(&partition).is_none_or(|handle| handle.id != id) {
                        continue;
                    }
                    partitions.remove(&partition);
                    WorkerMetrics::set_owned_partitions(partitions.len());
                    if exit.requires_rejoin() {
                        if matches!(exit, PartitionExit::Halted(_)) {
                            WorkerMetrics::record_partition_halt();
                        }
                        break SessionEnd::Rejoin { reason: format!("{partition} ended: {exit:?}"), fenced: false };
                    }
                    tracing::debug!(topic = %partition.topic, partition = partition.partition, "Partition stream closed");
                }
                event = membership.next_event() => match event {
                    None => break SessionEnd::Rejoin {
                        reason: "membership closed by coordinator".to_string(),
                        fenced: true,
                    },
                    Some(Err(error)) => {
                        let fenced = matches!(error, LogError::MembershipLost(_));
                        break SessionEnd::Rejoin { reason: error.to_string(), fenced };
                    }
                    Some(Ok(MembershipEvent::Assigned { partition, messages })) => {
                        WorkerMetrics::record_rebalance("assigned");
                        tracing::info!(
                            member_id = %member_id,
                            topic = %partition.topic,
                            partition = partition.partition,
                            "Partition assigned"
                        );
                        next_task_id += 1;
                        let handle = self.spawn_partition(
                            next_task_id,
                            partition.clone(),
                            messages,
                            Arc::clone(&member),
                            Arc::clone(&permits),
                            exits_tx.clone(),
                        );
                        partitions.insert(partition, handle);
                        self.announce_partitions(&partitions);
                    }
                    Some(Ok(MembershipEvent::Revoked { partition, ack })) => {
                        WorkerMetrics::record_rebalance("revoked");
                        self.set_state(WorkerState::Reassigned);
                        if let Some(handle) = partitions.remove(&partition) {
                            handle.stop().await;
                        }
                        ack.complete();
                        tracing::info!(
                            member_id = %member_id,
                            topic = %partition.topic,
                            partition = partition.partition,
                            "Partition revoked"
                        );
                        self.announce_partitions(&partitions);
                    }
                },
            }
        };

        match &end {
            SessionEnd::Shutdown | SessionEnd::Rejoin { fenced: false, .. } => {
                if matches!(end, SessionEnd::Shutdown) {
                    self.set_state(WorkerState::ShuttingDown);
                }
                for handle in partitions.values() {
                    handle.stop.send_replace(true);
                }
                for (_, handle) in partitions.drain() {
                    handle.stop().await;
                }
            }
            SessionEnd::Rejoin { fenced: true, .. } => {
                self.set_log_connected(false);
                partitions.clear();
            }
        }
        WorkerMetrics::set_owned_partitions(0);

        liveness_stop.send_replace(true);
        if !liveness_finished {
            let _ = (&mut liveness.0).await;
        }

        if let Err(error) = membership.leave().await {
            tracing::warn!(member_id = %member_id, error = %error, "Leaving consumer group failed");
        } else {
            tracing::info!(member_id = %member_id, "Left consumer group");
        }
        end
    }

    fn spawn_partition(
        &self,
        id: u64,
        partition: TopicPartition,
        messages: PartitionStream,
        member: Arc<dyn MemberHandle>,
        permits: Arc<Semaphore>,
        exits: PartitionExits,
    ) -> PartitionHandle {
        let (stop, stop_rx) = watch::channel(false);
        let task = PartitionTask::new(
            partition.clone(),
            messages,
            self.processor.clone(),
            member,
            permits,
            self.options.commit_every,
            stop_rx,
        );
        let task = tokio::spawn(async move {
            let exit = task.run().await;
            let _ = exits.send((partition, id, exit.clone()));
            exit
        });
        PartitionHandle {
            id,
            stop,
            task: TaskGuard(task),
        }
    }

    fn announce_partitions(&self, partitions: &HashMap<TopicPartition, PartitionHandle>) {
        let mut owned: Vec<TopicPartition> = partitions.keys().cloned().collect();
        owned.sort();
        WorkerMetrics::set_owned_partitions(owned.len());
        self.set_state(WorkerState::Assigned(owned));
        self.set_state(WorkerState::Processing);
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                tracing::debug!(from = ?current, to = ?state, "Worker state changed");
                *current = state;
                true
            }
        });
    }

    fn set_log_connected(&self, connected: bool) {
        if let Some(readiness) = &self.readiness {
            readiness.set_log_connected(connected);
        }
    }
}
