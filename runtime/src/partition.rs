//! Sequential processing of one assigned partition.
//!
//! A [`PartitionTask`] owns the message stream of one partition and processes
//! it strictly in order with at most one message in flight. Different
//! partitions run as independent tasks, so they advance concurrently.
//!
//! # Stop Semantics
//!
//! The stop signal is observed only between messages. A message whose
//! processing has started always runs to completion and its checkpoint is
//! recorded; the task then flushes any uncommitted checkpoint and exits. A
//! message that was received but not yet started is left for redelivery.

use crate::metrics::WorkerMetrics;
use crate::processor::{MessageProcessor, ProcessError};
use crate::stopped;
use beacon_core::log::{LogCoordinates, LogError, LogMessage, MemberHandle, PartitionStream, TopicPartition};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};

/// Commit bookkeeping for one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionCheckpoint {
    partition: TopicPartition,
    commit_every: usize,
    pending: Option<i64>,
    committed: Option<i64>,
    since_commit: usize,
}

impl PartitionCheckpoint {
    /// Track `partition`, committing after every `commit_every` messages.
    #[must_use]
    pub fn new(partition: TopicPartition, commit_every: usize) -> Self {
        Self {
            partition,
            commit_every: commit_every.max(1),
            pending: None,
            committed: None,
            since_commit: 0,
        }
    }

    /// Partition being tracked.
    #[must_use]
    pub const fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    /// Note that `coordinates` reached a final outcome. Returns whether a
    /// commit is due.
    pub fn record(&mut self, coordinates: &LogCoordinates) -> bool {
        self.pending = Some(coordinates.next_offset());
        self.since_commit += 1;
        self.since_commit >= self.commit_every
    }

    /// Next offset to commit, if it moved since the last commit.
    #[must_use]
    pub fn uncommitted(&self) -> Option<i64> {
        self.pending.filter(|next| Some(*next) != self.committed)
    }

    /// Last committed next-offset.
    #[must_use]
    pub const fn committed(&self) -> Option<i64> {
        self.committed
    }

    /// Note a successful commit of `next_offset`.
    pub const fn mark_committed(&mut self, next_offset: i64) {
        self.committed = Some(next_offset);
        self.since_commit = 0;
    }
}

/// Why a partition task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionExit {
    /// Stopped on request after flushing its checkpoint
    Stopped,
    /// The log closed the stream
    StreamEnded,
    /// The store could not complete a message; nothing past it was committed
    Halted(ProcessError),
    /// The stream or a commit failed
    Log(LogError),
}

impl PartitionExit {
    /// Whether the worker has to leave and rejoin the group.
    #[must_use]
    pub const fn requires_rejoin(&self) -> bool {
        matches!(self, Self::Halted(_) | Self::Log(_))
    }
}

enum Next {
    Stop,
    Message(Option<Result<LogMessage, LogError>>),
}

/// Processing loop for one partition.
pub struct PartitionTask {
    messages: PartitionStream,
    processor: MessageProcessor,
    member: Arc<dyn MemberHandle>,
    permits: Arc<Semaphore>,
    checkpoint: PartitionCheckpoint,
    stop: watch::Receiver<bool>,
}

impl PartitionTask {
    /// Task over `messages` of `partition`.
    #[must_use]
    pub fn new(
        partition: TopicPartition,
        messages: PartitionStream,
        processor: MessageProcessor,
        member: Arc<dyn MemberHandle>,
        permits: Arc<Semaphore>,
        commit_every: usize,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            messages,
            processor,
            member,
            permits,
            checkpoint: PartitionCheckpoint::new(partition, commit_every),
            stop,
        }
    }

    /// Process until stopped, the stream ends, or a failure halts the
    /// partition.
    pub async fn run(mut self) -> PartitionExit {
        let partition = self.checkpoint.partition().clone();
        tracing::debug!(topic = %partition.topic, partition = partition.partition, "Partition task started");

        let exit = self.process_loop().await;

        match &exit {
            PartitionExit::Stopped | PartitionExit::StreamEnded => tracing::debug!(
                topic = %partition.topic,
                partition = partition.partition,
                committed = ?self.checkpoint.committed(),
                "Partition task finished"
            ),
            PartitionExit::Halted(error) => tracing::error!(
                topic = %partition.topic,
                partition = partition.partition,
                error = %error,
                "Partition halted"
            ),
            PartitionExit::Log(error) => tracing::warn!(
                topic = %partition.topic,
                partition = partition.partition,
                error = %error,
                "Partition stopped by log error"
            ),
        }
        exit
    }

    async fn process_loop(&mut self) -> PartitionExit {
        loop {
            let next = tokio::select! {
                biased;
                () = stopped(&mut self.stop) => Next::Stop,
                message = self.messages.next() => Next::Message(message),
            };

            let message = match next {
                Next::Stop => return self.flush(PartitionExit::Stopped).await,
                Next::Message(None) => return self.flush(PartitionExit::StreamEnded).await,
                Next::Message(Some(Err(error))) => return self.flush(PartitionExit::Log(error)).await,
                Next::Message(Some(Ok(message))) => message,
            };

            let permits = Arc::clone(&self.permits);
            let permit = tokio::select! {
                biased;
                () = stopped(&mut self.stop) => None,
                permit = permits.acquire() => permit.ok(),
            };
            let Some(permit) = permit else {
                return self.flush(PartitionExit::Stopped).await;
            };

            let result = self.processor.process(&message).await;
            drop(permit);

            match result {
                Ok(outcome) => {
                    tracing::trace!(
                        coordinates = %message.coordinates,
                        outcome = outcome.as_str(),
                        "Message done"
                    );
                    if self.checkpoint.record(&message.coordinates) {
                        if let Err(error) = self.commit().await {
                            return PartitionExit::Log(error);
                        }
                    }
                }
                Err(error) => return self.flush(PartitionExit::Halted(error)).await,
            }
        }
    }

    async fn flush(&mut self, exit: PartitionExit) -> PartitionExit {
        match self.commit().await {
            Ok(()) => exit,
            Err(error) if exit == PartitionExit::Stopped => PartitionExit::Log(error),
            Err(_) => exit,
        }
    }

    async fn commit(&mut self) -> Result<(), LogError> {
        let Some(next_offset) = self.checkpoint.uncommitted() else {
            return Ok(());
        };
        let partition = self.checkpoint.partition().clone();

        match self.member.commit(&partition, next_offset).await {
            Ok(()) => {
                self.checkpoint.mark_committed(next_offset);
                WorkerMetrics::record_commit();
                tracing::debug!(
                    topic = %partition.topic,
                    partition = partition.partition,
                    next_offset,
                    "Checkpoint committed"
                );
                Ok(())
            }
            Err(error) => {
                WorkerMetrics::record_commit_error();
                tracing::warn!(
                    topic = %partition.topic,
                    partition = partition.partition,
                    next_offset,
                    error = %error,
                    "Checkpoint commit failed"
                );
                Err(error)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::processor::ProcessorOptions;
    use crate::retry::RetryPolicy;
    use beacon_core::environment::Clock;
    use beacon_core::event::{EventInput, EventType};
    use beacon_core::log::{ConsumerGroup, EventLog, GroupMembership, MembershipEvent};
    use beacon_testing::{InMemoryLog, InMemoryStore, test_clock};
    use std::time::Duration;

    #[test]
    fn checkpoint_commits_every_n() {
        let tp = TopicPartition::new("events_click", 0);
        let mut checkpoint = PartitionCheckpoint::new(tp, 3);

        assert!(!checkpoint.record(&LogCoordinates::new("events_click", 0, 0)));
        assert!(!checkpoint.record(&LogCoordinates::new("events_click", 0, 1)));
        assert!(checkpoint.record(&LogCoordinates::new("events_click", 0, 2)));
        assert_eq!(checkpoint.uncommitted(), Some(3));

        checkpoint.mark_committed(3);
        assert_eq!(checkpoint.uncommitted(), None);
        assert_eq!(checkpoint.committed(), Some(3));
    }

    proptest::proptest! {
        #[test]
        fn committed_offset_never_lags_what_was_flushed(commit_every in 1usize..8, count in 1i64..64) {
            let mut checkpoint = PartitionCheckpoint::new(TopicPartition::new("events_click", 0), commit_every);
            let mut last = None;
            for offset in 0..count {
                if checkpoint.record(&LogCoordinates::new("events_click", 0, offset)) {
                    let next = checkpoint.uncommitted().unwrap();
                    proptest::prop_assert!(last.is_none_or(|last| next > last));
                    checkpoint.mark_committed(next);
                    last = Some(next);
                }
            }
            if let Some(next) = checkpoint.uncommitted() {
                checkpoint.mark_committed(next);
            }
            proptest::prop_assert_eq!(checkpoint.committed(), Some(count));
        }
    }

    async fn assigned(membership: &mut Box<dyn GroupMembership>) -> (TopicPartition, PartitionStream) {
        match membership.next_event().await.unwrap().unwrap() {
            MembershipEvent::Assigned { partition, messages } => (partition, messages),
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    fn processor(store: &InMemoryStore) -> MessageProcessor {
        let store = Arc::new(store.clone());
        MessageProcessor::new(store.clone(), store).with_options(ProcessorOptions {
            store_retry: RetryPolicy::builder()
                .max_retries(1)
                .initial_delay(Duration::from_millis(1))
                .jitter(false)
                .build(),
            ..ProcessorOptions::default()
        })
    }

    async fn publish(log: &InMemoryLog, user: &str) {
        let event = EventInput::new(EventType::Click, user).into_event(test_clock().now());
        log.append("events_click", user.as_bytes(), &event.encode().unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stop_flushes_checkpoint() {
        let log = InMemoryLog::new(1);
        let store = InMemoryStore::new();
        for user in ["a", "b", "c"] {
            publish(&log, user).await;
        }

        let group = log.consumer_group("g");
        let mut membership = group.join(&["events_click".to_string()]).await.unwrap();
        let (tp, messages) = assigned(&mut membership).await;
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = PartitionTask::new(
            tp.clone(),
            messages,
            processor(&store),
            membership.handle(),
            Arc::new(Semaphore::new(1)),
            10,
            stop_rx,
        );
        let handle = tokio::spawn(task.run());

        while store.event_count() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stop_tx.send_replace(true);

        assert_eq!(handle.await.unwrap(), PartitionExit::Stopped);
        assert_eq!(log.committed("g", &tp), Some(3));
    }

    #[tokio::test]
    async fn store_outage_halts_without_commit() {
        let log = InMemoryLog::new(1);
        let store = InMemoryStore::new();
        publish(&log, "a").await;
        store.set_available(false);

        let group = log.consumer_group("g");
        let mut membership = group.join(&["events_click".to_string()]).await.unwrap();
        let (tp, messages) = assigned(&mut membership).await;
        let (_stop_tx, stop_rx) = watch::channel(false);
        let task = PartitionTask::new(
            tp.clone(),
            messages,
            processor(&store),
            membership.handle(),
            Arc::new(Semaphore::new(1)),
            1,
            stop_rx,
        );

        let exit = task.run().await;
        assert!(matches!(exit, PartitionExit::Halted(ProcessError::StoreUnavailable { .. })));
        assert!(exit.requires_rejoin());
        assert_eq!(log.committed("g", &tp), None);
    }
}
