//! Partitioned log boundary.
//!
//! The pipeline talks to the durable log through four traits:
//!
//! - [`EventLog`]: the producer side (append + reachability)
//! - [`ConsumerGroup`]: entry point for consumers; `join` announces membership
//! - [`GroupMembership`]: one live session in the group, yielding
//!   [`MembershipEvent`]s as the coordinator grants and revokes partitions
//! - [`MemberHandle`]: cloneable side channel for checkpoints and liveness
//!
//! # Partition Ownership
//!
//! ```text
//!   coordinator                        member
//!       │   Assigned { p, messages }     │
//!       │ ─────────────────────────────► │  spawn partition task
//!       │                                │  ... process, commit(p, off + 1)
//!       │   Revoked { p, ack }           │
//!       │ ─────────────────────────────► │  stop task, await in-flight
//!       │ ◄───────────────────────────── │  ack.complete()
//!       │   Assigned { p } to next owner │
//! ```
//!
//! A partition is never handed to a new owner while the previous owner still
//! holds the [`RevocationAck`], which keeps processing of one partition
//! exclusive across rebalances. Members that stop heartbeating are the one
//! exception: the coordinator expires them and reassigns without waiting, and
//! their [`MemberHandle`] is fenced from then on.
//!
//! # Dyn Compatibility
//!
//! Every async method returns `Pin<Box<dyn Future>>` so the runtime can hold
//! `Arc<dyn EventLog>` and `Box<dyn GroupMembership>` without generics.

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A single partition of a topic. Keys all per-partition state.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    /// Topic name
    pub topic: String,
    /// Partition index within the topic
    pub partition: i32,
}

impl TopicPartition {
    /// Create a new topic/partition pair.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// Where a message lives in the log. Unique per message instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogCoordinates {
    /// Topic name
    pub topic: String,
    /// Partition index
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
}

impl LogCoordinates {
    /// Create coordinates from their parts.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }

    /// The partition these coordinates belong to.
    #[must_use]
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Checkpoint value that marks this message as consumed.
    #[must_use]
    pub const fn next_offset(&self) -> i64 {
        self.offset + 1
    }
}

impl fmt::Display for LogCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// A message as delivered to a partition stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogMessage {
    /// Where the message lives
    pub coordinates: LogCoordinates,
    /// Message key, if any
    pub key: Option<Vec<u8>>,
    /// Message value, if any
    pub payload: Option<Vec<u8>>,
}

/// Errors raised by log implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    /// The client is closed or was never connected
    #[error("Not connected to the log")]
    NotConnected,

    /// No broker could serve the request
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// The log did not acknowledge in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The member does not own the partition (revoked or expired)
    #[error("Partition {0} is not owned by this member")]
    NotOwner(TopicPartition),

    /// The coordinator no longer considers this member alive
    #[error("Group membership lost: {0}")]
    MembershipLost(String),

    /// Any other client or protocol failure
    #[error("Transport error: {0}")]
    Transport(String),
}

impl LogError {
    /// Whether the error means the log itself is unreachable.
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::BrokerUnavailable(_) | Self::Timeout(_) | Self::Transport(_)
        )
    }
}

/// Ordered messages of one assigned partition, starting at the committed
/// checkpoint. The stream ends when the partition is revoked.
pub type PartitionStream = Pin<Box<dyn Stream<Item = Result<LogMessage, LogError>> + Send>>;

/// Notifications from the group coordinator to one member.
pub enum MembershipEvent {
    /// Exclusive grant of a partition
    Assigned {
        /// The granted partition
        partition: TopicPartition,
        /// Its messages in log order
        messages: PartitionStream,
    },
    /// The partition must be stopped, then `ack` completed
    Revoked {
        /// The partition being taken away
        partition: TopicPartition,
        /// Releases the partition to its next owner
        ack: RevocationAck,
    },
}

impl fmt::Debug for MembershipEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Assigned { partition, .. } => {
                f.debug_struct("Assigned").field("partition", partition).finish_non_exhaustive()
            }
            Self::Revoked { partition, .. } => {
                f.debug_struct("Revoked").field("partition", partition).finish_non_exhaustive()
            }
        }
    }
}

/// Proof that a revoked partition has been released.
///
/// Completing the ack (or dropping it) runs the release action exactly once.
pub struct RevocationAck {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl RevocationAck {
    /// Wrap a release action.
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// An ack with nothing to release.
    #[must_use]
    pub const fn noop() -> Self {
        Self { release: None }
    }

    /// Release the partition.
    pub fn complete(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for RevocationAck {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for RevocationAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevocationAck")
            .field("pending", &self.release.is_some())
            .finish()
    }
}

/// Producer side of the log.
pub trait EventLog: Send + Sync {
    /// Append a message and wait for the log to acknowledge it.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::NotConnected`], [`LogError::BrokerUnavailable`] or
    /// [`LogError::Timeout`] when the write is not acknowledged.
    fn append<'a>(
        &'a self,
        topic: &'a str,
        key: &'a [u8],
        payload: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<LogCoordinates, LogError>> + Send + 'a>>;

    /// Check that the log is reachable.
    ///
    /// # Errors
    ///
    /// Returns a connection-class [`LogError`] if it is not.
    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<(), LogError>> + Send + '_>>;
}

/// Consumer side entry point, bound to one group id.
pub trait ConsumerGroup: Send + Sync {
    /// The group this consumer joins.
    fn group_id(&self) -> &str;

    /// Announce membership and subscribe to `topics`.
    ///
    /// # Errors
    ///
    /// Returns a connection-class [`LogError`] if the coordinator cannot be
    /// reached.
    fn join<'a>(
        &'a self,
        topics: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn GroupMembership>, LogError>> + Send + 'a>>;
}

/// One live membership session.
pub trait GroupMembership: Send {
    /// Coordinator-assigned identity of this member.
    fn member_id(&self) -> &str;

    /// Wait for the next assignment change.
    ///
    /// Returns `None` once the session has ended. The returned future must be
    /// cancel-safe: dropping it before completion loses no event.
    fn next_event(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Option<Result<MembershipEvent, LogError>>> + Send + '_>>;

    /// Handle for commits and heartbeats, usable from other tasks.
    fn handle(&self) -> Arc<dyn MemberHandle>;

    /// Leave the group so the coordinator reassigns immediately.
    ///
    /// # Errors
    ///
    /// Returns [`LogError`] if the leave request could not be delivered.
    fn leave(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), LogError>> + Send>>;
}

/// Checkpoint and liveness operations of a member.
pub trait MemberHandle: Send + Sync {
    /// Record `next_offset` as the committed checkpoint of `partition`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::NotOwner`] if the member does not own the partition.
    fn commit<'a>(
        &'a self,
        partition: &'a TopicPartition,
        next_offset: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), LogError>> + Send + 'a>>;

    /// Send one liveness signal.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::MembershipLost`] once the coordinator has expired
    /// this member.
    fn heartbeat(&self) -> Pin<Box<dyn Future<Output = Result<(), LogError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_ack() -> (RevocationAck, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        let ack = RevocationAck::new(move || {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        (ack, count)
    }

    #[test]
    fn ack_releases_once_on_complete() {
        let (ack, count) = counting_ack();
        ack.complete();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn ack_releases_on_drop() {
        let (ack, count) = counting_ack();
        drop(ack);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn connection_errors_are_classified() {
        assert!(LogError::NotConnected.is_connection());
        assert!(LogError::Timeout(Duration::from_secs(1)).is_connection());
        assert!(!LogError::NotOwner(TopicPartition::new("t", 0)).is_connection());
        assert!(!LogError::MembershipLost("expired".into()).is_connection());
    }

    #[test]
    fn coordinates_display_and_checkpoint() {
        let coords = LogCoordinates::new("events_login", 2, 41);
        assert_eq!(coords.to_string(), "events_login[2]@41");
        assert_eq!(coords.next_offset(), 42);
        assert_eq!(coords.topic_partition(), TopicPartition::new("events_login", 2));
    }
}
