//! Periodic liveness signals for a group membership.
//!
//! The coordinator expires members that stay silent for longer than their
//! session timeout. [`LivenessSignaler`] heartbeats on a fixed interval for as
//! long as the membership lasts and reports why it stopped, so the worker can
//! tear the session down when the coordinator has given up on it.

use crate::metrics::WorkerMetrics;
use crate::stopped;
use beacon_core::log::{LogError, MemberHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Consecutive transport failures tolerated before giving up.
pub const DEFAULT_MAX_FAILURES: u32 = 3;

/// Why a [`LivenessSignaler`] stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessExit {
    /// Stopped on request
    Stopped,
    /// The coordinator expired the member
    MembershipLost(String),
    /// Heartbeats kept failing for transport reasons
    Failed(LogError),
}

/// Heartbeat loop for one membership.
pub struct LivenessSignaler {
    member: Arc<dyn MemberHandle>,
    interval: Duration,
    max_failures: u32,
}

impl LivenessSignaler {
    /// Heartbeat through `member` every `interval`.
    #[must_use]
    pub fn new(member: Arc<dyn MemberHandle>, interval: Duration) -> Self {
        Self {
            member,
            interval,
            max_failures: DEFAULT_MAX_FAILURES,
        }
    }

    /// Override the tolerated consecutive failures.
    #[must_use]
    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures.max(1);
        self
    }

    /// Heartbeat until `stop` is set or the membership is lost.
    pub async fn run(self, mut stop: watch::Receiver<bool>) -> LivenessExit {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0u32;

        loop {
            tokio::select! {
                biased;
                () = stopped(&mut stop) => return LivenessExit::Stopped,
                _ = ticker.tick() => {}
            }

            match self.member.heartbeat().await {
                Ok(()) => failures = 0,
                Err(LogError::MembershipLost(reason)) => {
                    WorkerMetrics::record_heartbeat_failure();
                    tracing::warn!(reason = %reason, "Liveness lost, coordinator expired this member");
                    return LivenessExit::MembershipLost(reason);
                }
                Err(error) => {
                    WorkerMetrics::record_heartbeat_failure();
                    failures += 1;
                    tracing::warn!(error = %error, failures, "Heartbeat failed");
                    if failures >= self.max_failures {
                        return LivenessExit::Failed(error);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use beacon_core::log::{ConsumerGroup, GroupMembership};
    use beacon_testing::InMemoryLog;

    #[tokio::test]
    async fn keeps_member_alive_until_stopped() {
        let log = InMemoryLog::new(1);
        let group = log
            .consumer_group("g")
            .with_session_timeout(Duration::from_millis(150));
        let membership = group.join(&["events_login".to_string()]).await.unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let signaler = LivenessSignaler::new(membership.handle(), Duration::from_millis(20));
        let task = tokio::spawn(signaler.run(stop_rx));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(log.members("g"), vec![membership.member_id().to_string()]);

        stop_tx.send_replace(true);
        assert_eq!(task.await.unwrap(), LivenessExit::Stopped);
    }

    #[tokio::test]
    async fn reports_expiry() {
        let log = InMemoryLog::new(1);
        let group = log.consumer_group("g");
        let membership = group.join(&["events_login".to_string()]).await.unwrap();
        log.expire_member("g", membership.member_id());

        let (_stop_tx, stop_rx) = watch::channel(false);
        let exit = LivenessSignaler::new(membership.handle(), Duration::from_millis(10))
            .run(stop_rx)
            .await;
        assert!(matches!(exit, LivenessExit::MembershipLost(_)));
    }

    #[tokio::test]
    async fn gives_up_after_repeated_transport_failures() {
        let log = InMemoryLog::new(1);
        let group = log.consumer_group("g");
        let membership = group.join(&["events_login".to_string()]).await.unwrap();
        log.set_connected(false);

        let (_stop_tx, stop_rx) = watch::channel(false);
        let exit = LivenessSignaler::new(membership.handle(), Duration::from_millis(5))
            .with_max_failures(2)
            .run(stop_rx)
            .await;
        assert_eq!(exit, LivenessExit::Failed(LogError::NotConnected));
    }
}
