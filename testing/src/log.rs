//! In-memory partitioned log with a consumer-group coordinator.
//!
//! [`InMemoryLog`] implements [`EventLog`] and hands out
//! [`InMemoryConsumerGroup`]s that implement [`ConsumerGroup`]. The
//! coordinator behaves like a broker-side group coordinator:
//!
//! - partitions are spread round-robin over live members, sorted by id
//! - a partition moving between members is revoked first and granted to the
//!   new owner only after the [`RevocationAck`] is released
//! - members that miss their session timeout are expired and their partitions
//!   reassigned at once; their handle is fenced from then on
//! - committed checkpoints are tracked per group and survive rejoins
//!
//! Expiry is checked whenever any member joins or heartbeats.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use beacon_core::log::{
    ConsumerGroup, EventLog, GroupMembership, LogCoordinates, LogError, LogMessage, MemberHandle,
    MembershipEvent, PartitionStream, RevocationAck, TopicPartition,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Default member session timeout.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10);

type Outbox = Vec<(mpsc::UnboundedSender<MembershipEvent>, MembershipEvent)>;

struct Record {
    key: Option<Vec<u8>>,
    payload: Option<Vec<u8>>,
}

struct MemberState {
    topics: Vec<String>,
    session_timeout: Duration,
    last_seen: Instant,
    events: mpsc::UnboundedSender<MembershipEvent>,
    grants: HashMap<TopicPartition, watch::Sender<bool>>,
}

#[derive(Default)]
struct GroupState {
    members: BTreeMap<String, MemberState>,
    owners: HashMap<TopicPartition, String>,
    revoking: HashSet<TopicPartition>,
    committed: HashMap<TopicPartition, i64>,
}

impl GroupState {
    fn remove_member(&mut self, member_id: &str) -> bool {
        let Some(member) = self.members.remove(member_id) else {
            return false;
        };
        for stop in member.grants.values() {
            stop.send_replace(true);
        }
        let revoking = &mut self.revoking;
        self.owners.retain(|tp, owner| {
            let keep = owner != member_id;
            if !keep {
                revoking.remove(tp);
            }
            keep
        });
        true
    }

    fn sweep(&mut self, now: Instant) -> bool {
        let expired: Vec<String> = self
            .members
            .iter()
            .filter(|(_, m)| now.duration_since(m.last_seen) > m.session_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for member_id in &expired {
            tracing::debug!(member_id = %member_id, "Expiring member after missed heartbeats");
            self.remove_member(member_id);
        }
        !expired.is_empty()
    }
}

struct LogState {
    partitions_per_topic: i32,
    connected: bool,
    append_failure: Option<LogError>,
    topics: BTreeMap<String, Vec<Vec<Record>>>,
    groups: HashMap<String, GroupState>,
    next_member: u64,
}

impl LogState {
    fn ensure_topic(&mut self, topic: &str) -> &mut Vec<Vec<Record>> {
        let partitions = usize::try_from(self.partitions_per_topic).unwrap_or(1);
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| (0..partitions).map(|_| Vec::new()).collect())
    }
}

struct Shared {
    state: Mutex<LogState>,
    appended: watch::Sender<u64>,
}

impl Shared {
    fn record(&self, tp: &TopicPartition, offset: i64) -> Option<LogMessage> {
        let state = self.state.lock().unwrap();
        let partition = state
            .topics
            .get(&tp.topic)?
            .get(usize::try_from(tp.partition).ok()?)?;
        let record = partition.get(usize::try_from(offset).ok()?)?;
        Some(LogMessage {
            coordinates: LogCoordinates::new(tp.topic.clone(), tp.partition, offset),
            key: record.key.clone(),
            payload: record.payload.clone(),
        })
    }

    fn rebalance(self: &Arc<Self>, state: &mut LogState, group_id: &str) -> Outbox {
        let mut outbox = Vec::new();
        let partitions = state.partitions_per_topic;

        let topics: BTreeSet<String> = match state.groups.get(group_id) {
            Some(group) => group
                .members
                .values()
                .flat_map(|m| m.topics.iter().cloned())
                .collect(),
            None => return outbox,
        };
        for topic in &topics {
            state.ensure_topic(topic);
        }

        let Some(group) = state.groups.get_mut(group_id) else {
            return outbox;
        };

        let mut desired: HashMap<TopicPartition, String> = HashMap::new();
        let mut slot = 0usize;
        for topic in &topics {
            let eligible: Vec<&String> = group
                .members
                .iter()
                .filter(|(_, m)| m.topics.contains(topic))
                .map(|(id, _)| id)
                .collect();
            for partition in 0..partitions {
                if !eligible.is_empty() {
                    let owner = eligible[slot % eligible.len()].clone();
                    desired.insert(TopicPartition::new(topic.clone(), partition), owner);
                }
                slot += 1;
            }
        }

        for topic in &topics {
            for partition in 0..partitions {
                let tp = TopicPartition::new(topic.clone(), partition);
                if group.revoking.contains(&tp) {
                    continue;
                }
                let wanted = desired.get(&tp);

                match group.owners.get(&tp).cloned() {
                    Some(current) if Some(&current) == wanted => {}
                    Some(current) => {
                        let Some(member) = group.members.get_mut(&current) else {
                            group.owners.remove(&tp);
                            continue;
                        };
                        group.revoking.insert(tp.clone());
                        {
                            if let Some(stop) = member.grants.remove(&tp) {
                                stop.send_replace(true);
                            }
                            let ack = self.revocation_ack(group_id, &tp, &current);
                            outbox.push((
                                member.events.clone(),
                                MembershipEvent::Revoked {
                                    partition: tp.clone(),
                                    ack,
                                },
                            ));
                        }
                    }
                    None => {
                        let Some(owner) = wanted else { continue };
                        let start = group.committed.get(&tp).copied().unwrap_or(0);
                        if let Some(member) = group.members.get_mut(owner) {
                            let (stop_tx, stop_rx) = watch::channel(false);
                            member.grants.insert(tp.clone(), stop_tx);
                            group.owners.insert(tp.clone(), owner.clone());
                            outbox.push((
                                member.events.clone(),
                                MembershipEvent::Assigned {
                                    partition: tp.clone(),
                                    messages: partition_stream(Arc::clone(self), tp, start, stop_rx),
                                },
                            ));
                        }
                    }
                }
            }
        }

        outbox
    }

    fn revocation_ack(self: &Arc<Self>, group_id: &str, tp: &TopicPartition, owner: &str) -> RevocationAck {
        let weak: Weak<Self> = Arc::downgrade(self);
        let (group_id, tp, owner) = (group_id.to_string(), tp.clone(), owner.to_string());
        RevocationAck::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.release(&group_id, &tp, &owner);
            }
        })
    }

    fn release(self: &Arc<Self>, group_id: &str, tp: &TopicPartition, owner: &str) {
        let outbox = {
            let mut state = self.state.lock().unwrap();
            if let Some(group) = state.groups.get_mut(group_id) {
                let still_owner = group.owners.get(tp).is_none_or(|o| o == owner);
                if still_owner && group.revoking.remove(tp) {
                    group.owners.remove(tp);
                }
            }
            self.rebalance(&mut state, group_id)
        };
        deliver(outbox);
    }

    fn sweep_and_rebalance(self: &Arc<Self>, state: &mut LogState, group_id: &str) -> Outbox {
        let now = Instant::now();
        let expired = state
            .groups
            .get_mut(group_id)
            .is_some_and(|group| group.sweep(now));
        if expired {
            self.rebalance(state, group_id)
        } else {
            Vec::new()
        }
    }
}

fn deliver(outbox: Outbox) {
    for (events, event) in outbox {
        // A closed receiver drops the event; a dropped ack releases at once.
        let _ = events.send(event);
    }
}

fn partition_stream(
    shared: Arc<Shared>,
    tp: TopicPartition,
    start: i64,
    mut stop: watch::Receiver<bool>,
) -> PartitionStream {
    let mut appended = shared.appended.subscribe();
    Box::pin(async_stream::stream! {
        let mut next = start;
        loop {
            if *stop.borrow() {
                break;
            }
            appended.mark_unchanged();
            if let Some(message) = shared.record(&tp, next) {
                next += 1;
                yield Ok(message);
                continue;
            }
            tokio::select! {
                changed = appended.changed() => if changed.is_err() { break },
                changed = stop.changed() => if changed.is_err() { break },
            }
        }
    })
}

fn partition_for(key: &[u8], partitions: i32) -> i32 {
    let hash = key.iter().fold(0xcbf2_9ce4_8422_2325_u64, |h, b| {
        (h ^ u64::from(*b)).wrapping_mul(0x0100_0000_01b3)
    });
    let partitions = u64::try_from(partitions.max(1)).unwrap_or(1);
    i32::try_from(hash % partitions).unwrap_or(0)
}

/// In-memory partitioned log shared by producers and consumer groups.
///
/// Cloning is cheap; clones share the same log.
///
/// # Example
///
/// ```
/// use beacon_core::log::EventLog;
/// use beacon_testing::InMemoryLog;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let log = InMemoryLog::new(4);
/// let a = log.append("events_login", b"u1", b"{}").await?;
/// let b = log.append("events_login", b"u1", b"{}").await?;
/// assert_eq!(a.partition, b.partition);
/// assert_eq!(b.offset, a.offset + 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryLog {
    shared: Arc<Shared>,
}

impl InMemoryLog {
    /// Create a log whose topics all have `partitions_per_topic` partitions.
    #[must_use]
    pub fn new(partitions_per_topic: i32) -> Self {
        let (appended, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LogState {
                    partitions_per_topic: partitions_per_topic.max(1),
                    connected: true,
                    append_failure: None,
                    topics: BTreeMap::new(),
                    groups: HashMap::new(),
                    next_member: 0,
                }),
                appended,
            }),
        }
    }

    /// Number of partitions of every topic.
    #[must_use]
    pub fn partitions_per_topic(&self) -> i32 {
        self.shared.state.lock().unwrap().partitions_per_topic
    }

    /// Partition a key is routed to.
    #[must_use]
    pub fn partition_for(&self, key: &[u8]) -> i32 {
        partition_for(key, self.partitions_per_topic())
    }

    /// Simulate losing (or regaining) the connection to the log.
    pub fn set_connected(&self, connected: bool) {
        self.shared.state.lock().unwrap().connected = connected;
    }

    /// Make every append fail with `error` until cleared with `None`.
    pub fn fail_appends_with(&self, error: Option<LogError>) {
        self.shared.state.lock().unwrap().append_failure = error;
    }

    /// Consumer-group view of this log.
    #[must_use]
    pub fn consumer_group(&self, group_id: impl Into<String>) -> InMemoryConsumerGroup {
        InMemoryConsumerGroup {
            shared: Arc::clone(&self.shared),
            group_id: group_id.into(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
        }
    }

    /// Append raw bytes, bypassing connection checks. Useful for poison input.
    pub fn append_raw(&self, topic: &str, key: &[u8], payload: Option<Vec<u8>>) -> LogCoordinates {
        let coordinates = {
            let mut state = self.shared.state.lock().unwrap();
            let partitions = state.partitions_per_topic;
            let partition = partition_for(key, partitions);
            let log = state.ensure_topic(topic);
            let records = &mut log[usize::try_from(partition).unwrap_or(0)];
            records.push(Record {
                key: Some(key.to_vec()),
                payload,
            });
            let offset = i64::try_from(records.len() - 1).unwrap_or(i64::MAX);
            LogCoordinates::new(topic, partition, offset)
        };
        self.shared.appended.send_modify(|version| *version += 1);
        coordinates
    }

    /// Every message of one partition, in log order.
    #[must_use]
    pub fn messages(&self, topic: &str, partition: i32) -> Vec<LogMessage> {
        let tp = TopicPartition::new(topic, partition);
        (0..)
            .map_while(|offset| self.shared.record(&tp, offset))
            .collect()
    }

    /// Committed checkpoint of a partition for a group.
    #[must_use]
    pub fn committed(&self, group_id: &str, tp: &TopicPartition) -> Option<i64> {
        let state = self.shared.state.lock().unwrap();
        state.groups.get(group_id)?.committed.get(tp).copied()
    }

    /// Current partition owners of a group.
    #[must_use]
    pub fn owners(&self, group_id: &str) -> HashMap<TopicPartition, String> {
        let state = self.shared.state.lock().unwrap();
        state
            .groups
            .get(group_id)
            .map(|g| g.owners.clone())
            .unwrap_or_default()
    }

    /// Live member ids of a group.
    #[must_use]
    pub fn members(&self, group_id: &str) -> Vec<String> {
        let state = self.shared.state.lock().unwrap();
        state
            .groups
            .get(group_id)
            .map(|g| g.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Expire a member as if its session had timed out.
    pub fn expire_member(&self, group_id: &str, member_id: &str) {
        let outbox = {
            let mut state = self.shared.state.lock().unwrap();
            let removed = state
                .groups
                .get_mut(group_id)
                .is_some_and(|g| g.remove_member(member_id));
            if removed {
                self.shared.rebalance(&mut state, group_id)
            } else {
                Vec::new()
            }
        };
        deliver(outbox);
    }
}

impl EventLog for InMemoryLog {
    fn append<'a>(
        &'a self,
        topic: &'a str,
        key: &'a [u8],
        payload: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<LogCoordinates, LogError>> + Send + 'a>> {
        Box::pin(async move {
            {
                let state = self.shared.state.lock().unwrap();
                if !state.connected {
                    return Err(LogError::NotConnected);
                }
                if let Some(error) = &state.append_failure {
                    return Err(error.clone());
                }
            }
            Ok(self.append_raw(topic, key, Some(payload.to_vec())))
        })
    }

    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<(), LogError>> + Send + '_>> {
        Box::pin(async move {
            if self.shared.state.lock().unwrap().connected {
                Ok(())
            } else {
                Err(LogError::NotConnected)
            }
        })
    }
}

/// Consumer-group entry point of an [`InMemoryLog`].
#[derive(Clone)]
pub struct InMemoryConsumerGroup {
    shared: Arc<Shared>,
    group_id: String,
    session_timeout: Duration,
}

impl InMemoryConsumerGroup {
    /// Session timeout applied to members joining through this handle.
    #[must_use]
    pub const fn with_session_timeout(mut self, session_timeout: Duration) -> Self {
        self.session_timeout = session_timeout;
        self
    }
}

impl ConsumerGroup for InMemoryConsumerGroup {
    fn group_id(&self) -> &str {
        &self.group_id
    }

    fn join<'a>(
        &'a self,
        topics: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn GroupMembership>, LogError>> + Send + 'a>> {
        Box::pin(async move {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let (member_id, outbox) = {
                let mut state = self.shared.state.lock().unwrap();
                if !state.connected {
                    return Err(LogError::NotConnected);
                }
                state.next_member += 1;
                let member_id = format!("{}-member-{}", self.group_id, state.next_member);

                let mut outbox = self.shared.sweep_and_rebalance(&mut state, &self.group_id);
                state.groups.entry(self.group_id.clone()).or_default().members.insert(
                    member_id.clone(),
                    MemberState {
                        topics: topics.to_vec(),
                        session_timeout: self.session_timeout,
                        last_seen: Instant::now(),
                        events: events_tx,
                        grants: HashMap::new(),
                    },
                );
                outbox.extend(self.shared.rebalance(&mut state, &self.group_id));
                (member_id, outbox)
            };
            deliver(outbox);

            tracing::debug!(group_id = %self.group_id, member_id = %member_id, "Member joined");
            Ok(Box::new(InMemoryMembership {
                shared: Arc::clone(&self.shared),
                group_id: self.group_id.clone(),
                member_id,
                events: events_rx,
            }) as Box<dyn GroupMembership>)
        })
    }
}

/// One member session of an [`InMemoryConsumerGroup`].
pub struct InMemoryMembership {
    shared: Arc<Shared>,
    group_id: String,
    member_id: String,
    events: mpsc::UnboundedReceiver<MembershipEvent>,
}

impl GroupMembership for InMemoryMembership {
    fn member_id(&self) -> &str {
        &self.member_id
    }

    fn next_event(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Option<Result<MembershipEvent, LogError>>> + Send + '_>> {
        Box::pin(async move { self.events.recv().await.map(Ok) })
    }

    fn handle(&self) -> Arc<dyn MemberHandle> {
        Arc::new(InMemoryMemberHandle {
            shared: Arc::clone(&self.shared),
            group_id: self.group_id.clone(),
            member_id: self.member_id.clone(),
        })
    }

    fn leave(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), LogError>> + Send>> {
        Box::pin(async move {
            let outbox = {
                let mut state = self.shared.state.lock().unwrap();
                let removed = state
                    .groups
                    .get_mut(&self.group_id)
                    .is_some_and(|g| g.remove_member(&self.member_id));
                if removed {
                    self.shared.rebalance(&mut state, &self.group_id)
                } else {
                    Vec::new()
                }
            };
            deliver(outbox);
            tracing::debug!(group_id = %self.group_id, member_id = %self.member_id, "Member left");
            Ok(())
        })
    }
}

struct InMemoryMemberHandle {
    shared: Arc<Shared>,
    group_id: String,
    member_id: String,
}

impl MemberHandle for InMemoryMemberHandle {
    fn commit<'a>(
        &'a self,
        partition: &'a TopicPartition,
        next_offset: i64,
    ) -> Pin<Box<dyn Future<Output = Result<(), LogError>> + Send + 'a>> {
        Box::pin(async move {
            let mut state = self.shared.state.lock().unwrap();
            if !state.connected {
                return Err(LogError::NotConnected);
            }
            let group = state
                .groups
                .get_mut(&self.group_id)
                .ok_or_else(|| LogError::NotOwner(partition.clone()))?;
            let owned = group.members.contains_key(&self.member_id)
                && group.owners.get(partition) == Some(&self.member_id);
            if !owned {
                return Err(LogError::NotOwner(partition.clone()));
            }
            let committed = group.committed.entry(partition.clone()).or_insert(0);
            *committed = (*committed).max(next_offset);
            Ok(())
        })
    }

    fn heartbeat(&self) -> Pin<Box<dyn Future<Output = Result<(), LogError>> + Send + '_>> {
        Box::pin(async move {
            let (alive, outbox) = {
                let mut state = self.shared.state.lock().unwrap();
                if !state.connected {
                    return Err(LogError::NotConnected);
                }
                let outbox = self.shared.sweep_and_rebalance(&mut state, &self.group_id);
                let member = state
                    .groups
                    .get_mut(&self.group_id)
                    .and_then(|g| g.members.get_mut(&self.member_id));
                let alive = if let Some(member) = member {
                    member.last_seen = Instant::now();
                    true
                } else {
                    false
                };
                (alive, outbox)
            };
            deliver(outbox);

            if alive {
                Ok(())
            } else {
                Err(LogError::MembershipLost(format!(
                    "member {} is no longer part of group {}",
                    self.member_id, self.group_id
                )))
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn topics() -> Vec<String> {
        vec!["events_login".to_string()]
    }

    async fn next_assigned(membership: &mut Box<dyn GroupMembership>) -> (TopicPartition, PartitionStream) {
        match membership.next_event().await.unwrap().unwrap() {
            MembershipEvent::Assigned { partition, messages } => (partition, messages),
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn same_key_lands_on_same_partition_in_order() {
        let log = InMemoryLog::new(4);
        let first = log.append("events_login", b"u1", b"a").await.unwrap();
        let second = log.append("events_login", b"u1", b"b").await.unwrap();

        assert_eq!(first.partition, second.partition);
        assert_eq!(second.offset, first.offset + 1);
        let payloads: Vec<_> = log
            .messages("events_login", first.partition)
            .into_iter()
            .map(|m| m.payload.unwrap())
            .collect();
        assert_eq!(payloads, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[tokio::test]
    async fn closed_log_rejects_appends() {
        let log = InMemoryLog::new(1);
        log.set_connected(false);
        assert_eq!(
            log.append("events_login", b"u1", b"a").await,
            Err(LogError::NotConnected)
        );
        assert!(log.ping().await.is_err());
    }

    #[tokio::test]
    async fn single_member_gets_every_partition_and_messages() {
        let log = InMemoryLog::new(2);
        let coords = log.append("events_login", b"u1", b"a").await.unwrap();
        let group = log.consumer_group("g");
        let mut member = group.join(&topics()).await.unwrap();

        let mut streams = HashMap::new();
        for _ in 0..2 {
            let (tp, stream) = next_assigned(&mut member).await;
            streams.insert(tp, stream);
        }
        let stream = streams.get_mut(&coords.topic_partition()).unwrap();
        let message = stream.next().await.unwrap().unwrap();
        assert_eq!(message.coordinates, coords);
    }

    #[tokio::test]
    async fn partition_moves_only_after_release() {
        let log = InMemoryLog::new(2);
        let group = log.consumer_group("g");
        let mut first = group.join(&topics()).await.unwrap();
        next_assigned(&mut first).await;
        next_assigned(&mut first).await;

        let mut second = group.join(&topics()).await.unwrap();
        let MembershipEvent::Revoked { partition, ack } = first.next_event().await.unwrap().unwrap() else {
            panic!("expected revocation");
        };
        assert_eq!(log.owners("g").get(&partition), Some(&first.member_id().to_string()));

        ack.complete();
        let (granted, _) = next_assigned(&mut second).await;
        assert_eq!(granted, partition);
        assert_eq!(log.owners("g").get(&partition), Some(&second.member_id().to_string()));
    }

    #[tokio::test]
    async fn commits_are_fenced_to_owners() {
        let log = InMemoryLog::new(1);
        let group = log.consumer_group("g");
        let member = group.join(&topics()).await.unwrap();
        let tp = TopicPartition::new("events_login", 0);
        let handle = member.handle();

        handle.commit(&tp, 3).await.unwrap();
        assert_eq!(log.committed("g", &tp), Some(3));

        log.expire_member("g", member.member_id());
        assert_eq!(handle.commit(&tp, 4).await, Err(LogError::NotOwner(tp.clone())));
        assert!(matches!(handle.heartbeat().await, Err(LogError::MembershipLost(_))));
        assert_eq!(log.committed("g", &tp), Some(3));
    }

    #[tokio::test]
    async fn members_missing_heartbeats_are_expired() {
        let log = InMemoryLog::new(1);
        let group = log.consumer_group("g").with_session_timeout(Duration::from_millis(200));
        let quiet = group.join(&topics()).await.unwrap();
        let active = group.join(&topics()).await.unwrap();

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            active.handle().heartbeat().await.unwrap();
        }

        let members = log.members("g");
        assert!(!members.contains(&quiet.member_id().to_string()));
        assert!(members.contains(&active.member_id().to_string()));
        assert_eq!(
            log.owners("g").get(&TopicPartition::new("events_login", 0)),
            Some(&active.member_id().to_string())
        );
    }

    #[tokio::test]
    async fn rejoining_resumes_from_committed_offset() {
        let log = InMemoryLog::new(1);
        for payload in [b"a", b"b", b"c"] {
            log.append("events_login", b"u1", payload).await.unwrap();
        }
        let group = log.consumer_group("g");
        let mut member = group.join(&topics()).await.unwrap();
        let (tp, _) = next_assigned(&mut member).await;
        member.handle().commit(&tp, 2).await.unwrap();
        member.leave().await.unwrap();

        let mut member = group.join(&topics()).await.unwrap();
        let (_, mut stream) = next_assigned(&mut member).await;
        let message = stream.next().await.unwrap().unwrap();
        assert_eq!(message.coordinates.offset, 2);
    }
}
