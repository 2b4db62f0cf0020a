//! In-memory event and aggregate store.
//!
//! [`InMemoryStore`] implements every persistence trait of `beacon-core`
//! under one lock, so the atomic apply step is trivially atomic. It also
//! carries the hooks pipeline tests need:
//!
//! - outage and failure injection ([`InMemoryStore::set_available`],
//!   [`InMemoryStore::fail_next`])
//! - optimistic-concurrency conflicts ([`InMemoryStore::conflict_next_cas`])
//! - injected latency on inserts, with a probe that records how many inserts
//!   for the same partition ever overlapped

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use beacon_core::aggregate::UserAggregate;
use beacon_core::event::Event;
use beacon_core::log::{LogCoordinates, TopicPartition};
use beacon_core::store::{
    AggregateStore, AggregateUpdate, CasOutcome, DeadLetter, DeadLetterSink, EventId, EventQuery,
    EventReader, EventStore, InsertOutcome, StoreError, StoredEvent, StoredEventRef,
};
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct StoreState {
    events: Vec<StoredEvent>,
    by_coordinates: HashMap<LogCoordinates, EventId>,
    aggregates: HashMap<String, UserAggregate>,
    dead_letters: Vec<DeadLetter>,
}

#[derive(Default)]
struct PartitionProbe {
    current: usize,
    max: usize,
}

struct Faults {
    available: AtomicBool,
    fail_next: AtomicUsize,
    conflict_next_cas: AtomicUsize,
    insert_latency: Mutex<Duration>,
    probes: Mutex<HashMap<TopicPartition, PartitionProbe>>,
}

impl Default for Faults {
    fn default() -> Self {
        Self {
            available: AtomicBool::new(true),
            fail_next: AtomicUsize::new(0),
            conflict_next_cas: AtomicUsize::new(0),
            insert_latency: Mutex::new(Duration::ZERO),
            probes: Mutex::new(HashMap::new()),
        }
    }
}

impl Faults {
    fn check(&self) -> Result<(), StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is down".to_string()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

struct ProbeGuard<'a> {
    faults: &'a Faults,
    tp: TopicPartition,
}

impl<'a> ProbeGuard<'a> {
    fn enter(faults: &'a Faults, tp: TopicPartition) -> Self {
        let mut probes = faults.probes.lock().unwrap();
        let probe = probes.entry(tp.clone()).or_default();
        probe.current += 1;
        probe.max = probe.max.max(probe.current);
        drop(probes);
        Self { faults, tp }
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        let mut probes = self.faults.probes.lock().unwrap();
        if let Some(probe) = probes.get_mut(&self.tp) {
            probe.current = probe.current.saturating_sub(1);
        }
    }
}

/// Shared in-memory store; clones see the same data.
///
/// # Example
///
/// ```
/// use beacon_core::event::{EventInput, EventType};
/// use beacon_core::log::LogCoordinates;
/// use beacon_core::store::{EventStore, InsertOutcome};
/// use beacon_testing::InMemoryStore;
/// use chrono::Utc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryStore::new();
/// let event = EventInput::new(EventType::Login, "u1").into_event(Utc::now());
/// let coords = LogCoordinates::new("events_login", 0, 0);
///
/// assert!(matches!(store.insert(&event, &coords).await?, InsertOutcome::Inserted(_)));
/// assert!(matches!(store.insert(&event, &coords).await?, InsertOutcome::Duplicate(_)));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
    faults: Arc<Faults>,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.faults.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next `count` operations with [`StoreError::Unavailable`].
    pub fn fail_next(&self, count: usize) {
        self.faults.fail_next.store(count, Ordering::SeqCst);
    }

    /// Answer the next `count` compare-and-swap calls with a conflict.
    pub fn conflict_next_cas(&self, count: usize) {
        self.faults.conflict_next_cas.store(count, Ordering::SeqCst);
    }

    /// Delay every insert by `latency`.
    pub fn set_insert_latency(&self, latency: Duration) {
        *self.faults.insert_latency.lock().unwrap() = latency;
    }

    /// Highest number of overlapping inserts ever seen for one partition.
    #[must_use]
    pub fn max_partition_concurrency(&self) -> usize {
        self.faults
            .probes
            .lock()
            .unwrap()
            .values()
            .map(|p| p.max)
            .max()
            .unwrap_or(0)
    }

    /// Every stored event, in insertion order.
    #[must_use]
    pub fn events(&self) -> Vec<StoredEvent> {
        self.state.lock().unwrap().events.clone()
    }

    /// Number of stored events.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.state.lock().unwrap().events.len()
    }

    /// Stored events of one user, in insertion order.
    #[must_use]
    pub fn events_for(&self, user_id: &str) -> Vec<StoredEvent> {
        self.state
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.event.user_id() == user_id)
            .cloned()
            .collect()
    }

    /// Current aggregate of one user.
    #[must_use]
    pub fn aggregate(&self, user_id: &str) -> Option<UserAggregate> {
        self.state.lock().unwrap().aggregates.get(user_id).cloned()
    }

    /// Every recorded dead letter.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().unwrap().dead_letters.clone()
    }

    /// Stored events whose aggregate update is still pending.
    #[must_use]
    pub fn unprocessed_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| !e.processed)
            .count()
    }
}

fn index(id: EventId) -> Option<usize> {
    usize::try_from(id.0).ok()?.checked_sub(1)
}

impl EventStore for InMemoryStore {
    fn find_by_coordinates<'a>(
        &'a self,
        coordinates: &'a LogCoordinates,
    ) -> Pin<Box<dyn Future<Output = Result<Option<StoredEventRef>, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            self.faults.check()?;
            let state = self.state.lock().unwrap();
            Ok(state.by_coordinates.get(coordinates).and_then(|id| {
                let stored = state.events.get(index(*id)?)?;
                Some(StoredEventRef {
                    id: *id,
                    processed: stored.processed,
                })
            }))
        })
    }

    fn insert<'a>(
        &'a self,
        event: &'a Event,
        coordinates: &'a LogCoordinates,
    ) -> Pin<Box<dyn Future<Output = Result<InsertOutcome, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let _probe = ProbeGuard::enter(&self.faults, coordinates.topic_partition());
            let latency = *self.faults.insert_latency.lock().unwrap();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            self.faults.check()?;

            let mut state = self.state.lock().unwrap();
            if let Some(id) = state.by_coordinates.get(coordinates).copied() {
                let processed = state.events.get(index(id).unwrap_or(usize::MAX)).is_some_and(|e| e.processed);
                return Ok(InsertOutcome::Duplicate(StoredEventRef { id, processed }));
            }

            let id = EventId(i64::try_from(state.events.len()).unwrap_or(i64::MAX) + 1);
            state.events.push(StoredEvent {
                id,
                event: event.clone(),
                coordinates: coordinates.clone(),
                processed: false,
                created_at: Utc::now(),
            });
            state.by_coordinates.insert(coordinates.clone(), id);
            Ok(InsertOutcome::Inserted(id))
        })
    }

    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move {
            if self.faults.available.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(StoreError::Unavailable("store is down".to_string()))
            }
        })
    }
}

impl AggregateStore for InMemoryStore {
    fn load<'a>(
        &'a self,
        user_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<UserAggregate>, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            self.faults.check()?;
            Ok(self.state.lock().unwrap().aggregates.get(user_id).cloned())
        })
    }

    fn compare_and_swap(
        &self,
        update: AggregateUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<CasOutcome, StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.faults.check()?;
            let mut state = self.state.lock().unwrap();

            let slot = index(update.event_id).filter(|i| *i < state.events.len()).ok_or_else(|| {
                StoreError::Database(format!("event {} does not exist", update.event_id))
            })?;
            if state.events[slot].processed {
                return Ok(CasOutcome::AlreadyApplied);
            }

            let injected_conflict = self
                .faults
                .conflict_next_cas
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            let stored_version = state.aggregates.get(&update.next.user_id).map(|a| a.version);
            if injected_conflict || stored_version != update.expected_version {
                return Ok(CasOutcome::Conflict);
            }

            state
                .aggregates
                .insert(update.next.user_id.clone(), update.next.clone());
            state.events[slot].processed = true;
            Ok(CasOutcome::Applied(update.next))
        })
    }
}

impl DeadLetterSink for InMemoryStore {
    fn record(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.faults.check()?;
            self.state.lock().unwrap().dead_letters.push(letter);
            Ok(())
        })
    }
}

impl EventReader for InMemoryStore {
    fn get_event(
        &self,
        id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<StoredEvent>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.faults.check()?;
            let state = self.state.lock().unwrap();
            Ok(index(id).and_then(|i| state.events.get(i)).cloned())
        })
    }

    fn list_events<'a>(
        &'a self,
        query: &'a EventQuery,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StoredEvent>, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            self.faults.check()?;
            let mut matching: Vec<StoredEvent> = self
                .state
                .lock()
                .unwrap()
                .events
                .iter()
                .filter(|e| query.matches(e))
                .cloned()
                .collect();
            matching.sort_by(|a, b| {
                a.event
                    .occurred_at()
                    .cmp(&b.event.occurred_at())
                    .then(a.coordinates.offset.cmp(&b.coordinates.offset))
            });
            matching.truncate(query.limit);
            Ok(matching)
        })
    }

    fn get_user<'a>(
        &'a self,
        user_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<UserAggregate>, StoreError>> + Send + 'a>> {
        self.load(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::event::{EventInput, EventType};

    fn event(user: &str) -> Event {
        EventInput::new(EventType::Click, user).into_event(Utc::now())
    }

    #[tokio::test]
    async fn cas_marks_event_processed_once() {
        let store = InMemoryStore::new();
        let e = event("u1");
        let coords = LogCoordinates::new("events_click", 0, 0);
        let id = store.insert(&e, &coords).await.unwrap().event_id();

        let update = AggregateUpdate {
            event_id: id,
            expected_version: None,
            next: UserAggregate::first("u1", e.occurred_at()),
        };
        assert!(matches!(
            store.compare_and_swap(update.clone()).await.unwrap(),
            CasOutcome::Applied(_)
        ));
        assert_eq!(
            store.compare_and_swap(update).await.unwrap(),
            CasOutcome::AlreadyApplied
        );
        assert_eq!(store.find_by_coordinates(&coords).await.unwrap().map(|r| r.processed), Some(true));
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let store = InMemoryStore::new();
        let e = event("u1");
        let first = store.insert(&e, &LogCoordinates::new("t", 0, 0)).await.unwrap().event_id();
        let second = store.insert(&e, &LogCoordinates::new("t", 0, 1)).await.unwrap().event_id();
        let agg = UserAggregate::first("u1", e.occurred_at());

        store
            .compare_and_swap(AggregateUpdate { event_id: first, expected_version: None, next: agg.clone() })
            .await
            .unwrap();
        let outcome = store
            .compare_and_swap(AggregateUpdate { event_id: second, expected_version: None, next: agg })
            .await
            .unwrap();
        assert_eq!(outcome, CasOutcome::Conflict);
    }

    #[tokio::test]
    async fn outages_surface_as_unavailable() {
        let store = InMemoryStore::new();
        store.set_available(false);
        let err = store.load("u1").await.unwrap_err();
        assert!(err.is_transient());

        store.set_available(true);
        store.fail_next(1);
        assert!(store.load("u1").await.is_err());
        assert!(store.load("u1").await.is_ok());
    }

    #[tokio::test]
    async fn list_events_filters_and_orders() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let later = EventInput::new(EventType::Login, "u1").into_event(now + chrono::TimeDelta::seconds(5));
        let earlier = EventInput::new(EventType::Login, "u1").into_event(now);
        store.insert(&later, &LogCoordinates::new("events_login", 0, 0)).await.unwrap();
        store.insert(&earlier, &LogCoordinates::new("events_login", 0, 1)).await.unwrap();
        store.insert(&event("u2"), &LogCoordinates::new("events_click", 0, 0)).await.unwrap();

        let listed = store
            .list_events(&EventQuery::default().for_user("u1"))
            .await
            .unwrap();
        let offsets: Vec<i64> = listed.iter().map(|e| e.coordinates.offset).collect();
        assert_eq!(offsets, vec![1, 0]);
    }
}
