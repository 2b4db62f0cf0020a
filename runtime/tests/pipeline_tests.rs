//! End-to-end pipeline tests against the in-memory log and store.
//!
//! Workers run as real tokio tasks with short heartbeat and session timeouts
//! so rebalances and expiry are exercised in well under a second.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use beacon_core::environment::Clock;
use beacon_core::event::{EventInput, EventType, Properties};
use beacon_core::log::TopicPartition;
use beacon_runtime::processor::{MessageProcessor, PoisonPolicy, ProcessOutcome, ProcessorOptions};
use beacon_runtime::publisher::Publisher;
use beacon_runtime::retry::RetryPolicy;
use beacon_runtime::worker::{Worker, WorkerError, WorkerOptions, WorkerState};
use beacon_testing::{FixedClock, InMemoryLog, InMemoryStore, init_tracing, test_clock};
use chrono::TimeDelta;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const GROUP: &str = "analytics-group";
const PARTITIONS: i32 = 2;
const SESSION_TIMEOUT: Duration = Duration::from_millis(200);

struct Pipeline {
    log: InMemoryLog,
    store: InMemoryStore,
    clock: FixedClock,
    publisher: Publisher,
}

impl Pipeline {
    fn new() -> Self {
        init_tracing();
        let log = InMemoryLog::new(PARTITIONS);
        let clock = test_clock();
        let publisher = Publisher::new(Arc::new(log.clone())).with_clock(Arc::new(clock.clone()));
        Self {
            log,
            store: InMemoryStore::new(),
            clock,
            publisher,
        }
    }

    /// Publish one event, one second after the previous one.
    async fn publish(&self, event_type: EventType, user_id: &str) {
        self.clock.advance(TimeDelta::seconds(1));
        self.publisher
            .publish(EventInput::new(event_type, user_id))
            .await
            .unwrap();
    }

    fn processor(&self) -> MessageProcessor {
        let store = Arc::new(self.store.clone());
        MessageProcessor::new(store.clone(), store.clone())
            .with_dead_letters(store)
            .with_options(ProcessorOptions {
                store_retry: RetryPolicy::constant(2, Duration::from_millis(5)),
                ..ProcessorOptions::default()
            })
    }

    fn spawn_worker(&self, options: WorkerOptions) -> RunningWorker {
        self.spawn_worker_with(self.processor(), options)
    }

    fn spawn_worker_with(&self, processor: MessageProcessor, options: WorkerOptions) -> RunningWorker {
        let group = self.log.consumer_group(GROUP).with_session_timeout(SESSION_TIMEOUT);
        let worker = Worker::new(Arc::new(group), processor).with_options(options);
        let state = worker.state();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move { worker.run(shutdown_rx).await });
        RunningWorker {
            shutdown,
            state,
            task,
        }
    }

    /// Partitions of every topic that received at least one message.
    fn used_partitions(&self) -> Vec<TopicPartition> {
        EventType::ALL
            .iter()
            .flat_map(|t| (0..PARTITIONS).map(move |p| TopicPartition::new(t.topic(), p)))
            .filter(|tp| !self.log.messages(&tp.topic, tp.partition).is_empty())
            .collect()
    }

    /// Whether every published message is covered by a committed checkpoint.
    fn fully_committed(&self) -> bool {
        self.used_partitions().iter().all(|tp| {
            let len = self.log.messages(&tp.topic, tp.partition).len();
            self.log.committed(GROUP, tp) == Some(i64::try_from(len).unwrap())
        })
    }

    fn distinct_owners(&self) -> HashSet<String> {
        self.log.owners(GROUP).into_values().collect()
    }
}

struct RunningWorker {
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<WorkerState>,
    task: JoinHandle<Result<(), WorkerError>>,
}

impl RunningWorker {
    async fn stop(self) -> Result<(), WorkerError> {
        self.shutdown.send_replace(true);
        self.task.await.unwrap()
    }

    /// Simulate a crash: no leave, no final commit.
    async fn crash(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

fn options() -> WorkerOptions {
    WorkerOptions {
        heartbeat_interval: Duration::from_millis(20),
        session_timeout: SESSION_TIMEOUT,
        join_retry: RetryPolicy::constant(50, Duration::from_millis(10)),
        rejoin_delay: Duration::from_millis(20),
        ..WorkerOptions::default()
    }
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn example_scenario_counts_each_event_once() {
    let pipeline = Pipeline::new();
    pipeline.publish(EventType::PageView, "u1").await;
    pipeline.publish(EventType::Click, "u1").await;
    pipeline.publish(EventType::PageView, "u2").await;

    let worker = pipeline.spawn_worker(options());
    eventually("three events", || pipeline.store.event_count() == 3).await;
    eventually("checkpoints", || pipeline.fully_committed()).await;

    assert_eq!(pipeline.store.aggregate("u1").unwrap().total_event_count, 2);
    assert_eq!(pipeline.store.aggregate("u2").unwrap().total_event_count, 1);

    let page_view = pipeline
        .store
        .events_for("u1")
        .into_iter()
        .find(|e| e.event.event_type() == EventType::PageView)
        .unwrap()
        .coordinates;
    let redelivered = pipeline
        .log
        .messages(&page_view.topic, page_view.partition)
        .into_iter()
        .find(|m| m.coordinates == page_view)
        .unwrap();
    let outcome = pipeline.processor().process(&redelivered).await.unwrap();

    assert_eq!(outcome, ProcessOutcome::Duplicate);
    assert_eq!(pipeline.store.aggregate("u1").unwrap().total_event_count, 2);
    assert_eq!(pipeline.store.event_count(), 3);
    worker.stop().await.unwrap();
}

#[tokio::test]
async fn per_user_order_is_preserved_across_workers() {
    let pipeline = Pipeline::new();
    let first = pipeline.spawn_worker(options());
    let second = pipeline.spawn_worker(options());
    eventually("both members", || pipeline.log.members(GROUP).len() == 2).await;

    let users = ["u1", "u2", "u3", "u4", "u5"];
    for _ in 0..10 {
        for user in users {
            pipeline.publish(EventType::PageView, user).await;
        }
    }

    eventually("fifty events", || pipeline.store.event_count() == 50).await;
    for user in users {
        let stored = pipeline.store.events_for(user);
        assert_eq!(stored.len(), 10);
        assert!(
            stored.windows(2).all(|w| w[0].event.occurred_at() < w[1].event.occurred_at()),
            "events of {user} stored out of order"
        );
        assert!(stored.windows(2).all(|w| w[0].coordinates.offset < w[1].coordinates.offset));
    }

    first.stop().await.unwrap();
    second.stop().await.unwrap();
}

#[tokio::test]
async fn aggregates_match_event_history() {
    let pipeline = Pipeline::new();
    let worker = pipeline.spawn_worker(WorkerOptions {
        max_in_flight: 4,
        ..options()
    });

    let mut expected_last = std::collections::HashMap::new();
    for i in 0..30 {
        let user = ["alice", "bob", "carol"][i % 3];
        let event_type = EventType::ALL[i % EventType::ALL.len()];
        pipeline.publish(event_type, user).await;
        expected_last.insert(user, pipeline.clock.now());
    }

    eventually("all aggregates", || {
        ["alice", "bob", "carol"]
            .iter()
            .all(|u| pipeline.store.aggregate(u).is_some_and(|a| a.total_event_count == 10))
    })
    .await;

    for (user, last) in expected_last {
        let aggregate = pipeline.store.aggregate(user).unwrap();
        assert_eq!(aggregate.last_seen_at, last);
        assert!(aggregate.first_seen_at < aggregate.last_seen_at);
    }
    assert_eq!(pipeline.store.unprocessed_count(), 0);
    worker.stop().await.unwrap();
}

#[tokio::test]
async fn poison_message_does_not_block_partition() {
    let pipeline = Pipeline::new();
    let poison = pipeline
        .log
        .append_raw("events_click", b"u1", Some(b"{not json".to_vec()));
    pipeline.publish(EventType::Click, "u1").await;

    let processor = pipeline.processor().with_options(ProcessorOptions {
        poison_policy: PoisonPolicy::DeadLetter,
        ..ProcessorOptions::default()
    });
    let worker = pipeline.spawn_worker_with(processor, options());

    eventually("event after poison", || {
        pipeline.store.aggregate("u1").is_some_and(|a| a.total_event_count == 1)
    })
    .await;
    eventually("checkpoint past poison", || {
        pipeline.log.committed(GROUP, &poison.topic_partition()) == Some(poison.offset + 2)
    })
    .await;

    let dead_letters = pipeline.store.dead_letters();
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters[0].coordinates, poison);
    worker.stop().await.unwrap();
}

#[tokio::test]
async fn partitions_rebalance_on_join_and_leave() {
    let pipeline = Pipeline::new();
    let total = EventType::ALL.len() * usize::try_from(PARTITIONS).unwrap();

    let first = pipeline.spawn_worker(options());
    eventually("first owns everything", || {
        pipeline.log.owners(GROUP).len() == total && pipeline.distinct_owners().len() == 1
    })
    .await;

    let second = pipeline.spawn_worker(options());
    eventually("split between two members", || {
        pipeline.log.owners(GROUP).len() == total && pipeline.distinct_owners().len() == 2
    })
    .await;

    second.stop().await.unwrap();
    eventually("first owns everything again", || {
        pipeline.log.owners(GROUP).len() == total && pipeline.distinct_owners().len() == 1
    })
    .await;

    pipeline.publish(EventType::Signup, "u9").await;
    eventually("processed after leave", || pipeline.store.event_count() == 1).await;
    first.stop().await.unwrap();
}

#[tokio::test]
async fn rebalancing_never_overlaps_partition_processing() {
    let pipeline = Pipeline::new();
    pipeline.store.set_insert_latency(Duration::from_millis(2));
    for i in 0..60 {
        let user = format!("user-{}", i % 7);
        pipeline.publish(EventType::Purchase, &user).await;
    }

    let first = pipeline.spawn_worker(options());
    eventually("some progress", || pipeline.store.event_count() >= 10).await;
    let second = pipeline.spawn_worker(options());
    eventually("more progress", || pipeline.store.event_count() >= 30).await;
    first.stop().await.unwrap();

    eventually("all events", || pipeline.store.event_count() == 60).await;
    assert_eq!(pipeline.store.max_partition_concurrency(), 1);
    second.stop().await.unwrap();
}

#[tokio::test]
async fn crashed_member_is_expired_and_its_work_redelivered() {
    let pipeline = Pipeline::new();
    for i in 0..10 {
        pipeline.publish(EventType::Login, &format!("user-{}", i % 3)).await;
    }

    let crashed = pipeline.spawn_worker(WorkerOptions {
        commit_every: 1_000,
        ..options()
    });
    eventually("first pass", || pipeline.store.event_count() == 10).await;
    crashed.crash().await;
    assert!(!pipeline.fully_committed());

    let survivor = pipeline.spawn_worker(options());
    eventually("crashed member expired", || pipeline.log.members(GROUP).len() == 1).await;
    eventually("redelivered work committed", || pipeline.fully_committed()).await;

    assert_eq!(pipeline.store.event_count(), 10);
    let counted: u64 = (0..3)
        .map(|i| pipeline.store.aggregate(&format!("user-{i}")).unwrap().total_event_count)
        .sum();
    assert_eq!(counted, 10);
    survivor.stop().await.unwrap();
}

#[tokio::test]
async fn shutdown_finishes_in_flight_work_and_leaves() {
    let pipeline = Pipeline::new();
    for _ in 0..5 {
        pipeline.publish(EventType::PageView, "u1").await;
    }

    let mut worker = pipeline.spawn_worker(WorkerOptions {
        commit_every: 100,
        ..options()
    });
    worker
        .state
        .wait_for(|s| *s == WorkerState::Processing)
        .await
        .unwrap();
    eventually("five events", || pipeline.store.event_count() == 5).await;

    let mut state = worker.state.clone();
    worker.stop().await.unwrap();

    let tp = TopicPartition::new("events_page_view", pipeline.log.partition_for(b"u1"));
    assert_eq!(pipeline.log.committed(GROUP, &tp), Some(5));
    assert!(pipeline.log.members(GROUP).is_empty());
    assert_eq!(*state.borrow_and_update(), WorkerState::Disconnected);
}

#[tokio::test]
async fn store_outage_halts_then_recovers_without_loss() {
    let pipeline = Pipeline::new();
    pipeline.store.set_available(false);
    pipeline.publish(EventType::Signup, "u1").await;
    let tp = TopicPartition::new("events_signup", pipeline.log.partition_for(b"u1"));

    let worker = pipeline.spawn_worker(options());
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(pipeline.store.event_count(), 0);
    assert_eq!(pipeline.log.committed(GROUP, &tp), None);

    pipeline.store.set_available(true);
    eventually("processed after recovery", || {
        pipeline.store.aggregate("u1").is_some_and(|a| a.total_event_count == 1)
    })
    .await;
    eventually("committed after recovery", || pipeline.log.committed(GROUP, &tp) == Some(1)).await;

    worker.stop().await.unwrap();
}

#[tokio::test]
async fn publish_rejects_invalid_properties() {
    let pipeline = Pipeline::new();
    let mut nested = serde_json::json!("leaf");
    for _ in 0..12 {
        nested = serde_json::json!({ "inner": nested });
    }
    let err = pipeline
        .publisher
        .publish(
            EventInput::new(EventType::Click, "u1")
                .with_properties(Properties::new().with("deep", nested)),
        )
        .await
        .unwrap_err();

    assert_eq!(err.reason(), "rejected");
    assert!(pipeline.used_partitions().is_empty());
}

#[tokio::test]
async fn connection_loss_lets_in_flight_message_finish() {
    let pipeline = Pipeline::new();
    pipeline.store.set_insert_latency(Duration::from_millis(400));
    pipeline.publish(EventType::PageView, "u1").await;
    let tp = TopicPartition::new("events_page_view", pipeline.log.partition_for(b"u1"));

    let mut worker = pipeline.spawn_worker(WorkerOptions {
        join_retry: RetryPolicy::constant(500, Duration::from_millis(10)),
        ..options()
    });
    worker
        .state
        .wait_for(|s| *s == WorkerState::Processing)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    pipeline.log.set_connected(false);

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(pipeline.store.event_count(), 1);
    assert_eq!(pipeline.log.committed(GROUP, &tp), None);

    pipeline.log.set_connected(true);
    eventually("committed after reconnect", || pipeline.log.committed(GROUP, &tp) == Some(1)).await;
    assert_eq!(pipeline.store.event_count(), 1);
    assert_eq!(pipeline.store.aggregate("u1").unwrap().total_event_count, 1);

    worker.stop().await.unwrap();
}
