//! Idempotent application of log messages to the stores.
//!
//! For each message the [`MessageProcessor`]:
//!
//! 1. decodes the payload; undecodable messages are poison and handled per
//!    [`PoisonPolicy`] so the partition can move past them
//! 2. deduplicates on [`LogCoordinates`]: a processed record means the message
//!    is a redelivery; an unprocessed record means an earlier attempt stopped
//!    between insert and aggregate update and is resumed
//! 3. folds the event into its [`UserAggregate`] with a bounded
//!    compare-and-swap loop that also marks the event processed
//!
//! Transient store failures are retried with backoff. If the store stays
//! unavailable the processor returns [`ProcessError::StoreUnavailable`] and
//! the caller must not advance the checkpoint.

use crate::metrics::ProcessorMetrics;
use crate::retry::{RetryPolicy, retry_with_predicate};
use beacon_core::aggregate::UserAggregate;
use beacon_core::environment::{Clock, SystemClock};
use beacon_core::event::{DecodeError, Event, PropertyLimits};
use beacon_core::log::{LogCoordinates, LogMessage};
use beacon_core::store::{
    AggregateStore, AggregateUpdate, CasOutcome, DeadLetter, DeadLetterSink, EventId, EventStore,
    InsertOutcome, StoreError,
};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// What to do with a message that cannot be decoded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PoisonPolicy {
    /// Log a warning, count it and move on
    #[default]
    SkipAndAlert,
    /// Also keep the raw message in the dead-letter sink
    DeadLetter,
}

impl PoisonPolicy {
    /// Configuration name of the policy.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SkipAndAlert => "skip",
            Self::DeadLetter => "dead-letter",
        }
    }
}

impl fmt::Display for PoisonPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoisonPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "skip" => Ok(Self::SkipAndAlert),
            "dead-letter" => Ok(Self::DeadLetter),
            other => Err(format!("unknown poison policy '{other}', expected 'skip' or 'dead-letter'")),
        }
    }
}

/// Tuning for [`MessageProcessor`].
#[derive(Debug, Clone)]
pub struct ProcessorOptions {
    /// Poison message handling
    pub poison_policy: PoisonPolicy,
    /// Compare-and-swap attempts before an event is skipped as a race
    pub max_cas_attempts: usize,
    /// Backoff for transient store failures
    pub store_retry: RetryPolicy,
    /// Property bounds enforced on decode
    pub limits: PropertyLimits,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            poison_policy: PoisonPolicy::default(),
            max_cas_attempts: 5,
            store_retry: RetryPolicy::builder()
                .max_retries(5)
                .initial_delay(Duration::from_millis(100))
                .max_delay(Duration::from_secs(5))
                .build(),
            limits: PropertyLimits::default(),
        }
    }
}

/// How a message was handled. Every outcome allows the checkpoint to advance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Persisted and folded into the user aggregate
    Applied {
        /// Store id of the event
        event_id: EventId,
        /// Aggregate after the update
        aggregate: UserAggregate,
    },
    /// Already applied by an earlier delivery
    Duplicate,
    /// Could not be decoded
    Poisoned,
    /// Compare-and-swap attempts ran out; the event was not counted
    RaceSkipped,
}

impl ProcessOutcome {
    /// Metrics and log label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::Duplicate => "duplicate",
            Self::Poisoned => "poisoned",
            Self::RaceSkipped => "race_skipped",
        }
    }
}

/// Result of [`MessageProcessor::upsert_increment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The aggregate was written
    Applied(UserAggregate),
    /// The event had already been applied
    AlreadyApplied,
    /// Every attempt lost to a concurrent writer
    RaceDetected,
}

/// Failures that must stop the partition without committing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// The store stayed unavailable through every retry
    #[error("Store unavailable while processing {coordinates}: {source}")]
    StoreUnavailable {
        /// Message being processed
        coordinates: LogCoordinates,
        /// Last store error
        source: StoreError,
    },

    /// The store rejected an operation
    #[error("Store failed while processing {coordinates}: {source}")]
    Store {
        /// Message being processed
        coordinates: LogCoordinates,
        /// Store error
        source: StoreError,
    },
}

impl ProcessError {
    /// Message the failure happened on.
    #[must_use]
    pub const fn coordinates(&self) -> &LogCoordinates {
        match self {
            Self::StoreUnavailable { coordinates, .. } | Self::Store { coordinates, .. } => coordinates,
        }
    }
}

/// Sole writer of the event and aggregate stores.
#[derive(Clone)]
pub struct MessageProcessor {
    events: Arc<dyn EventStore>,
    aggregates: Arc<dyn AggregateStore>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    clock: Arc<dyn Clock>,
    options: ProcessorOptions,
}

impl MessageProcessor {
    /// Processor with default options and no dead-letter sink.
    #[must_use]
    pub fn new(events: Arc<dyn EventStore>, aggregates: Arc<dyn AggregateStore>) -> Self {
        Self {
            events,
            aggregates,
            dead_letters: None,
            clock: Arc::new(SystemClock),
            options: ProcessorOptions::default(),
        }
    }

    /// Sink used under [`PoisonPolicy::DeadLetter`].
    #[must_use]
    pub fn with_dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Replace the options.
    #[must_use]
    pub fn with_options(mut self, options: ProcessorOptions) -> Self {
        self.options = options;
        self
    }

    /// Clock used to timestamp dead letters.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Current options.
    #[must_use]
    pub const fn options(&self) -> &ProcessorOptions {
        &self.options
    }

    /// Apply one message exactly once in effect.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] when the stores cannot complete the work; the
    /// message must then be redelivered.
    pub async fn process(&self, message: &LogMessage) -> Result<ProcessOutcome, ProcessError> {
        let started = Instant::now();
        let coordinates = &message.coordinates;

        let event = match self.decode(message) {
            Ok(event) => event,
            Err(error) => return self.poisoned(message, &error).await,
        };

        let existing = self
            .with_retry("find_by_coordinates", coordinates, || {
                self.events.find_by_coordinates(coordinates)
            })
            .await?;

        let event_id = match existing {
            Some(stored) if stored.processed => return Ok(self.duplicate(coordinates)),
            Some(stored) => {
                tracing::debug!(
                    topic = %coordinates.topic,
                    partition = coordinates.partition,
                    offset = coordinates.offset,
                    event_id = %stored.id,
                    "Resuming event persisted by an earlier attempt"
                );
                stored.id
            }
            None => match self
                .with_retry("insert_event", coordinates, || self.events.insert(&event, coordinates))
                .await?
            {
                InsertOutcome::Inserted(id) => id,
                InsertOutcome::Duplicate(stored) if stored.processed => {
                    return Ok(self.duplicate(coordinates));
                }
                InsertOutcome::Duplicate(stored) => stored.id,
            },
        };

        match self.upsert_increment(event_id, &event, coordinates).await? {
            UpsertOutcome::Applied(aggregate) => {
                ProcessorMetrics::record_applied(started.elapsed());
                tracing::debug!(
                    topic = %coordinates.topic,
                    partition = coordinates.partition,
                    offset = coordinates.offset,
                    user_id = %aggregate.user_id,
                    total_event_count = aggregate.total_event_count,
                    "Event applied"
                );
                Ok(ProcessOutcome::Applied { event_id, aggregate })
            }
            UpsertOutcome::AlreadyApplied => Ok(self.duplicate(coordinates)),
            UpsertOutcome::RaceDetected => {
                ProcessorMetrics::record_race();
                tracing::error!(
                    topic = %coordinates.topic,
                    partition = coordinates.partition,
                    offset = coordinates.offset,
                    user_id = %event.user_id(),
                    attempts = self.options.max_cas_attempts,
                    "Aggregate race detected, skipping event"
                );
                Ok(ProcessOutcome::RaceSkipped)
            }
        }
    }

    /// Fold `event` into its user's aggregate, creating it if absent.
    ///
    /// Runs up to `max_cas_attempts` optimistic rounds of load, compute and
    /// compare-and-swap.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessError`] if the store fails through every retry.
    pub async fn upsert_increment(
        &self,
        event_id: EventId,
        event: &Event,
        coordinates: &LogCoordinates,
    ) -> Result<UpsertOutcome, ProcessError> {
        let user_id = event.user_id();

        for attempt in 1..=self.options.max_cas_attempts {
            let current = self
                .with_retry("load_aggregate", coordinates, || self.aggregates.load(user_id))
                .await?;

            let update = AggregateUpdate {
                event_id,
                expected_version: current.as_ref().map(|a| a.version),
                next: current.as_ref().map_or_else(
                    || UserAggregate::first(user_id, event.occurred_at()),
                    |a| a.applied(event.occurred_at()),
                ),
            };

            let outcome = self
                .with_retry("compare_and_swap", coordinates, || {
                    self.aggregates.compare_and_swap(update.clone())
                })
                .await?;

            match outcome {
                CasOutcome::Applied(aggregate) => return Ok(UpsertOutcome::Applied(aggregate)),
                CasOutcome::AlreadyApplied => return Ok(UpsertOutcome::AlreadyApplied),
                CasOutcome::Conflict => {
                    tracing::debug!(user_id = %user_id, attempt, "Aggregate version moved, retrying");
                }
            }
        }

        Ok(UpsertOutcome::RaceDetected)
    }

    fn decode(&self, message: &LogMessage) -> Result<Event, DecodeError> {
        let payload = message.payload.as_deref().ok_or(DecodeError::MissingPayload)?;
        Event::decode(payload, &self.options.limits)
    }

    fn duplicate(&self, coordinates: &LogCoordinates) -> ProcessOutcome {
        ProcessorMetrics::record_duplicate();
        tracing::debug!(
            topic = %coordinates.topic,
            partition = coordinates.partition,
            offset = coordinates.offset,
            "Duplicate delivery absorbed"
        );
        ProcessOutcome::Duplicate
    }

    async fn poisoned(
        &self,
        message: &LogMessage,
        error: &DecodeError,
    ) -> Result<ProcessOutcome, ProcessError> {
        let coordinates = &message.coordinates;
        let policy = self.options.poison_policy;

        match (policy, &self.dead_letters) {
            (PoisonPolicy::DeadLetter, Some(sink)) => {
                let letter = DeadLetter {
                    coordinates: coordinates.clone(),
                    payload: message.payload.clone(),
                    reason: error.to_string(),
                    failed_at: self.clock.now(),
                };
                self.with_retry("record_dead_letter", coordinates, || sink.record(letter.clone()))
                    .await?;
                tracing::warn!(
                    topic = %coordinates.topic,
                    partition = coordinates.partition,
                    offset = coordinates.offset,
                    error = %error,
                    "Poison message moved to dead-letter queue"
                );
            }
            _ => {
                tracing::warn!(
                    topic = %coordinates.topic,
                    partition = coordinates.partition,
                    offset = coordinates.offset,
                    error = %error,
                    "Skipping poison message"
                );
            }
        }

        ProcessorMetrics::record_poison(policy.as_str());
        Ok(ProcessOutcome::Poisoned)
    }

    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        coordinates: &LogCoordinates,
        call: F,
    ) -> Result<T, ProcessError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        retry_with_predicate(&self.options.store_retry, operation, call, StoreError::is_transient)
            .await
            .map_err(|source| {
                if source.is_transient() {
                    ProcessError::StoreUnavailable {
                        coordinates: coordinates.clone(),
                        source,
                    }
                } else {
                    ProcessError::Store {
                        coordinates: coordinates.clone(),
                        source,
                    }
                }
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use beacon_core::environment::Clock as _;
    use beacon_core::event::{EventInput, EventType};
    use beacon_core::store::EventStore as _;
    use beacon_testing::{InMemoryStore, test_clock};

    fn fast_options() -> ProcessorOptions {
        ProcessorOptions {
            store_retry: RetryPolicy::builder()
                .max_retries(3)
                .initial_delay(Duration::from_millis(1))
                .jitter(false)
                .build(),
            ..ProcessorOptions::default()
        }
    }

    fn processor(store: &InMemoryStore) -> MessageProcessor {
        let store = Arc::new(store.clone());
        MessageProcessor::new(store.clone(), store.clone())
            .with_dead_letters(store)
            .with_options(fast_options())
    }

    fn message(user: &str, offset: i64) -> LogMessage {
        let event = EventInput::new(EventType::PageView, user).into_event(test_clock().now());
        LogMessage {
            coordinates: LogCoordinates::new("events_page_view", 0, offset),
            key: Some(user.as_bytes().to_vec()),
            payload: Some(event.encode().unwrap()),
        }
    }

    #[tokio::test]
    async fn applies_new_event() {
        let store = InMemoryStore::new();
        let outcome = processor(&store).process(&message("u1", 0)).await.unwrap();

        let ProcessOutcome::Applied { aggregate, .. } = outcome else {
            panic!("expected applied, got {outcome:?}");
        };
        assert_eq!(aggregate.total_event_count, 1);
        assert_eq!(store.event_count(), 1);
        assert_eq!(store.unprocessed_count(), 0);
    }

    #[tokio::test]
    async fn redelivery_is_a_duplicate() {
        let store = InMemoryStore::new();
        let processor = processor(&store);
        let msg = message("u1", 0);

        processor.process(&msg).await.unwrap();
        assert_eq!(processor.process(&msg).await.unwrap(), ProcessOutcome::Duplicate);
        assert_eq!(store.event_count(), 1);
        assert_eq!(store.aggregate("u1").unwrap().total_event_count, 1);
    }

    #[tokio::test]
    async fn resumes_event_left_unprocessed() {
        let store = InMemoryStore::new();
        let msg = message("u1", 0);
        let event = Event::decode(msg.payload.as_deref().unwrap(), &PropertyLimits::default()).unwrap();
        store.insert(&event, &msg.coordinates).await.unwrap();
        assert_eq!(store.unprocessed_count(), 1);

        let outcome = processor(&store).process(&msg).await.unwrap();
        assert_eq!(outcome.as_str(), "applied");
        assert_eq!(store.event_count(), 1);
        assert_eq!(store.unprocessed_count(), 0);
    }

    #[tokio::test]
    async fn poison_is_skipped_by_default() {
        let store = InMemoryStore::new();
        let store_arc = Arc::new(store.clone());
        let processor = MessageProcessor::new(store_arc.clone(), store_arc).with_options(fast_options());
        let msg = LogMessage {
            coordinates: LogCoordinates::new("events_page_view", 0, 0),
            key: None,
            payload: Some(b"{not json".to_vec()),
        };

        assert_eq!(processor.process(&msg).await.unwrap(), ProcessOutcome::Poisoned);
        assert_eq!(store.event_count(), 0);
        assert!(store.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn poison_goes_to_dead_letters_when_configured() {
        let store = InMemoryStore::new();
        let processor = processor(&store).with_options(ProcessorOptions {
            poison_policy: PoisonPolicy::DeadLetter,
            ..fast_options()
        });
        let msg = LogMessage {
            coordinates: LogCoordinates::new("events_page_view", 0, 3),
            key: None,
            payload: None,
        };

        assert_eq!(processor.process(&msg).await.unwrap(), ProcessOutcome::Poisoned);
        let letters = store.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].coordinates.offset, 3);
    }

    #[tokio::test]
    async fn single_conflict_is_retried() {
        let store = InMemoryStore::new();
        store.conflict_next_cas(1);

        let outcome = processor(&store).process(&message("u1", 0)).await.unwrap();
        assert_eq!(outcome.as_str(), "applied");
        assert_eq!(store.aggregate("u1").unwrap().version, 1);
    }

    #[tokio::test]
    async fn persistent_conflicts_skip_the_event() {
        let store = InMemoryStore::new();
        store.conflict_next_cas(5);

        let outcome = processor(&store).process(&message("u1", 0)).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::RaceSkipped);
        assert!(store.aggregate("u1").is_none());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let store = InMemoryStore::new();
        store.fail_next(2);

        let outcome = processor(&store).process(&message("u1", 0)).await.unwrap();
        assert_eq!(outcome.as_str(), "applied");
    }

    #[tokio::test]
    async fn outage_surfaces_store_unavailable() {
        let store = InMemoryStore::new();
        store.set_available(false);

        let err = processor(&store).process(&message("u1", 7)).await.unwrap_err();
        assert!(matches!(err, ProcessError::StoreUnavailable { .. }));
        assert_eq!(err.coordinates().offset, 7);
    }

    #[test]
    fn poison_policy_parses() {
        assert_eq!("skip".parse::<PoisonPolicy>().unwrap(), PoisonPolicy::SkipAndAlert);
        assert_eq!("dead-letter".parse::<PoisonPolicy>().unwrap(), PoisonPolicy::DeadLetter);
        assert!("drop".parse::<PoisonPolicy>().is_err());
    }
}
