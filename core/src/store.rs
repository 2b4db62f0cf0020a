//! Persistence boundary for events and user aggregates.
//!
//! The message processor is the only writer. It uses [`EventStore`] to
//! deduplicate on log coordinates and [`AggregateStore`] to fold events into
//! [`UserAggregate`]s. [`EventReader`] is the read-only side for reporting.
//!
//! # Atomic Apply
//!
//! [`AggregateStore::compare_and_swap`] does three things in one atomic step:
//!
//! 1. refuses if the event is already marked processed
//! 2. refuses if the stored aggregate version differs from `expected_version`
//! 3. otherwise writes the aggregate and marks the event processed
//!
//! A crash between inserting an event and applying it therefore leaves an
//! unprocessed record that the next delivery resumes, and a redelivery after a
//! successful apply is recognised as a duplicate.

use crate::aggregate::UserAggregate;
use crate::event::{Event, EventType};
use crate::log::LogCoordinates;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Store-assigned identifier of a persisted event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub i64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A persisted event with its log provenance.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredEvent {
    /// Store identifier
    pub id: EventId,
    /// The event as published
    pub event: Event,
    /// Where it was read from
    pub coordinates: LogCoordinates,
    /// Whether its aggregate update has been applied
    pub processed: bool,
    /// When the row was written
    pub created_at: DateTime<Utc>,
}

/// Minimal view of a stored event used for deduplication.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoredEventRef {
    /// Store identifier
    pub id: EventId,
    /// Whether its aggregate update has been applied
    pub processed: bool,
}

/// Result of [`EventStore::insert`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new record was written
    Inserted(EventId),
    /// A record with the same coordinates already existed
    Duplicate(StoredEventRef),
}

impl InsertOutcome {
    /// Identifier of the record, new or existing.
    #[must_use]
    pub const fn event_id(&self) -> EventId {
        match self {
            Self::Inserted(id) => *id,
            Self::Duplicate(existing) => existing.id,
        }
    }
}

/// A proposed aggregate write guarded by a version check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregateUpdate {
    /// Event being applied; marked processed on success
    pub event_id: EventId,
    /// Version the caller read, `None` if the aggregate did not exist
    pub expected_version: Option<i64>,
    /// Aggregate to store
    pub next: UserAggregate,
}

/// Result of [`AggregateStore::compare_and_swap`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CasOutcome {
    /// The aggregate was written and the event marked processed
    Applied(UserAggregate),
    /// The stored version moved since it was read
    Conflict,
    /// The event had already been applied
    AlreadyApplied,
}

/// A poison message kept for later inspection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetter {
    /// Where the message was read from
    pub coordinates: LogCoordinates,
    /// Raw message value
    pub payload: Option<Vec<u8>>,
    /// Why it could not be processed
    pub reason: String,
    /// When it was set aside
    pub failed_at: DateTime<Utc>,
}

/// Filter for [`EventReader::list_events`].
///
/// `from` is inclusive and `to` exclusive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventQuery {
    /// Only events of this user
    pub user_id: Option<String>,
    /// Only events of this type
    pub event_type: Option<EventType>,
    /// Lower bound on `occurred_at`
    pub from: Option<DateTime<Utc>>,
    /// Upper bound on `occurred_at`
    pub to: Option<DateTime<Utc>>,
    /// Maximum number of rows
    pub limit: usize,
}

impl Default for EventQuery {
    fn default() -> Self {
        Self {
            user_id: None,
            event_type: None,
            from: None,
            to: None,
            limit: 100,
        }
    }
}

impl EventQuery {
    /// Restrict to one user.
    #[must_use]
    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Restrict to one event type.
    #[must_use]
    pub const fn of_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    /// Restrict to `[from, to)`.
    #[must_use]
    pub const fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    /// Cap the result size.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Whether `stored` passes every filter.
    #[must_use]
    pub fn matches(&self, stored: &StoredEvent) -> bool {
        let event = &stored.event;
        self.user_id.as_deref().is_none_or(|u| u == event.user_id())
            && self.event_type.is_none_or(|t| t == event.event_type())
            && self.from.is_none_or(|from| event.occurred_at() >= from)
            && self.to.is_none_or(|to| event.occurred_at() < to)
    }
}

/// Errors raised by store implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached; worth retrying
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected the operation
    #[error("Database error: {0}")]
    Database(String),

    /// A stored value could not be converted
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Durable record of consumed events, unique per [`LogCoordinates`].
pub trait EventStore: Send + Sync {
    /// Look up the record written for `coordinates`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be queried.
    fn find_by_coordinates<'a>(
        &'a self,
        coordinates: &'a LogCoordinates,
    ) -> Pin<Box<dyn Future<Output = Result<Option<StoredEventRef>, StoreError>> + Send + 'a>>;

    /// Whether a record exists for `coordinates`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be queried.
    fn exists_by_coordinates<'a>(
        &'a self,
        coordinates: &'a LogCoordinates,
    ) -> Pin<Box<dyn Future<Output = Result<bool, StoreError>> + Send + 'a>> {
        Box::pin(async move { Ok(self.find_by_coordinates(coordinates).await?.is_some()) })
    }

    /// Write `event` under `coordinates` unless a record already exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    fn insert<'a>(
        &'a self,
        event: &'a Event,
        coordinates: &'a LogCoordinates,
    ) -> Pin<Box<dyn Future<Output = Result<InsertOutcome, StoreError>> + Send + 'a>>;

    /// Check that the store is reachable.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if it is not.
    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;
}

/// Per-user aggregate storage with optimistic concurrency.
pub trait AggregateStore: Send + Sync {
    /// Current aggregate for `user_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be queried.
    fn load<'a>(
        &'a self,
        user_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<UserAggregate>, StoreError>> + Send + 'a>>;

    /// Apply `update` atomically (see the module docs).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the transaction fails.
    fn compare_and_swap(
        &self,
        update: AggregateUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<CasOutcome, StoreError>> + Send + '_>>;
}

/// Destination for poison messages.
pub trait DeadLetterSink: Send + Sync {
    /// Keep `letter` for later inspection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if it cannot be written.
    fn record(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;
}

/// Read-only reporting queries.
pub trait EventReader: Send + Sync {
    /// Fetch one event by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be queried.
    fn get_event(
        &self,
        id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<StoredEvent>, StoreError>> + Send + '_>>;

    /// Events matching `query`, ordered by `occurred_at` then offset.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be queried.
    fn list_events<'a>(
        &'a self,
        query: &'a EventQuery,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StoredEvent>, StoreError>> + Send + 'a>>;

    /// Aggregate of one user.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be queried.
    fn get_user<'a>(
        &'a self,
        user_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<UserAggregate>, StoreError>> + Send + 'a>>;
}
