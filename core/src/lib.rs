//! # Beacon Core
//!
//! Domain types and boundary traits for the Beacon behavioral event pipeline.
//!
//! ```text
//!  EventInput ──► Publisher ──► EventLog ──► topic events_<type>, key user_id
//!                                                │
//!                                                ▼
//!                  ConsumerGroup ──► GroupMembership ──► partition streams
//!                                                │
//!                                                ▼
//!                        MessageProcessor ──► EventStore + AggregateStore
//! ```
//!
//! This crate does no I/O. Implementations live in `beacon-redpanda`,
//! `beacon-postgres` and `beacon-testing`; the processing loop lives in
//! `beacon-runtime`.
//!
//! ## Modules
//!
//! - [`event`]: events, properties and the JSON wire format
//! - [`aggregate`]: per-user rollups and status derivation
//! - [`log`]: partitioned log and consumer-group traits
//! - [`store`]: event and aggregate persistence traits
//! - [`environment`]: injected dependencies such as the clock

pub use chrono::{DateTime, Utc};

pub mod aggregate;
pub mod event;
pub mod log;
pub mod store;

pub use aggregate::{StatusPolicy, UserAggregate, UserStatus};
pub use event::{Event, EventInput, EventType, Origin, Properties, PropertyLimits};
pub use log::{LogCoordinates, LogError, LogMessage, TopicPartition};
pub use store::{EventId, StoreError, StoredEvent};

/// Environment module - Dependency injection traits
///
/// External dependencies that affect behavior are abstracted behind traits so
/// tests can pin them.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// The publisher stamps `occurred_at` from this clock.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
