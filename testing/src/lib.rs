//! # Beacon Testing
//!
//! Testing utilities for the Beacon event pipeline.
//!
//! This crate provides:
//! - [`InMemoryLog`]: partitioned log plus consumer-group coordinator
//! - [`InMemoryStore`]: event, aggregate and dead-letter store with fault
//!   injection
//! - [`FixedClock`]: deterministic time
//! - [`init_tracing`]: test log output
//!
//! ## Example
//!
//! ```
//! use beacon_core::log::ConsumerGroup;
//! use beacon_testing::{InMemoryLog, InMemoryStore};
//!
//! let log = InMemoryLog::new(4);
//! let group = log.consumer_group("analytics-group");
//! let store = InMemoryStore::new();
//! assert_eq!(group.group_id(), "analytics-group");
//! assert_eq!(store.event_count(), 0);
//! ```

use beacon_core::environment::Clock;
use chrono::{DateTime, Utc};

pub mod log;
pub mod store;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex};

    /// Fixed clock for deterministic tests
    ///
    /// Returns the same time until [`FixedClock::advance`] moves it.
    ///
    /// # Example
    ///
    /// ```
    /// use beacon_testing::mocks::FixedClock;
    /// use beacon_core::environment::Clock;
    /// use chrono::{TimeDelta, Utc};
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// assert_eq!(time1, clock.now());
    ///
    /// clock.advance(TimeDelta::seconds(1));
    /// assert!(clock.now() > time1);
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward; clones observe the change.
        pub fn advance(&self, by: chrono::TimeDelta) {
            let mut time = self.time.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            *time += by;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Install a test subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use log::{InMemoryConsumerGroup, InMemoryLog, InMemoryMembership};
pub use mocks::{FixedClock, test_clock};
pub use store::InMemoryStore;
