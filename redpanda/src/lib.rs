//! Redpanda/Kafka partitioned log for the Beacon pipeline.
//!
//! Two halves over rdkafka:
//!
//! - [`RedpandaLog`] implements [`EventLog`](beacon_core::log::EventLog): keyed
//!   appends acknowledged by the brokers (`acks=all` by default)
//! - [`RedpandaConsumerGroup`] implements
//!   [`ConsumerGroup`](beacon_core::log::ConsumerGroup): group membership with
//!   per-partition streams, manual commits and blocking revocation
//!
//! # Delivery Semantics
//!
//! **At-least-once**. Auto-commit is disabled; the worker commits the next
//! offset only after a message is durably handled. A crash between handling
//! and commit redelivers the message, which the processor deduplicates by
//! log coordinates. Ordering holds within a partition, and the key (user id)
//! picks the partition.
//!
//! # Example
//!
//! ```no_run
//! use beacon_core::log::ConsumerGroup;
//! use beacon_redpanda::{RedpandaConsumerGroup, RedpandaLog};
//!
//! # async fn example() -> Result<(), beacon_core::LogError> {
//! let log = RedpandaLog::new("localhost:9092")?;
//! let group = RedpandaConsumerGroup::builder()
//!     .brokers("localhost:9092")
//!     .group_id("analytics-group")
//!     .build()?;
//! let membership = group.join(&["events_page_view".to_string()]).await?;
//! # Ok(())
//! # }
//! ```

mod consumer;
mod error;
mod producer;

pub use consumer::{
    DEFAULT_BUFFER_SIZE, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_SESSION_TIMEOUT,
    RedpandaConsumerGroup, RedpandaConsumerGroupBuilder,
};
pub use producer::{DEFAULT_TIMEOUT, RedpandaLog, RedpandaLogBuilder};
