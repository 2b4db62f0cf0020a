//! Turning validated event inputs into durably queued log messages.
//!
//! The publisher validates, stamps `occurred_at` from its [`Clock`], encodes
//! to the JSON wire format and appends to `events_<type>` keyed by `user_id`.
//! It returns only after the log has acknowledged the write.
//!
//! Failures are never retried here; the caller decides. A
//! [`PublishError::reason`] label is attached to every failure for metrics and
//! client-facing error bodies.

use crate::metrics::PublisherMetrics;
use beacon_core::environment::{Clock, SystemClock};
use beacon_core::event::{EventInput, PropertyLimits, ValidationError};
use beacon_core::log::{EventLog, LogError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Where an acknowledged event landed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Topic the event was appended to
    pub topic: String,
    /// Partition chosen by the log for the user key
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
}

/// Errors returned by [`Publisher::publish`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The input failed validation and was not sent
    #[error("Event rejected: {0}")]
    Rejected(#[from] ValidationError),

    /// The log client is not connected
    #[error("Not connected to the log")]
    NotConnected,

    /// No broker acknowledged the write
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// The acknowledgement did not arrive in time
    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),

    /// The event could not be serialized
    #[error("Failed to encode event: {0}")]
    Encoding(String),
}

impl PublishError {
    /// Short machine-readable failure label.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Rejected(_) => "rejected",
            Self::NotConnected => "not_connected",
            Self::BrokerUnavailable(_) => "broker_unavailable",
            Self::Timeout(_) => "timeout",
            Self::Encoding(_) => "encoding",
        }
    }
}

impl From<LogError> for PublishError {
    fn from(error: LogError) -> Self {
        match error {
            LogError::NotConnected => Self::NotConnected,
            LogError::Timeout(after) => Self::Timeout(after),
            LogError::BrokerUnavailable(reason) | LogError::Transport(reason) => {
                Self::BrokerUnavailable(reason)
            }
            other @ (LogError::NotOwner(_) | LogError::MembershipLost(_)) => {
                Self::BrokerUnavailable(other.to_string())
            }
        }
    }
}

/// Producer-side entry point of the pipeline.
///
/// # Example
///
/// ```
/// use beacon_core::event::{EventInput, EventType};
/// use beacon_runtime::publisher::Publisher;
/// use beacon_testing::InMemoryLog;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let publisher = Publisher::new(Arc::new(InMemoryLog::new(4)));
/// let receipt = publisher.publish(EventInput::new(EventType::Signup, "u1")).await?;
/// assert_eq!(receipt.topic, "events_signup");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Publisher {
    log: Arc<dyn EventLog>,
    clock: Arc<dyn Clock>,
    limits: PropertyLimits,
}

impl Publisher {
    /// Publisher using the system clock and default property limits.
    #[must_use]
    pub fn new(log: Arc<dyn EventLog>) -> Self {
        Self {
            log,
            clock: Arc::new(SystemClock),
            limits: PropertyLimits::default(),
        }
    }

    /// Use `clock` to stamp `occurred_at`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Override the property bounds.
    #[must_use]
    pub const fn with_limits(mut self, limits: PropertyLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Validate, stamp and durably append one event.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Rejected`] for invalid input, or the
    /// connection-class variant that describes why the log did not
    /// acknowledge the write.
    pub async fn publish(&self, input: EventInput) -> Result<PublishReceipt, PublishError> {
        let result = self.publish_inner(input).await;
        if let Err(error) = &result {
            PublisherMetrics::record_error(error.reason());
        }
        result
    }

    async fn publish_inner(&self, input: EventInput) -> Result<PublishReceipt, PublishError> {
        input.validate(&self.limits)?;

        let event = input.into_event(self.clock.now());
        let topic = event.topic();
        let payload = event
            .encode()
            .map_err(|e| PublishError::Encoding(e.to_string()))?;

        let started = Instant::now();
        let coordinates = match self.log.append(&topic, event.key(), &payload).await {
            Ok(coordinates) => coordinates,
            Err(error) => {
                tracing::warn!(
                    topic = %topic,
                    user_id = %event.user_id(),
                    error = %error,
                    "Publish failed"
                );
                return Err(error.into());
            }
        };
        PublisherMetrics::record_publish(event.event_type().as_str(), started.elapsed());

        tracing::debug!(
            topic = %coordinates.topic,
            partition = coordinates.partition,
            offset = coordinates.offset,
            user_id = %event.user_id(),
            "Event published"
        );

        Ok(PublishReceipt {
            topic: coordinates.topic,
            partition: coordinates.partition,
            offset: coordinates.offset,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use beacon_core::environment::Clock;
    use beacon_core::event::{Event, EventType, Properties};
    use beacon_testing::{InMemoryLog, test_clock};

    fn publisher(log: &InMemoryLog) -> Publisher {
        Publisher::new(Arc::new(log.clone())).with_clock(Arc::new(test_clock()))
    }

    #[tokio::test]
    async fn routes_by_type_and_keys_by_user() {
        let log = InMemoryLog::new(8);
        let publisher = publisher(&log);

        let first = publisher
            .publish(EventInput::new(EventType::PageView, "u1"))
            .await
            .unwrap();
        let second = publisher
            .publish(EventInput::new(EventType::PageView, "u1"))
            .await
            .unwrap();

        assert_eq!(first.topic, "events_page_view");
        assert_eq!(first.partition, log.partition_for(b"u1"));
        assert_eq!(second.partition, first.partition);
        assert_eq!(second.offset, first.offset + 1);
    }

    #[tokio::test]
    async fn stamps_occurred_at_from_clock() {
        let log = InMemoryLog::new(1);
        let receipt = publisher(&log)
            .publish(EventInput::new(EventType::Login, "u1").with_properties(Properties::new().with("m", "pw")))
            .await
            .unwrap();

        let messages = log.messages(&receipt.topic, receipt.partition);
        let message = &messages[0];
        let event = Event::decode(message.payload.as_deref().unwrap(), &PropertyLimits::default()).unwrap();
        assert_eq!(event.occurred_at(), test_clock().now());
        assert_eq!(message.key.as_deref(), Some(b"u1".as_slice()));
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_append() {
        let log = InMemoryLog::new(1);
        let err = publisher(&log)
            .publish(EventInput::new(EventType::Login, ""))
            .await
            .unwrap_err();

        assert_eq!(err, PublishError::Rejected(ValidationError::EmptyUserId));
        assert!(log.messages("events_login", 0).is_empty());
    }

    #[tokio::test]
    async fn log_failures_are_surfaced_with_reason() {
        let log = InMemoryLog::new(1);
        let publisher = publisher(&log);

        log.set_connected(false);
        let err = publisher.publish(EventInput::new(EventType::Click, "u1")).await.unwrap_err();
        assert_eq!(err.reason(), "not_connected");

        log.set_connected(true);
        log.fail_appends_with(Some(LogError::Timeout(Duration::from_secs(5))));
        let err = publisher.publish(EventInput::new(EventType::Click, "u1")).await.unwrap_err();
        assert_eq!(err, PublishError::Timeout(Duration::from_secs(5)));

        log.fail_appends_with(Some(LogError::BrokerUnavailable("all brokers down".into())));
        let err = publisher.publish(EventInput::new(EventType::Click, "u1")).await.unwrap_err();
        assert_eq!(err.reason(), "broker_unavailable");
        assert!(log.messages("events_click", 0).is_empty());
    }
}
