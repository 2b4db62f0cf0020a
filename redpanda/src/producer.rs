//! Producer side: [`RedpandaLog`] implements [`EventLog`].

use crate::error::map_kafka_error;
use beacon_core::log::{EventLog, LogCoordinates, LogError};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Default delivery timeout for appends and metadata probes.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Kafka-compatible partitioned log.
///
/// Messages are partitioned by key with `murmur2`, the partitioner used by
/// Java and JavaScript clients, so events for one user land on the same
/// partition regardless of which producer wrote them.
///
/// # Example
///
/// ```no_run
/// use beacon_redpanda::RedpandaLog;
///
/// # fn example() -> Result<(), beacon_core::LogError> {
/// let log = RedpandaLog::builder()
///     .brokers("kafka-1:9092,kafka-2:9092")
///     .producer_acks("all")
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedpandaLog {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
}

impl RedpandaLog {
    /// Connect with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::Transport`] if the client cannot be created.
    pub fn new(brokers: &str) -> Result<Self, LogError> {
        Self::builder().brokers(brokers).build()
    }

    /// Start a builder.
    #[must_use]
    pub fn builder() -> RedpandaLogBuilder {
        RedpandaLogBuilder::new()
    }

    /// Bootstrap servers this log was created with.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Delivery timeout per append.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl EventLog for RedpandaLog {
    fn append<'a>(
        &'a self,
        topic: &'a str,
        key: &'a [u8],
        payload: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<LogCoordinates, LogError>> + Send + 'a>> {
        Box::pin(async move {
            let record = FutureRecord::to(topic).key(key).payload(payload);
            match self.producer.send(record, Timeout::After(self.timeout)).await {
                Ok((partition, offset)) => {
                    tracing::trace!(topic, partition, offset, "Message acknowledged");
                    Ok(LogCoordinates::new(topic, partition, offset))
                }
                Err((error, _message)) => {
                    let mapped = map_kafka_error(&error, self.timeout);
                    tracing::warn!(topic, error = %error, "Append failed");
                    Err(mapped)
                }
            }
        })
    }

    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<(), LogError>> + Send + '_>> {
        let producer = self.producer.clone();
        let timeout = self.timeout;
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                producer
                    .client()
                    .fetch_metadata(None, Timeout::After(timeout))
                    .map(|_| ())
                    .map_err(|e| map_kafka_error(&e, timeout))
            })
            .await
            .map_err(|e| LogError::Transport(format!("Metadata probe aborted: {e}")))?
        })
    }
}

/// Builder for [`RedpandaLog`].
#[derive(Debug, Clone)]
pub struct RedpandaLogBuilder {
    brokers: Option<String>,
    producer_acks: String,
    compression: String,
    timeout: Duration,
    client_id: String,
}

impl RedpandaLogBuilder {
    fn new() -> Self {
        Self {
            brokers: None,
            producer_acks: "all".to_string(),
            compression: "lz4".to_string(),
            timeout: DEFAULT_TIMEOUT,
            client_id: "beacon-publisher".to_string(),
        }
    }

    /// Comma-separated bootstrap servers. Required.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Acknowledgement level: `"0"`, `"1"` or `"all"` (default).
    ///
    /// Anything weaker than `"all"` can lose acknowledged events when a
    /// leader fails.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = acks.into();
        self
    }

    /// Compression codec: `none`, `gzip`, `snappy`, `lz4` (default) or `zstd`.
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = compression.into();
        self
    }

    /// Delivery timeout per append (default 5 s).
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Client id reported to the brokers.
    #[must_use]
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Create the producer.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::NotConnected`] without brokers and
    /// [`LogError::Transport`] if librdkafka rejects the configuration.
    pub fn build(self) -> Result<RedpandaLog, LogError> {
        let brokers = self
            .brokers
            .filter(|b| !b.trim().is_empty())
            .ok_or(LogError::NotConnected)?;

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("client.id", &self.client_id)
            .set("message.timeout.ms", self.timeout.as_millis().to_string())
            .set("acks", &self.producer_acks)
            .set("compression.type", &self.compression)
            .set("partitioner", "murmur2_random")
            .create()
            .map_err(|e| LogError::Transport(format!("Failed to create producer: {e}")))?;

        tracing::info!(brokers = %brokers, acks = %self.producer_acks, "Redpanda producer created");

        Ok(RedpandaLog {
            producer,
            brokers,
            timeout: self.timeout,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn log_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RedpandaLog>();
    }

    #[test]
    fn builder_defaults() {
        let builder = RedpandaLog::builder();
        assert_eq!(builder.producer_acks, "all");
        assert_eq!(builder.compression, "lz4");
        assert_eq!(builder.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn brokers_are_required() {
        assert!(matches!(
            RedpandaLog::builder().build(),
            Err(LogError::NotConnected)
        ));
        assert!(matches!(
            RedpandaLog::builder().brokers("  ").build(),
            Err(LogError::NotConnected)
        ));
    }

    #[test]
    fn build_does_not_contact_brokers() {
        let log = RedpandaLog::builder()
            .brokers("127.0.0.1:1")
            .timeout(Duration::from_millis(250))
            .build()
            .unwrap();
        assert_eq!(log.brokers(), "127.0.0.1:1");
        assert_eq!(log.timeout(), Duration::from_millis(250));
    }
}
