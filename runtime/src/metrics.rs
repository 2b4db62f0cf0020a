//! Prometheus metrics for the publish and consume paths.
//!
//! Metric families:
//! - Publisher: events published, publish errors by reason
//! - Processor: applied, duplicate, poison and race-skipped messages, latency
//! - Worker: commits, rebalances, heartbeat failures, rejoins, owned partitions
//! - Retry: attempts, recoveries, exhaustion
//!
//! Recording is a no-op until a recorder is installed, so library code and
//! tests can record freely.
//!
//! # Example
//!
//! ```rust,no_run
//! use beacon_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:8080".parse()?);
//! server.start()?;
//!
//! // Serve `server.render()` from GET /metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder plus the address its scrape endpoint is served on.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address the scrape endpoint is served on
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Address the scrape endpoint is served on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Describe all metrics and install the global Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed. A recorder
    /// that is already installed is tolerated with a warning.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                register_metrics();
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the recorder was not installed by this server.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    // Publisher
    describe_counter!(
        "beacon_events_published_total",
        "Events acknowledged by the log, by event type"
    );
    describe_counter!(
        "beacon_publish_errors_total",
        "Publish failures, by reason"
    );
    describe_histogram!(
        "beacon_publish_duration_seconds",
        "Time from publish call to log acknowledgement"
    );

    // Processor
    describe_counter!(
        "beacon_events_applied_total",
        "Events persisted and folded into their user aggregate"
    );
    describe_counter!(
        "beacon_duplicates_total",
        "Redelivered messages absorbed by deduplication"
    );
    describe_counter!(
        "beacon_poison_messages_total",
        "Messages that could not be decoded, by policy"
    );
    describe_counter!(
        "beacon_aggregate_races_total",
        "Events skipped after exhausting aggregate compare-and-swap attempts"
    );
    describe_histogram!(
        "beacon_processing_duration_seconds",
        "Time to process one message"
    );

    // Worker
    describe_counter!("beacon_commits_total", "Checkpoints committed");
    describe_counter!("beacon_commit_errors_total", "Checkpoint commits that failed");
    describe_counter!(
        "beacon_rebalances_total",
        "Partition assignment changes, by kind"
    );
    describe_counter!(
        "beacon_heartbeat_failures_total",
        "Liveness signals that failed"
    );
    describe_counter!(
        "beacon_group_rejoins_total",
        "Times the worker left and rejoined the group"
    );
    describe_counter!(
        "beacon_partition_halts_total",
        "Partitions stopped because the store stayed unavailable"
    );
    describe_gauge!(
        "beacon_owned_partitions",
        "Partitions currently owned by this worker"
    );

    // Dead letters
    describe_counter!(
        "beacon_dead_letters_total",
        "Poison messages recorded in the dead-letter queue, by topic"
    );

    // Retry
    describe_counter!("retry_attempts_total", "Total number of retry attempts");
    describe_counter!("retry_successes_total", "Total number of successful retries");
    describe_counter!(
        "retry_exhausted_total",
        "Total number of operations that exhausted max retries"
    );
}

/// Publisher metrics recorder.
pub struct PublisherMetrics;

impl PublisherMetrics {
    /// Record an acknowledged publish.
    pub fn record_publish(event_type: &'static str, duration: Duration) {
        counter!("beacon_events_published_total", "event_type" => event_type).increment(1);
        histogram!("beacon_publish_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a failed publish.
    pub fn record_error(reason: &'static str) {
        counter!("beacon_publish_errors_total", "reason" => reason).increment(1);
    }
}

/// Processor metrics recorder.
pub struct ProcessorMetrics;

impl ProcessorMetrics {
    /// Record an applied event.
    pub fn record_applied(duration: Duration) {
        counter!("beacon_events_applied_total").increment(1);
        histogram!("beacon_processing_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record an absorbed duplicate.
    pub fn record_duplicate() {
        counter!("beacon_duplicates_total").increment(1);
    }

    /// Record a poison message.
    pub fn record_poison(policy: &'static str) {
        counter!("beacon_poison_messages_total", "policy" => policy).increment(1);
    }

    /// Record a race-skipped event.
    pub fn record_race() {
        counter!("beacon_aggregate_races_total").increment(1);
    }
}

/// Worker metrics recorder.
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// Record a committed checkpoint.
    pub fn record_commit() {
        counter!("beacon_commits_total").increment(1);
    }

    /// Record a failed commit.
    pub fn record_commit_error() {
        counter!("beacon_commit_errors_total").increment(1);
    }

    /// Record an assignment or revocation.
    pub fn record_rebalance(kind: &'static str) {
        counter!("beacon_rebalances_total", "kind" => kind).increment(1);
    }

    /// Record a failed heartbeat.
    pub fn record_heartbeat_failure() {
        counter!("beacon_heartbeat_failures_total").increment(1);
    }

    /// Record a rejoin.
    pub fn record_rejoin() {
        counter!("beacon_group_rejoins_total").increment(1);
    }

    /// Record a halted partition.
    pub fn record_partition_halt() {
        counter!("beacon_partition_halts_total").increment(1);
    }

    /// Set the number of owned partitions.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_owned_partitions(count: usize) {
        gauge!("beacon_owned_partitions").set(count as f64);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}
