//! # Beacon Runtime
//!
//! The moving parts of the event pipeline, written against the boundaries
//! defined in `beacon-core`.
//!
//! ## Components
//!
//! - **[`Publisher`](publisher::Publisher)**: validates events and appends
//!   them to the log, keyed by user
//! - **[`MessageProcessor`](processor::MessageProcessor)**: idempotent
//!   decode, dedup, persist and aggregate for a single log message
//! - **[`Worker`](worker::Worker)**: consumer-group member running one
//!   ordered [`PartitionTask`](partition::PartitionTask) per owned partition
//! - **[`LivenessSignaler`](liveness::LivenessSignaler)**: heartbeats for
//!   the membership
//! - **Startup and readiness**: [`startup`] waits for dependencies,
//!   [`readiness`] reports them
//!
//! ## Example
//!
//! ```
//! use beacon_runtime::processor::MessageProcessor;
//! use beacon_runtime::worker::{Worker, WorkerState};
//! use beacon_testing::{InMemoryLog, InMemoryStore};
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let log = InMemoryLog::new(4);
//! let store = Arc::new(InMemoryStore::new());
//! let processor = MessageProcessor::new(store.clone(), store);
//! let worker = Worker::new(Arc::new(log.consumer_group("analytics-group")), processor);
//!
//! let (shutdown_tx, shutdown) = watch::channel(false);
//! shutdown_tx.send_replace(true);
//! worker.run(shutdown).await?;
//! assert_eq!(*worker.state().borrow(), WorkerState::Disconnected);
//! # Ok(())
//! # }
//! ```

use tokio::sync::watch;

/// Heartbeats for a group membership
pub mod liveness;

/// Prometheus metrics for observability
pub mod metrics;

/// Sequential processing of one partition
pub mod partition;

/// Idempotent handling of single messages
pub mod processor;

/// Producer-side entry point
pub mod publisher;

/// Connection readiness reporting
pub mod readiness;

/// Retry logic with exponential backoff
pub mod retry;

/// Waiting for dependencies at startup
pub mod startup;

/// Consumer-group worker
pub mod worker;

pub use processor::{MessageProcessor, PoisonPolicy, ProcessError, ProcessOutcome, ProcessorOptions};
pub use publisher::{PublishError, PublishReceipt, Publisher};
pub use readiness::Readiness;
pub use retry::RetryPolicy;
pub use worker::{Worker, WorkerError, WorkerOptions, WorkerState};

/// Resolves once stop is requested or the stop sender is gone.
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}
