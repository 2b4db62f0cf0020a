//! Waiting for dependencies before the worker starts.
//!
//! Brokers and databases routinely come up after the worker in container
//! deployments. Both waits poll `ping()` on a fixed schedule and give up with
//! a [`ConnectionError`] once the attempts are spent.

use crate::retry::{Backoff, RetryPolicy};
use beacon_core::log::EventLog;
use beacon_core::store::EventStore;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Attempts made by [`default_policy`].
pub const DEFAULT_ATTEMPTS: usize = 30;

/// Delay between attempts of [`default_policy`].
pub const DEFAULT_DELAY: Duration = Duration::from_secs(2);

/// A dependency never became reachable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{dependency} unreachable after {attempts} attempts: {last_error}")]
pub struct ConnectionError {
    /// Which dependency was being waited for
    pub dependency: &'static str,
    /// Attempts made
    pub attempts: usize,
    /// Error of the final attempt
    pub last_error: String,
}

/// Thirty attempts two seconds apart.
#[must_use]
pub const fn default_policy() -> RetryPolicy {
    RetryPolicy::constant(DEFAULT_ATTEMPTS, DEFAULT_DELAY)
}

/// Wait until the log answers a ping.
///
/// # Errors
///
/// Returns [`ConnectionError`] once `policy` is exhausted.
pub async fn wait_for_log(log: &dyn EventLog, policy: &RetryPolicy) -> Result<(), ConnectionError> {
    wait_for("log", policy, || log.ping()).await
}

/// Wait until the store answers a ping.
///
/// # Errors
///
/// Returns [`ConnectionError`] once `policy` is exhausted.
pub async fn wait_for_store(
    store: &dyn EventStore,
    policy: &RetryPolicy,
) -> Result<(), ConnectionError> {
    wait_for("store", policy, || store.ping()).await
}

async fn wait_for<F, Fut, E>(
    dependency: &'static str,
    policy: &RetryPolicy,
    mut ping: F,
) -> Result<(), ConnectionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let mut backoff = Backoff::new(policy.clone());
    loop {
        match ping().await {
            Ok(()) => {
                tracing::info!(dependency, attempts = backoff.attempt() + 1, "Dependency reachable");
                return Ok(());
            }
            Err(error) => {
                let attempts = backoff.attempt() + 1;
                let Some(delay) = backoff.next_delay() else {
                    tracing::error!(dependency, attempts, error = %error, "Dependency unreachable, giving up");
                    return Err(ConnectionError {
                        dependency,
                        attempts,
                        last_error: error.to_string(),
                    });
                };
                tracing::info!(dependency, attempts, error = %error, ?delay, "Waiting for dependency");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
