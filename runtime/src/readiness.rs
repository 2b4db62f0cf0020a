//! Readiness flags shared between the worker and its probe endpoint.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};

/// Point-in-time view of [`Readiness`], serialized as the probe body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReadinessReport {
    /// Whether the worker is ready to process
    pub ready: bool,
    /// The log connection is established
    pub log_connected: bool,
    /// The store connection is established
    pub store_connected: bool,
}

/// Ready only while both the log and the store are connected.
#[derive(Debug, Default)]
pub struct Readiness {
    log_connected: AtomicBool,
    store_connected: AtomicBool,
}

impl Readiness {
    /// Everything starts disconnected.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            log_connected: AtomicBool::new(false),
            store_connected: AtomicBool::new(false),
        }
    }

    /// Record the state of the log connection.
    pub fn set_log_connected(&self, connected: bool) {
        self.log_connected.store(connected, Ordering::Release);
    }

    /// Record the state of the store connection.
    pub fn set_store_connected(&self, connected: bool) {
        self.store_connected.store(connected, Ordering::Release);
    }

    /// Whether both connections are up.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.report().ready
    }

    /// Snapshot for reporting.
    #[must_use]
    pub fn report(&self) -> ReadinessReport {
        let log_connected = self.log_connected.load(Ordering::Acquire);
        let store_connected = self.store_connected.load(Ordering::Acquire);
        ReadinessReport {
            ready: log_connected && store_connected,
            log_connected,
            store_connected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_both_connections() {
        let readiness = Readiness::new();
        assert!(!readiness.is_ready());

        readiness.set_log_connected(true);
        assert!(!readiness.is_ready());

        readiness.set_store_connected(true);
        assert!(readiness.is_ready());

        readiness.set_log_connected(false);
        let report = readiness.report();
        assert!(!report.ready);
        assert!(report.store_connected);
    }
}
