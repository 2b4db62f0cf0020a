//! Per-user rollup maintained by the message processor.
//!
//! [`UserAggregate`] transitions are pure: [`UserAggregate::first`] builds the
//! record for a user's first event and [`UserAggregate::applied`] folds one
//! more event into an existing record. Stores only persist what these return.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lifecycle status of a user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    /// Seen recently
    Active,
    /// Quiet for longer than [`StatusPolicy::inactive_after`]
    Inactive,
    /// Quiet for longer than [`StatusPolicy::churned_after`]
    Churned,
}

impl UserStatus {
    /// Stable storage name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Churned => "churned",
        }
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored status string that is not a [`UserStatus`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown user status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for UserStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "churned" => Ok(Self::Churned),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Inactivity thresholds used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPolicy {
    /// Quiet period after which a user counts as inactive
    pub inactive_after: TimeDelta,
    /// Quiet period after which a user counts as churned
    pub churned_after: TimeDelta,
}

impl Default for StatusPolicy {
    fn default() -> Self {
        Self {
            inactive_after: TimeDelta::days(30),
            churned_after: TimeDelta::days(90),
        }
    }
}

/// Rollup of everything seen for one user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAggregate {
    /// Owning user
    pub user_id: String,
    /// `occurred_at` of the first processed event
    pub first_seen_at: DateTime<Utc>,
    /// Latest `occurred_at` seen so far
    pub last_seen_at: DateTime<Utc>,
    /// Number of distinct events applied
    pub total_event_count: u64,
    /// Stored status; any processed event sets it to active
    pub status: UserStatus,
    /// Optimistic-concurrency token, 1 on creation
    pub version: i64,
}

impl UserAggregate {
    /// Aggregate for a user's first event.
    #[must_use]
    pub fn first(user_id: impl Into<String>, occurred_at: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            first_seen_at: occurred_at,
            last_seen_at: occurred_at,
            total_event_count: 1,
            status: UserStatus::Active,
            version: 1,
        }
    }

    /// This aggregate with one more event folded in.
    ///
    /// `last_seen_at` never moves backwards, so events that arrive out of
    /// timestamp order across topics still leave it at the maximum.
    #[must_use]
    pub fn applied(&self, occurred_at: DateTime<Utc>) -> Self {
        Self {
            user_id: self.user_id.clone(),
            first_seen_at: self.first_seen_at,
            last_seen_at: self.last_seen_at.max(occurred_at),
            total_event_count: self.total_event_count + 1,
            status: UserStatus::Active,
            version: self.version + 1,
        }
    }

    /// Status as of `now`, derived from `last_seen_at`.
    #[must_use]
    pub fn status_at(&self, now: DateTime<Utc>, policy: &StatusPolicy) -> UserStatus {
        let quiet = now - self.last_seen_at;
        if quiet >= policy.churned_after {
            UserStatus::Churned
        } else if quiet >= policy.inactive_after {
            UserStatus::Inactive
        } else {
            UserStatus::Active
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn first_event_creates_active_aggregate() {
        let agg = UserAggregate::first("u1", at(0));
        assert_eq!(agg.total_event_count, 1);
        assert_eq!(agg.first_seen_at, agg.last_seen_at);
        assert_eq!(agg.status, UserStatus::Active);
        assert_eq!(agg.version, 1);
    }

    #[test]
    fn older_event_does_not_rewind_last_seen() {
        let agg = UserAggregate::first("u1", at(100)).applied(at(50));
        assert_eq!(agg.last_seen_at, at(100));
        assert_eq!(agg.first_seen_at, at(100));
        assert_eq!(agg.total_event_count, 2);
        assert_eq!(agg.version, 2);
    }

    #[test]
    fn applying_reactivates() {
        let mut agg = UserAggregate::first("u1", at(0));
        agg.status = UserStatus::Churned;
        assert_eq!(agg.applied(at(10)).status, UserStatus::Active);
    }

    #[test]
    fn status_is_derived_from_quiet_period() {
        let policy = StatusPolicy::default();
        let agg = UserAggregate::first("u1", at(0));

        assert_eq!(agg.status_at(at(0) + TimeDelta::days(1), &policy), UserStatus::Active);
        assert_eq!(agg.status_at(at(0) + TimeDelta::days(31), &policy), UserStatus::Inactive);
        assert_eq!(agg.status_at(at(0) + TimeDelta::days(120), &policy), UserStatus::Churned);
    }

    #[test]
    fn status_parses_storage_names() {
        assert_eq!("inactive".parse::<UserStatus>().unwrap(), UserStatus::Inactive);
        assert!("gone".parse::<UserStatus>().is_err());
    }

    proptest! {
        #[test]
        fn folding_events_keeps_invariants(offsets in proptest::collection::vec(-10_000i64..10_000, 1..50)) {
            let mut agg = UserAggregate::first("u", at(offsets[0]));
            let mut prev = agg.clone();

            for &offset in &offsets[1..] {
                agg = agg.applied(at(offset));
                prop_assert!(agg.last_seen_at >= prev.last_seen_at);
                prop_assert_eq!(agg.first_seen_at, prev.first_seen_at);
                prop_assert_eq!(agg.version, prev.version + 1);
                prev = agg.clone();
            }

            prop_assert_eq!(agg.total_event_count, offsets.len() as u64);
            prop_assert_eq!(agg.last_seen_at, at(*offsets.iter().max().unwrap()));
        }
    }
}
