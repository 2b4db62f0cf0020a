//! Poison messages set aside by the worker.
//!
//! Entries are keyed by their log coordinates so a message redelivered after a
//! crash is recorded once. Operators list pending entries, then resolve or
//! discard them once the producer bug is understood.

use crate::error::map_sqlx_error;
use beacon_core::log::LogCoordinates;
use beacon_core::store::{DeadLetter, StoreError};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

/// Lifecycle of a dead-letter entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterStatus {
    /// Waiting for investigation
    Pending,
    /// Handled, for example by republishing a corrected event
    Resolved,
    /// Dropped for good
    Discarded,
}

impl DeadLetterStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse the database representation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] for an unknown status.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(StoreError::Serialization(format!("Invalid dead letter status: {s}"))),
        }
    }
}

/// A stored dead letter with its handling state.
#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    /// Row identifier
    pub id: i64,
    /// The poison message as recorded
    pub letter: DeadLetter,
    /// Current handling state
    pub status: DeadLetterStatus,
    /// When it was resolved or discarded
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved it
    pub resolved_by: Option<String>,
    /// Free-form notes
    pub resolution_notes: Option<String>,
}

/// `PostgreSQL`-backed dead-letter table.
///
/// # Example
///
/// ```no_run
/// use beacon_postgres::DeadLetterQueue;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = DeadLetterQueue::new(pool);
/// for entry in dlq.list_pending(100).await? {
///     println!("{} at {}", entry.letter.reason, entry.letter.coordinates);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DeadLetterQueue {
    pool: PgPool,
}

impl DeadLetterQueue {
    /// Use `pool` for all queries.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record `letter`, keeping the first entry if its coordinates were
    /// already recorded. Returns the row id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub async fn add_entry(&self, letter: &DeadLetter) -> Result<i64, StoreError> {
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO dead_letters (topic, partition_id, log_offset, payload, reason, failed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (topic, partition_id, log_offset)
                DO UPDATE SET reason = dead_letters.reason
            RETURNING id
            ",
        )
        .bind(&letter.coordinates.topic)
        .bind(letter.coordinates.partition)
        .bind(letter.coordinates.offset)
        .bind(letter.payload.as_deref())
        .bind(&letter.reason)
        .bind(letter.failed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        tracing::warn!(
            dlq_id = id,
            coordinates = %letter.coordinates,
            reason = %letter.reason,
            "Message added to dead letters"
        );
        metrics::counter!("beacon_dead_letters_total", "topic" => letter.coordinates.topic.clone())
            .increment(1);

        Ok(id)
    }

    /// Pending entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError> {
        self.list_by_status(DeadLetterStatus::Pending, limit).await
    }

    /// Entries in `status`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DeadLetterStatus,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let rows = sqlx::query(
            r"
            SELECT id, topic, partition_id, log_offset, payload, reason, failed_at,
                   status, resolved_at, resolved_by, resolution_notes
            FROM dead_letters
            WHERE status = $1
            ORDER BY failed_at ASC
            LIMIT $2
            ",
        )
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    /// Mark an entry resolved.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE dead_letters
            SET status = 'resolved', resolved_at = NOW(), resolved_by = $1, resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        tracing::info!(dlq_id = id, resolved_by, "Dead letter resolved");
        Ok(())
    }

    /// Mark an entry discarded.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), StoreError> {
        sqlx::query(
            r"
            UPDATE dead_letters
            SET status = 'discarded', resolved_at = NOW(), resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        tracing::warn!(dlq_id = id, reason, "Dead letter discarded");
        Ok(())
    }

    /// Number of pending entries.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, StoreError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)
    }

    fn row_to_entry(row: &sqlx::postgres::PgRow) -> Result<DeadLetterEntry, StoreError> {
        let status: String = row.try_get("status").map_err(map_sqlx_error)?;
        Ok(DeadLetterEntry {
            id: row.try_get("id").map_err(map_sqlx_error)?,
            letter: DeadLetter {
                coordinates: LogCoordinates::new(
                    row.try_get::<String, _>("topic").map_err(map_sqlx_error)?,
                    row.try_get("partition_id").map_err(map_sqlx_error)?,
                    row.try_get("log_offset").map_err(map_sqlx_error)?,
                ),
                payload: row.try_get("payload").map_err(map_sqlx_error)?,
                reason: row.try_get("reason").map_err(map_sqlx_error)?,
                failed_at: row.try_get("failed_at").map_err(map_sqlx_error)?,
            },
            status: DeadLetterStatus::parse(&status)?,
            resolved_at: row.try_get("resolved_at").map_err(map_sqlx_error)?,
            resolved_by: row.try_get("resolved_by").map_err(map_sqlx_error)?,
            resolution_notes: row.try_get("resolution_notes").map_err(map_sqlx_error)?,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in [
            DeadLetterStatus::Pending,
            DeadLetterStatus::Resolved,
            DeadLetterStatus::Discarded,
        ] {
            assert_eq!(DeadLetterStatus::parse(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn unknown_status_is_a_serialization_error() {
        assert!(matches!(
            DeadLetterStatus::parse("processing"),
            Err(StoreError::Serialization(_))
        ));
    }
}
