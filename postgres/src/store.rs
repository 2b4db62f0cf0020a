use crate::dead_letter_queue::DeadLetterQueue;
use crate::error::map_sqlx_error;
use beacon_core::aggregate::{UserAggregate, UserStatus};
use beacon_core::event::{Event, EventInput, EventType, Origin, Properties};
use beacon_core::log::LogCoordinates;
use beacon_core::store::{
    AggregateStore, AggregateUpdate, CasOutcome, DeadLetter, DeadLetterSink, EventId, EventQuery,
    EventReader, EventStore, InsertOutcome, StoreError, StoredEvent, StoredEventRef,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

const EVENT_COLUMNS: &str = "id, event_type, user_id, session_id, props, occurred_at, ip_address, \
     user_agent, processed, topic, partition_id, log_offset, created_at";

const AGGREGATE_COLUMNS: &str =
    "user_id, first_seen_at, last_seen_at, total_event_count, status, version";

/// `PostgreSQL`-backed implementation of every store boundary.
///
/// Cloning shares the pool.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a new pool to `database_url`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if no connection can be made.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to connect: {e}")))?;
        Ok(Self::from_pool(pool))
    }

    /// Build a pool that connects on first use, for startups that wait for
    /// the database with [`ping`](EventStore::ping).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if `database_url` cannot be parsed.
    pub fn connect_lazy(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy(database_url)
            .map_err(|e| StoreError::Database(format!("Invalid database URL: {e}")))?;
        Ok(Self::from_pool(pool))
    }

    /// Create or upgrade the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Dead-letter management on the same pool.
    #[must_use]
    pub fn dead_letter_queue(&self) -> DeadLetterQueue {
        DeadLetterQueue::new(self.pool.clone())
    }

    async fn find_event(&self, coordinates: &LogCoordinates) -> Result<Option<StoredEventRef>, StoreError> {
        let row = sqlx::query(
            "SELECT id, processed FROM analytics_events \
             WHERE topic = $1 AND partition_id = $2 AND log_offset = $3",
        )
        .bind(&coordinates.topic)
        .bind(coordinates.partition)
        .bind(coordinates.offset)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(|row| {
            Ok(StoredEventRef {
                id: EventId(row.try_get("id").map_err(map_sqlx_error)?),
                processed: row.try_get("processed").map_err(map_sqlx_error)?,
            })
        })
        .transpose()
    }

    async fn insert_event(
        &self,
        event: &Event,
        coordinates: &LogCoordinates,
    ) -> Result<InsertOutcome, StoreError> {
        let inserted: Option<i64> = sqlx::query_scalar(
            "INSERT INTO analytics_events \
                 (event_type, user_id, session_id, props, occurred_at, ip_address, user_agent, \
                  topic, partition_id, log_offset) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (topic, partition_id, log_offset) DO NOTHING \
             RETURNING id",
        )
        .bind(event.event_type().as_str())
        .bind(event.user_id())
        .bind(event.session_id())
        .bind(Json(event.properties()))
        .bind(event.occurred_at())
        .bind(event.origin().ip_address.as_deref())
        .bind(event.origin().user_agent.as_deref())
        .bind(&coordinates.topic)
        .bind(coordinates.partition)
        .bind(coordinates.offset)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if let Some(id) = inserted {
            return Ok(InsertOutcome::Inserted(EventId(id)));
        }

        tracing::debug!(coordinates = %coordinates, "Event already stored");
        self.find_event(coordinates)
            .await?
            .map(InsertOutcome::Duplicate)
            .ok_or_else(|| StoreError::Database(format!("Conflicting row for {coordinates} vanished")))
    }

    async fn load_aggregate(&self, user_id: &str) -> Result<Option<UserAggregate>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {AGGREGATE_COLUMNS} FROM user_aggregates WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.as_ref().map(aggregate_from_row).transpose()
    }

    async fn apply(&self, update: AggregateUpdate) -> Result<CasOutcome, StoreError> {
        let next = update.next;
        let total = i64::try_from(next.total_event_count)
            .map_err(|_| StoreError::Serialization("total_event_count overflows BIGINT".to_string()))?;

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let processed: Option<bool> =
            sqlx::query_scalar("SELECT processed FROM analytics_events WHERE id = $1 FOR UPDATE")
                .bind(update.event_id.0)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        match processed {
            None => {
                return Err(StoreError::Database(format!(
                    "Event {} does not exist",
                    update.event_id
                )));
            }
            Some(true) => return Ok(CasOutcome::AlreadyApplied),
            Some(false) => {}
        }

        let written = match update.expected_version {
            None => sqlx::query(
                "INSERT INTO user_aggregates \
                     (user_id, first_seen_at, last_seen_at, total_event_count, status, version) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (user_id) DO NOTHING",
            )
            .bind(&next.user_id)
            .bind(next.first_seen_at)
            .bind(next.last_seen_at)
            .bind(total)
            .bind(next.status.as_str())
            .bind(next.version)
            .execute(&mut *tx)
            .await,
            Some(expected) => sqlx::query(
                "UPDATE user_aggregates \
                 SET first_seen_at = $2, last_seen_at = $3, total_event_count = $4, status = $5, \
                     version = $6, updated_at = now() \
                 WHERE user_id = $1 AND version = $7",
            )
            .bind(&next.user_id)
            .bind(next.first_seen_at)
            .bind(next.last_seen_at)
            .bind(total)
            .bind(next.status.as_str())
            .bind(next.version)
            .bind(expected)
            .execute(&mut *tx)
            .await,
        }
        .map_err(map_sqlx_error)?;

        if written.rows_affected() == 0 {
            tracing::debug!(user_id = %next.user_id, expected = ?update.expected_version, "Aggregate version moved");
            return Ok(CasOutcome::Conflict);
        }

        sqlx::query("UPDATE analytics_events SET processed = TRUE WHERE id = $1")
            .bind(update.event_id.0)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(CasOutcome::Applied(next))
    }

    async fn list(&self, query: &EventQuery) -> Result<Vec<StoredEvent>, StoreError> {
        let mut builder = QueryBuilder::<Postgres>::new(format!("SELECT {EVENT_COLUMNS} FROM analytics_events WHERE TRUE"));
        if let Some(user_id) = &query.user_id {
            builder.push(" AND user_id = ").push_bind(user_id);
        }
        if let Some(event_type) = query.event_type {
            builder.push(" AND event_type = ").push_bind(event_type.as_str());
        }
        if let Some(from) = query.from {
            builder.push(" AND occurred_at >= ").push_bind(from);
        }
        if let Some(to) = query.to {
            builder.push(" AND occurred_at < ").push_bind(to);
        }
        builder
            .push(" ORDER BY occurred_at ASC, log_offset ASC LIMIT ")
            .push_bind(i64::try_from(query.limit).unwrap_or(i64::MAX));

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(event_from_row).collect()
    }
}

fn event_from_row(row: &PgRow) -> Result<StoredEvent, StoreError> {
    let event_type: String = row.try_get("event_type").map_err(map_sqlx_error)?;
    let event_type: EventType = event_type
        .parse()
        .map_err(|e| StoreError::Serialization(format!("{e}")))?;
    let Json(properties): Json<Properties> = row.try_get("props").map_err(map_sqlx_error)?;

    let input = EventInput {
        event_type,
        user_id: row.try_get("user_id").map_err(map_sqlx_error)?,
        session_id: row.try_get("session_id").map_err(map_sqlx_error)?,
        properties,
        origin: Origin {
            ip_address: row.try_get("ip_address").map_err(map_sqlx_error)?,
            user_agent: row.try_get("user_agent").map_err(map_sqlx_error)?,
        },
    };

    Ok(StoredEvent {
        id: EventId(row.try_get("id").map_err(map_sqlx_error)?),
        event: input.into_event(row.try_get("occurred_at").map_err(map_sqlx_error)?),
        coordinates: LogCoordinates::new(
            row.try_get::<String, _>("topic").map_err(map_sqlx_error)?,
            row.try_get("partition_id").map_err(map_sqlx_error)?,
            row.try_get("log_offset").map_err(map_sqlx_error)?,
        ),
        processed: row.try_get("processed").map_err(map_sqlx_error)?,
        created_at: row.try_get("created_at").map_err(map_sqlx_error)?,
    })
}

fn aggregate_from_row(row: &PgRow) -> Result<UserAggregate, StoreError> {
    let total: i64 = row.try_get("total_event_count").map_err(map_sqlx_error)?;
    let status: String = row.try_get("status").map_err(map_sqlx_error)?;

    Ok(UserAggregate {
        user_id: row.try_get("user_id").map_err(map_sqlx_error)?,
        first_seen_at: row.try_get("first_seen_at").map_err(map_sqlx_error)?,
        last_seen_at: row.try_get("last_seen_at").map_err(map_sqlx_error)?,
        total_event_count: u64::try_from(total)
            .map_err(|_| StoreError::Serialization(format!("negative total_event_count {total}")))?,
        status: status
            .parse::<UserStatus>()
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        version: row.try_get("version").map_err(map_sqlx_error)?,
    })
}

impl EventStore for PostgresStore {
    fn find_by_coordinates<'a>(
        &'a self,
        coordinates: &'a LogCoordinates,
    ) -> Pin<Box<dyn Future<Output = Result<Option<StoredEventRef>, StoreError>> + Send + 'a>> {
        Box::pin(self.find_event(coordinates))
    }

    fn insert<'a>(
        &'a self,
        event: &'a Event,
        coordinates: &'a LogCoordinates,
    ) -> Pin<Box<dyn Future<Output = Result<InsertOutcome, StoreError>> + Send + 'a>> {
        Box::pin(self.insert_event(event, coordinates))
    }

    fn ping(&self) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map(|_| ())
                .map_err(|e| StoreError::Unavailable(e.to_string()))
        })
    }
}

impl AggregateStore for PostgresStore {
    fn load<'a>(
        &'a self,
        user_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<UserAggregate>, StoreError>> + Send + 'a>> {
        Box::pin(self.load_aggregate(user_id))
    }

    fn compare_and_swap(
        &self,
        update: AggregateUpdate,
    ) -> Pin<Box<dyn Future<Output = Result<CasOutcome, StoreError>> + Send + '_>> {
        Box::pin(self.apply(update))
    }
}

impl DeadLetterSink for PostgresStore {
    fn record(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.dead_letter_queue().add_entry(&letter).await?;
            Ok(())
        })
    }
}

impl EventReader for PostgresStore {
    fn get_event(
        &self,
        id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<StoredEvent>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM analytics_events WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            row.as_ref().map(event_from_row).transpose()
        })
    }

    fn list_events<'a>(
        &'a self,
        query: &'a EventQuery,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<StoredEvent>, StoreError>> + Send + 'a>> {
        Box::pin(self.list(query))
    }

    fn get_user<'a>(
        &'a self,
        user_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<UserAggregate>, StoreError>> + Send + 'a>> {
        Box::pin(self.load_aggregate(user_id))
    }
}
