use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;

use super::{Ack, EventStore, ExpirySweeper, StoreError, StoreLimits};
use crate::event::{EventType, PlaybackEvent, PlaybackMetadata};

/// An `EventStore` backed by the `playback_events` table.
///
/// The `(user_id, "timestamp")` access path is a B-tree index over the same
/// row, so it always projects exactly what the primary row holds.
#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
    limits: StoreLimits,
}

#[derive(sqlx::FromRow)]
struct EventRow {
    event_id: String,
    user_id: String,
    book_id: String,
    event_type: EventType,
    timestamp: DateTime<Utc>,
    position: Option<f64>,
    chapter: Option<i32>,
    metadata: Option<Json<PlaybackMetadata>>,
    processed_at: DateTime<Utc>,
    ttl: DateTime<Utc>,
}

impl From<EventRow> for PlaybackEvent {
    fn from(row: EventRow) -> Self {
        PlaybackEvent {
            event_id: row.event_id,
            user_id: row.user_id,
            book_id: row.book_id,
            event_type: row.event_type,
            timestamp: row.timestamp,
            position: row.position,
            chapter: row.chapter.and_then(|chapter| u32::try_from(chapter).ok()),
            metadata: row.metadata.map(|Json(metadata)| metadata),
            processed_at: row.processed_at,
            ttl: row.ttl,
        }
    }
}

const EVENT_COLUMNS: &str = r#"event_id, user_id, book_id, event_type, "timestamp", position, chapter, metadata, processed_at, ttl"#;

impl PgEventStore {
    pub async fn new(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
        limits: StoreLimits,
    ) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await?;

        Ok(Self::from_pool(pool, limits))
    }

    pub fn from_pool(pool: PgPool, limits: StoreLimits) -> Self {
        Self { pool, limits }
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn put(&self, event: &PlaybackEvent) -> Result<Ack, StoreError> {
        self.limits.check(event)?;

        let chapter = event
            .chapter
            .map(i32::try_from)
            .transpose()
            .map_err(|_| StoreError::Rejected("chapter does not fit in 32 bits".to_owned()))?;

        // The update only happens when the content differs or the stored row has
        // expired. Otherwise no row is returned and the write is a no-op.
        let query = r#"
INSERT INTO playback_events AS existing
    (event_id, user_id, book_id, event_type, "timestamp", position, chapter, metadata, processed_at, ttl)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
ON CONFLICT (event_id) DO UPDATE SET
    user_id = EXCLUDED.user_id,
    book_id = EXCLUDED.book_id,
    event_type = EXCLUDED.event_type,
    "timestamp" = EXCLUDED."timestamp",
    position = EXCLUDED.position,
    chapter = EXCLUDED.chapter,
    metadata = EXCLUDED.metadata,
    processed_at = EXCLUDED.processed_at,
    ttl = EXCLUDED.ttl
WHERE
    (existing.user_id, existing.book_id, existing.event_type, existing."timestamp", existing.position, existing.chapter, existing.metadata)
        IS DISTINCT FROM
    (EXCLUDED.user_id, EXCLUDED.book_id, EXCLUDED.event_type, EXCLUDED."timestamp", EXCLUDED.position, EXCLUDED.chapter, EXCLUDED.metadata)
    OR existing.ttl <= EXCLUDED.processed_at
RETURNING (xmax = 0) AS inserted
        "#;

        let inserted: Option<bool> = sqlx::query_scalar(query)
            .bind(&event.event_id)
            .bind(&event.user_id)
            .bind(&event.book_id)
            .bind(event.event_type)
            .bind(event.timestamp)
            .bind(event.position)
            .bind(chapter)
            .bind(event.metadata.as_ref().map(Json))
            .bind(event.processed_at)
            .bind(event.ttl)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify_error)?;

        Ok(match inserted {
            Some(true) => Ack::Created,
            Some(false) => Ack::Updated,
            None => Ack::Unchanged,
        })
    }

    async fn get(&self, event_id: &str) -> Result<Option<PlaybackEvent>, StoreError> {
        let query = format!(
            "SELECT {EVENT_COLUMNS} FROM playback_events WHERE event_id = $1 AND ttl > now()"
        );

        let row: Option<EventRow> = sqlx::query_as(&query)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(classify_error)?;

        Ok(row.map(PlaybackEvent::from))
    }

    async fn events_for_user(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<PlaybackEvent>, StoreError> {
        let query = format!(
            r#"
SELECT {EVENT_COLUMNS}
FROM playback_events
WHERE user_id = $1 AND "timestamp" >= $2 AND "timestamp" < $3 AND ttl > now()
ORDER BY "timestamp", event_id
LIMIT $4
            "#
        );

        let rows: Vec<EventRow> = sqlx::query_as(&query)
            .bind(user_id)
            .bind(from)
            .bind(to)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(classify_error)?;

        Ok(rows.into_iter().map(PlaybackEvent::from).collect())
    }
}

#[async_trait]
impl ExpirySweeper for PgEventStore {
    async fn sweep_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<u64, StoreError> {
        let query = r#"
WITH expired AS (
    SELECT event_id
    FROM playback_events
    WHERE ttl <= $1
    ORDER BY ttl
    LIMIT $2
    FOR UPDATE SKIP LOCKED
)
DELETE FROM playback_events
USING expired
WHERE playback_events.event_id = expired.event_id
        "#;

        let result = sqlx::query(query)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .execute(&self.pool)
            .await
            .map_err(classify_error)?;

        Ok(result.rows_affected())
    }
}

/// Map a sqlx error onto the store's failure taxonomy, preferring SQLSTATE classes.
pub fn classify_error(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::PoolTimedOut => StoreError::Timeout("timed out acquiring a connection".to_owned()),
        sqlx::Error::PoolClosed => StoreError::ConnectionLost(error.to_string()),
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) => {
            StoreError::Unavailable(error.to_string())
        }
        sqlx::Error::Database(ref db_error) => {
            let code = db_error.code().map(|code| code.into_owned());
            let message = db_error.message().to_owned();
            match code.as_deref() {
                // query_canceled, usually statement_timeout
                Some("57014") => StoreError::Timeout(message),
                // insufficient resources, serialization failures and deadlocks
                Some(code) if code.starts_with("53") || code.starts_with("40") => {
                    StoreError::Throttled(message)
                }
                Some(code) if code.starts_with("08") || code.starts_with("57") => {
                    StoreError::Unavailable(message)
                }
                // character_not_in_repertoire, e.g. a NUL byte in a key
                Some("22021") => StoreError::MalformedKey(message),
                // data exceptions, constraint violations and anything unknown
                _ => StoreError::Rejected(message),
            }
        }
        other => StoreError::Rejected(other.to_string()),
    }
}
