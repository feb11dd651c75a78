//! Postgres outbox store
//!
//! Table `outbox_events`, see `db/migrations`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::{NewOutboxEntry, OutboxEntry, OutboxStatus, OutboxStore};
use crate::error::{OutboxError, OutboxResult};
use crate::unit_of_work::PgTransaction;

#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// One multi-row INSERT, so the batch is a single round-trip
    async fn insert_on(conn: &mut PgConnection, entries: &[NewOutboxEntry]) -> OutboxResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO outbox_events (event_id, aggregate_id, event_type, payload, status, retry_count) ",
        );
        builder.push_values(entries, |mut row, entry| {
            row.push_bind(entry.event_id)
                .push_bind(&entry.aggregate_id)
                .push_bind(&entry.event_type)
                .push_bind(Json(&entry.payload))
                .push_bind(OutboxStatus::Pending.as_str())
                .push_bind(0i32);
        });

        builder.build().execute(conn).await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct OutboxRow {
    event_id: Uuid,
    aggregate_id: String,
    event_type: String,
    payload: Json<serde_json::Value>,
    status: String,
    retry_count: i32,
    created_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
}

impl TryFrom<OutboxRow> for OutboxEntry {
    type Error = OutboxError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        Ok(Self {
            event_id: row.event_id,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            payload: row.payload.0,
            status: row.status.parse().map_err(OutboxError::Store)?,
            retry_count: row.retry_count,
            created_at: row.created_at,
            published_at: row.published_at,
        })
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    type Tx = PgTransaction;

    async fn insert_in_tx(&self, entries: &[NewOutboxEntry], tx: &mut PgTransaction) -> OutboxResult<()> {
        Self::insert_on(tx.connection(), entries).await
    }

    async fn insert(&self, entries: &[NewOutboxEntry]) -> OutboxResult<()> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_on(&mut conn, entries).await
    }

    async fn find(&self, event_id: Uuid) -> OutboxResult<Option<OutboxEntry>> {
        let row: Option<OutboxRow> = sqlx::query_as(
            r#"
            SELECT event_id, aggregate_id, event_type, payload, status,
                   retry_count, created_at, published_at
            FROM outbox_events
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(OutboxEntry::try_from).transpose()
    }

    async fn mark_published(&self, event_id: Uuid) -> OutboxResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'published', published_at = NOW()
            WHERE event_id = $1 AND status = 'pending'
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_retry(&self, event_id: Uuid) -> OutboxResult<Option<i32>> {
        let retry_count = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE outbox_events
            SET retry_count = retry_count + 1
            WHERE event_id = $1 AND status = 'pending'
            RETURNING retry_count
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(retry_count)
    }

    async fn mark_failed(&self, event_id: Uuid) -> OutboxResult<Option<i32>> {
        let retry_count = sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE outbox_events
            SET status = 'failed', retry_count = retry_count + 1
            WHERE event_id = $1 AND status = 'pending'
            RETURNING retry_count
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(retry_count)
    }

    async fn has_older_pending(&self, event_id: Uuid) -> OutboxResult<bool> {
        let blocked = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM outbox_events me
                JOIN outbox_events older
                  ON older.aggregate_id = me.aggregate_id
                 AND older.seq < me.seq
                WHERE me.event_id = $1 AND older.status = 'pending'
            )
            "#,
        )
        .bind(event_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(blocked)
    }

    async fn find_stale_pending(&self, cutoff: DateTime<Utc>, limit: i64) -> OutboxResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT event_id
            FROM outbox_events
            WHERE status = 'pending' AND created_at <= $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }
}
