use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::{MarkOutcome, ProcessedEventLedger};
use crate::error::LedgerResult;

/// Ledger backed by the `processed_events` table
#[derive(Clone)]
pub struct PgProcessedEventLedger {
    pool: PgPool,
}

impl PgProcessedEventLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record the event on the caller's connection, usually inside the same
    /// transaction as the side effect
    ///
    /// Uses `ON CONFLICT DO NOTHING` so a duplicate does not abort the
    /// surrounding transaction.
    pub async fn mark_processed_in(
        conn: &mut PgConnection,
        event_id: Uuid,
        service_name: &str,
    ) -> LedgerResult<MarkOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_events (event_id, service_name)
            VALUES ($1, $2)
            ON CONFLICT (event_id, service_name) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(service_name)
        .execute(conn)
        .await?;

        if result.rows_affected() == 0 {
            Ok(MarkOutcome::AlreadyProcessed)
        } else {
            Ok(MarkOutcome::Recorded)
        }
    }
}

#[async_trait]
impl ProcessedEventLedger for PgProcessedEventLedger {
    async fn has_processed(&self, event_id: Uuid, service_name: &str) -> LedgerResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM processed_events
                WHERE event_id = $1 AND service_name = $2
            )
            "#,
        )
        .bind(event_id)
        .bind(service_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn mark_processed(&self, event_id: Uuid, service_name: &str) -> LedgerResult<MarkOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_events (event_id, service_name)
            VALUES ($1, $2)
            "#,
        )
        .bind(event_id)
        .bind(service_name)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(MarkOutcome::Recorded),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                tracing::debug!(
                    event_id = %event_id,
                    service_name = %service_name,
                    "Event already recorded in ledger"
                );
                Ok(MarkOutcome::AlreadyProcessed)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> LedgerResult<u64> {
        let result = sqlx::query("DELETE FROM processed_events WHERE processed_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
