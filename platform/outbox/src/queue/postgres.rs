//! Postgres-backed job queue
//!
//! Table `outbox_publish_jobs`. Workers claim jobs with
//! `FOR UPDATE SKIP LOCKED` and hold them for a lease; a job whose lease
//! runs out (worker crashed mid-delivery) becomes claimable again.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::time::Duration;
use uuid::Uuid;

use super::{BackoffPolicy, JobOptions, JobQueue, PublishJob, PublishJobPayload, ReservedJob};
use crate::error::{QueueError, QueueResult};

#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    lease: Duration,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, lease: Duration) -> Self {
        Self { pool, lease }
    }

    async fn set_state(
        &self,
        job_id: &str,
        state: &str,
        error: Option<&str>,
    ) -> QueueResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_publish_jobs
            SET state = $2, locked_until = NULL, last_error = COALESCE($3, last_error), updated_at = NOW()
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(state)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownJob(job_id.to_string()));
        }
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct ClaimedRow {
    job_id: String,
    name: String,
    event_id: Uuid,
    attempts_made: i32,
    max_attempts: i32,
    backoff_delay_ms: i64,
}

impl From<ClaimedRow> for ReservedJob {
    fn from(row: ClaimedRow) -> Self {
        let attempts = u32::try_from(row.max_attempts).unwrap_or(1);
        let base = Duration::from_millis(u64::try_from(row.backoff_delay_ms).unwrap_or(0));
        ReservedJob {
            job: PublishJob {
                job_id: row.job_id,
                name: row.name,
                payload: PublishJobPayload {
                    event_id: row.event_id,
                },
                options: JobOptions {
                    attempts,
                    backoff: BackoffPolicy::exponential(base),
                },
            },
            attempt: u32::try_from(row.attempts_made).unwrap_or(1),
        }
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, job: PublishJob) -> QueueResult<bool> {
        Ok(self.enqueue_bulk(vec![job]).await? == 1)
    }

    async fn enqueue_bulk(&self, jobs: Vec<PublishJob>) -> QueueResult<usize> {
        if jobs.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO outbox_publish_jobs (job_id, name, event_id, max_attempts, backoff_delay_ms) ",
        );
        builder.push_values(&jobs, |mut row, job| {
            row.push_bind(&job.job_id)
                .push_bind(&job.name)
                .push_bind(job.payload.event_id)
                .push_bind(i32::try_from(job.options.attempts).unwrap_or(i32::MAX))
                .push_bind(millis(job.options.backoff.base_delay));
        });
        builder.push(" ON CONFLICT (job_id) DO NOTHING");

        let result = builder.build().execute(&self.pool).await?;
        let added = usize::try_from(result.rows_affected()).unwrap_or(usize::MAX);

        tracing::debug!(submitted = jobs.len(), added, "Publish jobs enqueued");
        Ok(added)
    }

    async fn reserve(&self) -> QueueResult<Option<ReservedJob>> {
        let row: Option<ClaimedRow> = sqlx::query_as(
            r#"
            UPDATE outbox_publish_jobs AS j
            SET state = 'active',
                attempts_made = j.attempts_made + 1,
                locked_until = NOW() + ($1 * INTERVAL '1 millisecond'),
                updated_at = NOW()
            WHERE j.job_id = (
                SELECT job_id
                FROM outbox_publish_jobs
                WHERE (state = 'waiting' AND run_at <= NOW())
                   OR (state = 'active' AND locked_until < NOW())
                ORDER BY run_at ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING j.job_id, j.name, j.event_id, j.attempts_made, j.max_attempts, j.backoff_delay_ms
            "#,
        )
        .bind(millis(self.lease) as f64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ReservedJob::from))
    }

    async fn complete(&self, job_id: &str) -> QueueResult<()> {
        self.set_state(job_id, "completed", None).await
    }

    async fn retry(&self, job_id: &str, delay: Duration, error: &str) -> QueueResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_publish_jobs
            SET state = 'waiting',
                run_at = NOW() + ($2 * INTERVAL '1 millisecond'),
                locked_until = NULL,
                last_error = $3,
                updated_at = NOW()
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(millis(delay) as f64)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownJob(job_id.to_string()));
        }
        Ok(())
    }

    async fn defer(&self, job_id: &str, delay: Duration) -> QueueResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_publish_jobs
            SET state = 'waiting',
                run_at = NOW() + ($2 * INTERVAL '1 millisecond'),
                locked_until = NULL,
                attempts_made = GREATEST(attempts_made - 1, 0),
                updated_at = NOW()
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(millis(delay) as f64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::UnknownJob(job_id.to_string()));
        }
        Ok(())
    }

    async fn fail(&self, job_id: &str, error: &str) -> QueueResult<()> {
        self.set_state(job_id, "failed", Some(error)).await
    }
}
