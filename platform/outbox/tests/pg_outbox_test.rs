//! Postgres adapter tests
//!
//! Need a live database: `DATABASE_URL=... cargo test -p outbox -- --ignored`

mod common;

use common::{setup_test_pool, FlakyBus};
use outbox::{
    BackoffPolicy, DeliveryOutcome, JobOptions, JobQueue, NewOutboxEntry, Outbox, OutboxConfig, OutboxError,
    OutboxPublisher, OutboxStatus, OutboxStore, PgJobQueue, PgOutboxStore, PgUnitOfWork, PublishJob,
    PublishScheduler, UnitOfWork,
};
use serde_json::json;
use serial_test::serial;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

async fn reserve_when_due(queue: &PgJobQueue) -> outbox::ReservedJob {
    for _ in 0..200 {
        if let Some(reserved) = queue.reserve().await.unwrap() {
            return reserved;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no publish job became due");
}

async fn setup_users_table(pool: &PgPool) {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS outbox_test_users (
            id    TEXT PRIMARY KEY,
            email TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .expect("Failed to create test users table");
}

fn outbox_for(pool: &PgPool) -> Outbox<PgOutboxStore, PgJobQueue> {
    let config = OutboxConfig::default();
    let queue = Arc::new(PgJobQueue::new(pool.clone(), config.job_lease));
    Outbox::new(
        Arc::new(PgOutboxStore::new(pool.clone())),
        PublishScheduler::from_config(queue, &config),
        &config,
    )
}

fn job_options() -> JobOptions {
    JobOptions {
        attempts: 3,
        backoff: BackoffPolicy::exponential(Duration::from_millis(100)),
    }
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_pg_aggregate_and_event_commit_atomically() {
    let pool = setup_test_pool().await;
    setup_users_table(&pool).await;
    let uow = PgUnitOfWork::new(pool.clone());
    let outbox = outbox_for(&pool);
    let user_id = format!("user-{}", Uuid::new_v4());

    let writer = outbox.clone();
    let id = user_id.clone();
    let event_id = uow
        .execute(move |tx| {
            Box::pin(async move {
                sqlx::query("INSERT INTO outbox_test_users (id, email) VALUES ($1, $2)")
                    .bind(&id)
                    .bind("ada@example.com")
                    .execute(tx.connection())
                    .await?;
                writer
                    .save_event("user.created", &json!({"userId": id}), &id, tx)
                    .await
            })
        })
        .await
        .expect("unit of work should commit");

    let entry = outbox.store().find(event_id).await.unwrap().unwrap();
    assert_eq!(entry.status, OutboxStatus::Pending);
    assert_eq!(entry.aggregate_id, user_id);
    assert_eq!(entry.payload["payload"]["userId"], json!(user_id));
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_pg_failed_outbox_insert_rolls_back_aggregate() {
    let pool = setup_test_pool().await;
    setup_users_table(&pool).await;
    let uow = PgUnitOfWork::new(pool.clone());
    let store = Arc::new(PgOutboxStore::new(pool.clone()));

    let existing = NewOutboxEntry {
        event_id: Uuid::new_v4(),
        aggregate_id: "agg-1".to_string(),
        event_type: "x.created".to_string(),
        payload: json!({}),
    };
    store.insert(std::slice::from_ref(&existing)).await.unwrap();

    let user_id = format!("user-{}", Uuid::new_v4());
    let id = user_id.clone();
    let writer = store.clone();
    let result: Result<(), OutboxError> = uow
        .execute(move |tx| {
            Box::pin(async move {
                sqlx::query("INSERT INTO outbox_test_users (id, email) VALUES ($1, $2)")
                    .bind(&id)
                    .bind("ada@example.com")
                    .execute(tx.connection())
                    .await?;
                // Primary key clash forces the outbox insert to fail
                writer.insert_in_tx(&[existing], tx).await
            })
        })
        .await;

    assert!(matches!(result, Err(OutboxError::Database(_))));
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox_test_users WHERE id = $1")
        .bind(&user_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0, "aggregate row must be rolled back");
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_pg_dispatch_creates_pending_row_and_job() {
    let pool = setup_test_pool().await;
    let outbox = outbox_for(&pool);

    let event_id = outbox
        .save_event_and_dispatch("x.created", &json!({"foo": 1}), "agg-1")
        .await
        .unwrap();

    let entry = outbox.store().find(event_id).await.unwrap().unwrap();
    assert_eq!(entry.status, OutboxStatus::Pending);

    let (job_id, state): (String, String) =
        sqlx::query_as("SELECT job_id, state FROM outbox_publish_jobs WHERE event_id = $1")
            .bind(event_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(job_id, event_id.to_string());
    assert_eq!(state, "waiting");
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_pg_status_transitions_are_guarded_by_pending() {
    let pool = setup_test_pool().await;
    let store = PgOutboxStore::new(pool.clone());
    let event_id = Uuid::new_v4();
    store
        .insert(&[NewOutboxEntry {
            event_id,
            aggregate_id: "agg-1".to_string(),
            event_type: "x.created".to_string(),
            payload: json!({"eventId": event_id}),
        }])
        .await
        .unwrap();

    assert_eq!(store.record_retry(event_id).await.unwrap(), Some(1));
    assert_eq!(store.mark_failed(event_id).await.unwrap(), Some(2));
    assert!(!store.mark_published(event_id).await.unwrap());
    assert_eq!(store.record_retry(event_id).await.unwrap(), None);

    let entry = store.find(event_id).await.unwrap().unwrap();
    assert_eq!(entry.status, OutboxStatus::Failed);
    assert_eq!(entry.retry_count, 2);
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_pg_queue_dedupes_and_honours_retry_delay() {
    let pool = setup_test_pool().await;
    sqlx::query("DELETE FROM outbox_publish_jobs")
        .execute(&pool)
        .await
        .unwrap();
    let queue = PgJobQueue::new(pool.clone(), Duration::from_secs(60));
    let job = PublishJob::for_event(Uuid::new_v4(), job_options());

    assert!(queue.enqueue(job.clone()).await.unwrap());
    assert!(!queue.enqueue(job.clone()).await.unwrap());

    let reserved = queue.reserve().await.unwrap().unwrap();
    assert_eq!(reserved.job, job);
    assert_eq!(reserved.attempt, 1);
    assert!(queue.reserve().await.unwrap().is_none(), "leased job is invisible");

    queue
        .retry(&job.job_id, Duration::from_secs(3600), "broker down")
        .await
        .unwrap();
    assert!(queue.reserve().await.unwrap().is_none(), "job waits out its delay");

    queue.complete(&job.job_id).await.unwrap();
    assert!(!queue.enqueue(job).await.unwrap());
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_pg_expired_lease_makes_job_claimable_again() {
    let pool = setup_test_pool().await;
    sqlx::query("DELETE FROM outbox_publish_jobs")
        .execute(&pool)
        .await
        .unwrap();
    let queue = PgJobQueue::new(pool.clone(), Duration::from_millis(1));
    queue
        .enqueue(PublishJob::for_event(Uuid::new_v4(), job_options()))
        .await
        .unwrap();

    let first = queue.reserve().await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = queue.reserve().await.unwrap().unwrap();

    assert_eq!(first.job.job_id, second.job.job_id);
    assert_eq!(second.attempt, 2);
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_pg_worker_retries_transient_failures_then_publishes() {
    let pool = setup_test_pool().await;
    sqlx::query("DELETE FROM outbox_publish_jobs")
        .execute(&pool)
        .await
        .unwrap();

    let config = OutboxConfig {
        max_attempts: 3,
        backoff_base: Duration::from_millis(50),
        publish_timeout: Duration::from_secs(1),
        ..OutboxConfig::default()
    };
    let store = Arc::new(PgOutboxStore::new(pool.clone()));
    let queue = Arc::new(PgJobQueue::new(pool.clone(), config.job_lease));
    let outbox = Outbox::new(
        store.clone(),
        PublishScheduler::from_config(queue.clone(), &config),
        &config,
    );
    let bus = Arc::new(FlakyBus::new(2));
    let publisher = OutboxPublisher::new(store.clone(), queue.clone(), bus.clone(), &config);

    let aggregate_id = format!("agg-{}", Uuid::new_v4());
    let event_id = outbox
        .save_event_and_dispatch("x.created", &json!({"foo": 1}), &aggregate_id)
        .await
        .unwrap();

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        let reserved = reserve_when_due(&queue).await;
        assert_eq!(reserved.job.payload.event_id, event_id);
        outcomes.push(publisher.process_job(reserved).await.unwrap());
    }

    assert_eq!(
        outcomes,
        vec![
            DeliveryOutcome::Retrying {
                attempt: 1,
                delay: Duration::from_millis(50)
            },
            DeliveryOutcome::Retrying {
                attempt: 2,
                delay: Duration::from_millis(100)
            },
            DeliveryOutcome::Published,
        ]
    );

    let entry = store.find(event_id).await.unwrap().unwrap();
    assert_eq!(entry.status, OutboxStatus::Published);
    assert_eq!(entry.retry_count, 2);
    assert!(entry.published_at.is_some());

    let state: String =
        sqlx::query_scalar("SELECT state FROM outbox_publish_jobs WHERE job_id = $1")
            .bind(event_id.to_string())
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(state, "completed");
    assert_eq!(bus.inner.published().len(), 1);
}

#[tokio::test]
#[serial]
#[ignore]
async fn test_pg_older_pending_entry_of_same_aggregate_blocks_newer() {
    let pool = setup_test_pool().await;
    let store = PgOutboxStore::new(pool.clone());
    let aggregate_id = format!("agg-{}", Uuid::new_v4());
    let entries: Vec<NewOutboxEntry> = (0..2)
        .map(|_| NewOutboxEntry {
            event_id: Uuid::new_v4(),
            aggregate_id: aggregate_id.clone(),
            event_type: "x.updated".to_string(),
            payload: json!({}),
        })
        .collect();
    store.insert(&entries).await.unwrap();

    assert!(!store.has_older_pending(entries[0].event_id).await.unwrap());
    assert!(store.has_older_pending(entries[1].event_id).await.unwrap());

    store.mark_published(entries[0].event_id).await.unwrap();
    assert!(!store.has_older_pending(entries[1].event_id).await.unwrap());
}
