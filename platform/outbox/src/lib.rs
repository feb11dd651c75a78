//! # Transactional Outbox
//!
//! Integration events are written to an `outbox_events` table in the same
//! database transaction as the business change they announce. A delivery
//! job per entry is scheduled after commit, and a worker pool publishes the
//! stored envelope to the event bus with exponential-backoff retries.
//!
//! ## Pieces
//!
//! - [`UnitOfWork`]: one transaction around a unit of business work
//! - [`OutboxStore`]: durable entries, appended through the caller's transaction
//! - [`Outbox`]: builds envelopes and appends events
//! - [`PublishScheduler`]: turns committed event ids into [`JobQueue`] jobs
//! - [`OutboxPublisher`]: delivers jobs and moves entries to `published` or `failed`
//! - [`reconcile_stale_pending`]: re-schedules entries that never got a job
//!
//! Postgres and in-memory adapters ship for every port.

pub mod config;
pub mod error;
mod outbox;
pub mod queue;
mod reconcile;
mod scheduler;
pub mod store;
pub mod unit_of_work;
mod worker;

pub use config::OutboxConfig;
pub use error::{OutboxError, OutboxResult, QueueError, QueueResult, UnitOfWorkError};
pub use outbox::{Outbox, OutboxEvent};
pub use queue::{
    BackoffPolicy, InMemoryJobQueue, JobOptions, JobQueue, JobState, PgJobQueue, PublishJob,
    ReservedJob, PUBLISH_JOB_NAME,
};
pub use reconcile::{reconcile_stale_pending, start_reconciler, RECONCILE_BATCH_SIZE};
pub use scheduler::PublishScheduler;
pub use store::{
    InMemoryOutboxStore, NewOutboxEntry, OutboxEntry, OutboxStatus, OutboxStore, PgOutboxStore,
};
pub use unit_of_work::{
    MemoryTransaction, MemoryUnitOfWork, PgTransaction, PgUnitOfWork, UnitOfWork,
};
pub use worker::{
    start_publisher, DeliveryOutcome, OutboxPublisher, PrefixTopicResolver, TopicResolver,
};

/// Apply the `outbox_events` and `outbox_publish_jobs` migrations
pub async fn run_migrations(pool: &sqlx::PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    let mut migrator = sqlx::migrate!("./db/migrations");
    migrator.set_ignore_missing(true);
    migrator.run(pool).await
}
