//! # Event Consumer
//!
//! Consumer side of at-least-once delivery. Every consuming service records
//! the events it has handled in a `processed_events` ledger and skips any
//! envelope it has seen before.
//!
//! ```rust,no_run
//! use event_bus::{consumer_retry::RetryConfig, EventBus, EventEnvelope};
//! use event_consumer::{start_consumer, IdempotentConsumer, PgProcessedEventLedger};
//! use std::sync::Arc;
//!
//! # fn example(pool: sqlx::PgPool, bus: Arc<dyn EventBus>) {
//! let ledger = Arc::new(PgProcessedEventLedger::new(pool));
//! let consumer = Arc::new(IdempotentConsumer::new(ledger, "billing"));
//!
//! start_consumer(
//!     bus,
//!     "events.user.created",
//!     consumer,
//!     |envelope: EventEnvelope<serde_json::Value>| async move {
//!         tracing::info!(event_id = %envelope.event_id, "Creating billing account");
//!         Ok::<_, String>(())
//!     },
//!     RetryConfig::default(),
//! );
//! # }
//! ```

mod consumer;
pub mod error;
pub mod ledger;
pub mod retention;

pub use consumer::{start_consumer, ConsumeOutcome, IdempotentConsumer};
pub use error::{ConsumeError, LedgerError, LedgerResult};
pub use ledger::{InMemoryLedger, MarkOutcome, PgProcessedEventLedger, ProcessedEventLedger};
pub use retention::{purge_expired, start_retention_sweeper, DEFAULT_RETENTION};

/// Apply the `processed_events` migration
pub async fn run_migrations(pool: &sqlx::PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    let mut migrator = sqlx::migrate!("./db/migrations");
    migrator.set_ignore_missing(true);
    migrator.run(pool).await
}
