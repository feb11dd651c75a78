use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::DbPoolConfig;

/// Connect to Postgres with the configured pool limits
pub async fn init_pool(database_url: &str, limits: &DbPoolConfig) -> Result<PgPool, sqlx::Error> {
    tracing::debug!(
        max_connections = limits.max_connections,
        min_connections = limits.min_connections,
        acquire_timeout_ms = limits.acquire_timeout.as_millis() as u64,
        "Opening database pool"
    );

    PgPoolOptions::new()
        .max_connections(limits.max_connections)
        .min_connections(limits.min_connections)
        .acquire_timeout(limits.acquire_timeout)
        .connect(database_url)
        .await
}

/// Apply the outbox and ledger migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    outbox::run_migrations(pool).await?;
    event_consumer::run_migrations(pool).await
}
