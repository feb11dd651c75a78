use event_consumer::PgProcessedEventLedger;
use outbox::{PgJobQueue, PgOutboxStore};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use outbox_relay::{bus::connect_bus, config::Config, db, Relay};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!("Starting outbox relay...");

    let config = Config::from_env()?;
    tracing::info!(
        bus_type = ?config.bus_type,
        source_service = %config.outbox.source_service,
        concurrency = config.outbox.worker_concurrency,
        "Configuration loaded"
    );

    tracing::info!("Connecting to database...");
    let pool = db::init_pool(&config.database_url, &config.pool).await?;

    tracing::info!("Running migrations...");
    db::run_migrations(&pool).await?;

    let bus = connect_bus(&config).await?;

    let relay = Relay::start(
        Arc::new(PgOutboxStore::new(pool.clone())),
        Arc::new(PgJobQueue::new(pool.clone(), config.outbox.job_lease)),
        bus,
        Arc::new(PgProcessedEventLedger::new(pool.clone())),
        &config,
    );

    tokio::signal::ctrl_c().await?;
    relay.shutdown().await;
    pool.close().await;

    Ok(())
}
