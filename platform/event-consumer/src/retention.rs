//! Ledger retention
//!
//! Ledger rows only need to outlive the broker's redelivery window. Older
//! rows are purged on a fixed interval.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::LedgerResult;
use crate::ledger::ProcessedEventLedger;

/// Default retention for ledger rows
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Delete ledger rows older than `retention`
pub async fn purge_expired<L>(ledger: &L, retention: Duration) -> LedgerResult<u64>
where
    L: ProcessedEventLedger + ?Sized,
{
    let cutoff = chrono::Duration::from_std(retention)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    let purged = ledger.purge_older_than(cutoff).await?;
    if purged > 0 {
        tracing::info!(purged, cutoff = %cutoff, "Purged expired processed-event rows");
    }
    Ok(purged)
}

/// Run [`purge_expired`] every `interval` until shutdown
pub fn start_retention_sweeper<L>(
    ledger: Arc<L>,
    retention: Duration,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    L: ProcessedEventLedger + ?Sized + 'static,
{
    tokio::spawn(async move {
        tracing::info!(
            retention_days = retention.as_secs() / 86_400,
            interval_secs = interval.as_secs(),
            "Ledger retention sweeper started"
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = purge_expired(ledger.as_ref(), retention).await {
                tracing::error!(error = %e, "Ledger retention sweep failed");
            }
        }

        tracing::info!("Ledger retention sweeper stopped");
    })
}
