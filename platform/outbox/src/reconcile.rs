//! Reconciliation sweep
//!
//! Re-schedules `pending` entries that have sat in the outbox longer than
//! expected. That covers a dispatch whose enqueue failed after the entry was
//! committed, and a caller that committed but never scheduled. Entries that
//! already have a job are untouched, since the job id is the event id.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::OutboxResult;
use crate::queue::JobQueue;
use crate::scheduler::PublishScheduler;
use crate::store::OutboxStore;

/// Entries scanned per sweep
pub const RECONCILE_BATCH_SIZE: i64 = 500;

/// Schedule delivery for `pending` entries older than `older_than`
///
/// Returns the number of jobs that were actually added.
pub async fn reconcile_stale_pending<S, Q>(
    store: &S,
    scheduler: &PublishScheduler<Q>,
    older_than: Duration,
    batch: i64,
) -> OutboxResult<usize>
where
    S: OutboxStore + ?Sized,
    Q: JobQueue,
{
    let cutoff = chrono::Duration::from_std(older_than)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    let stale = store.find_stale_pending(cutoff, batch).await?;
    if stale.is_empty() {
        return Ok(0);
    }

    let added = scheduler.schedule_publishing(&stale).await?;
    if added > 0 {
        tracing::warn!(
            stale = stale.len(),
            added,
            "Re-scheduled stale pending outbox events"
        );
    } else {
        tracing::debug!(stale = stale.len(), "Stale pending outbox events already queued");
    }

    Ok(added)
}

/// Run [`reconcile_stale_pending`] every `interval` until shutdown
pub fn start_reconciler<S, Q>(
    store: Arc<S>,
    scheduler: PublishScheduler<Q>,
    older_than: Duration,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    S: OutboxStore + 'static,
    Q: JobQueue + 'static,
{
    tokio::spawn(async move {
        tracing::info!(
            interval_secs = interval.as_secs(),
            older_than_secs = older_than.as_secs(),
            "Outbox reconciler started"
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

            if let Err(e) =
                reconcile_stale_pending(store.as_ref(), &scheduler, older_than, RECONCILE_BATCH_SIZE)
                    .await
            {
                tracing::error!(error = %e, "Outbox reconciliation sweep failed");
            }
        }

        tracing::info!("Outbox reconciler stopped");
    })
}
