use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use super::{NewOutboxEntry, OutboxEntry, OutboxStatus, OutboxStore};
use crate::error::{OutboxError, OutboxResult};
use crate::unit_of_work::{lock_commits, MemoryTransaction};

/// In-memory outbox store for tests and local development
///
/// Joins a [`MemoryTransaction`] by staging its rows, so they appear only if
/// the unit of work commits.
#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    entries: Arc<Mutex<Vec<OutboxEntry>>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all entries in insertion order
    pub fn entries(&self) -> Vec<OutboxEntry> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<OutboxEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_unique(entries: &Mutex<Vec<OutboxEntry>>, new: &[NewOutboxEntry]) -> OutboxResult<()> {
        let rows = entries.lock().unwrap_or_else(PoisonError::into_inner);
        Self::reject_duplicates(&rows, new)
    }

    fn reject_duplicates(rows: &[OutboxEntry], new: &[NewOutboxEntry]) -> OutboxResult<()> {
        for (i, entry) in new.iter().enumerate() {
            let clash = rows.iter().any(|row| row.event_id == entry.event_id)
                || new[..i].iter().any(|prev| prev.event_id == entry.event_id);
            if clash {
                return Err(OutboxError::Store(format!(
                    "duplicate outbox event id {}",
                    entry.event_id
                )));
            }
        }
        Ok(())
    }

    fn append(entries: &Mutex<Vec<OutboxEntry>>, new: &[NewOutboxEntry]) -> OutboxResult<()> {
        let mut rows = entries.lock().unwrap_or_else(PoisonError::into_inner);
        Self::reject_duplicates(&rows, new)?;
        let now = Utc::now();
        rows.extend(new.iter().map(|entry| OutboxEntry::from_new(entry, now)));
        Ok(())
    }

    fn insert_now(&self, entries: &[NewOutboxEntry]) -> OutboxResult<()> {
        let _commits = lock_commits();
        Self::append(&self.entries, entries)
    }

    fn update_pending<F>(&self, event_id: Uuid, apply: F) -> Option<i32>
    where
        F: FnOnce(&mut OutboxEntry),
    {
        let mut rows = self.lock();
        let row = rows
            .iter_mut()
            .find(|row| row.event_id == event_id && row.status == OutboxStatus::Pending)?;
        apply(row);
        Some(row.retry_count)
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    type Tx = MemoryTransaction;

    async fn insert_in_tx(&self, entries: &[NewOutboxEntry], tx: &mut MemoryTransaction) -> OutboxResult<()> {
        Self::check_unique(&self.entries, entries)?;

        let checked = self.entries.clone();
        let ids = entries.to_vec();
        let target = self.entries.clone();
        let staged = entries.to_vec();
        tx.stage_checked(
            move || Self::check_unique(&checked, &ids).map_err(|e| e.to_string()),
            move || {
                if let Err(e) = Self::append(&target, &staged) {
                    tracing::error!(error = %e, "Staged outbox insert rejected at commit");
                }
            },
        );
        Ok(())
    }

    async fn insert(&self, entries: &[NewOutboxEntry]) -> OutboxResult<()> {
        self.insert_now(entries)
    }

    async fn find(&self, event_id: Uuid) -> OutboxResult<Option<OutboxEntry>> {
        Ok(self.lock().iter().find(|row| row.event_id == event_id).cloned())
    }

    async fn mark_published(&self, event_id: Uuid) -> OutboxResult<bool> {
        let updated = self.update_pending(event_id, |row| {
            row.status = OutboxStatus::Published;
            row.published_at = Some(Utc::now());
        });
        Ok(updated.is_some())
    }

    async fn record_retry(&self, event_id: Uuid) -> OutboxResult<Option<i32>> {
        Ok(self.update_pending(event_id, |row| row.retry_count += 1))
    }

    async fn mark_failed(&self, event_id: Uuid) -> OutboxResult<Option<i32>> {
        Ok(self.update_pending(event_id, |row| {
            row.status = OutboxStatus::Failed;
            row.retry_count += 1;
        }))
    }

    async fn has_older_pending(&self, event_id: Uuid) -> OutboxResult<bool> {
        let rows = self.lock();
        let Some(position) = rows.iter().position(|row| row.event_id == event_id) else {
            return Ok(false);
        };
        let aggregate_id = &rows[position].aggregate_id;
        Ok(rows[..position]
            .iter()
            .any(|row| row.status == OutboxStatus::Pending && &row.aggregate_id == aggregate_id))
    }

    async fn find_stale_pending(&self, cutoff: DateTime<Utc>, limit: i64) -> OutboxResult<Vec<Uuid>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        let rows = self.lock();
        let mut stale: Vec<&OutboxEntry> = rows
            .iter()
            .filter(|row| row.status == OutboxStatus::Pending && row.created_at <= cutoff)
            .collect();
        stale.sort_by_key(|row| row.created_at);
        Ok(stale.into_iter().take(limit).map(|row| row.event_id).collect())
    }
}
