use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use super::{MarkOutcome, ProcessedEventLedger};
use crate::error::LedgerResult;

/// In-memory ledger for tests and local development
#[derive(Clone, Default)]
pub struct InMemoryLedger {
    rows: Arc<Mutex<HashMap<(Uuid, String), DateTime<Utc>>>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ledger rows
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Insert a row with an explicit timestamp
    pub fn record_at(&self, event_id: Uuid, service_name: &str, processed_at: DateTime<Utc>) {
        self.lock()
            .insert((event_id, service_name.to_string()), processed_at);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(Uuid, String), DateTime<Utc>>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ProcessedEventLedger for InMemoryLedger {
    async fn has_processed(&self, event_id: Uuid, service_name: &str) -> LedgerResult<bool> {
        Ok(self
            .lock()
            .contains_key(&(event_id, service_name.to_string())))
    }

    async fn mark_processed(&self, event_id: Uuid, service_name: &str) -> LedgerResult<MarkOutcome> {
        let mut rows = self.lock();
        let key = (event_id, service_name.to_string());
        if rows.contains_key(&key) {
            return Ok(MarkOutcome::AlreadyProcessed);
        }
        rows.insert(key, Utc::now());
        Ok(MarkOutcome::Recorded)
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> LedgerResult<u64> {
        let mut rows = self.lock();
        let before = rows.len();
        rows.retain(|_, processed_at| *processed_at >= cutoff);
        Ok((before - rows.len()) as u64)
    }
}
