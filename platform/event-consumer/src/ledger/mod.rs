//! Idempotent Consumer Ledger
//!
//! Records which events each consuming service has already handled. The
//! `(event_id, service_name)` uniqueness constraint is the one guard against
//! running a side effect twice; `has_processed` is only a shortcut.

mod memory;
mod postgres;

pub use memory::InMemoryLedger;
pub use postgres::PgProcessedEventLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::LedgerResult;

/// Result of recording an event as processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// This call wrote the ledger row
    Recorded,
    /// A row already existed; another delivery got there first
    AlreadyProcessed,
}

#[async_trait]
pub trait ProcessedEventLedger: Send + Sync {
    async fn has_processed(&self, event_id: Uuid, service_name: &str) -> LedgerResult<bool>;

    /// Record the event for this service
    ///
    /// A concurrent duplicate is reported as [`MarkOutcome::AlreadyProcessed`],
    /// never as an error.
    async fn mark_processed(&self, event_id: Uuid, service_name: &str) -> LedgerResult<MarkOutcome>;

    /// Delete rows processed before `cutoff`; returns how many went
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> LedgerResult<u64>;
}
