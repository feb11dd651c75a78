//! Outbox entries and the store that persists them
//!
//! The store is the single source of truth for "what must still be
//! delivered". Writers append inside the caller's transaction; the publisher
//! worker is the only component that moves an entry out of `pending`.

mod memory;
mod postgres;

pub use memory::InMemoryOutboxStore;
pub use postgres::PgOutboxStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::OutboxResult;

/// Delivery status of an outbox entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Published => "published",
            OutboxStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "published" => Ok(OutboxStatus::Published),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(format!("unknown outbox status: {other}")),
        }
    }
}

/// A row about to be appended to the outbox
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEntry {
    pub event_id: Uuid,
    pub aggregate_id: String,
    pub event_type: String,
    /// Complete wire envelope, published verbatim
    pub payload: serde_json::Value,
}

/// A stored outbox entry
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub event_id: Uuid,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    fn from_new(entry: &NewOutboxEntry, created_at: DateTime<Utc>) -> Self {
        Self {
            event_id: entry.event_id,
            aggregate_id: entry.aggregate_id.clone(),
            event_type: entry.event_type.clone(),
            payload: entry.payload.clone(),
            status: OutboxStatus::Pending,
            retry_count: 0,
            created_at,
            published_at: None,
        }
    }
}

/// Durable storage for outbox entries
///
/// Status transitions only apply to entries that are still `pending`; the
/// `Option`/`bool` results report whether the row was actually moved.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Transaction context accepted by [`OutboxStore::insert_in_tx`]
    type Tx: Send + 'static;

    /// Insert entries through the caller's transaction, in order
    async fn insert_in_tx(&self, entries: &[NewOutboxEntry], tx: &mut Self::Tx) -> OutboxResult<()>;

    /// Insert entries in the store's own implicit transaction, in order
    async fn insert(&self, entries: &[NewOutboxEntry]) -> OutboxResult<()>;

    async fn find(&self, event_id: Uuid) -> OutboxResult<Option<OutboxEntry>>;

    /// `pending` → `published`, stamping `published_at`
    async fn mark_published(&self, event_id: Uuid) -> OutboxResult<bool>;

    /// Count a failed attempt on a `pending` entry; returns the new retry count
    async fn record_retry(&self, event_id: Uuid) -> OutboxResult<Option<i32>>;

    /// `pending` → `failed`, counting the final attempt; returns the new retry count
    async fn mark_failed(&self, event_id: Uuid) -> OutboxResult<Option<i32>>;

    /// Whether an entry of the same aggregate, inserted before `event_id`,
    /// is still `pending`
    async fn has_older_pending(&self, event_id: Uuid) -> OutboxResult<bool>;

    /// Ids of `pending` entries created at or before `cutoff`, oldest first
    async fn find_stale_pending(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> OutboxResult<Vec<Uuid>>;
}
