//! Outbox append path
//!
//! Business code records integration events next to its own writes:
//!
//! ```rust,no_run
//! use outbox::{Outbox, OutboxError, PgJobQueue, PgOutboxStore, PgUnitOfWork, UnitOfWork};
//! use serde_json::json;
//!
//! # async fn example(
//! #     uow: PgUnitOfWork,
//! #     outbox: Outbox<PgOutboxStore, PgJobQueue>,
//! # ) -> Result<(), OutboxError> {
//! let writer = outbox.clone();
//! let event_id = uow
//!     .execute(move |tx| {
//!         Box::pin(async move {
//!             sqlx::query("INSERT INTO users (id, email) VALUES ($1, $2)")
//!                 .bind("u-1")
//!                 .bind("ada@example.com")
//!                 .execute(tx.connection())
//!                 .await?;
//!             writer
//!                 .save_event("user.created", &json!({"userId": "u-1"}), "u-1", tx)
//!                 .await
//!         })
//!     })
//!     .await?;
//!
//! // Only after commit
//! outbox.scheduler().schedule_publishing(&[event_id]).await?;
//! # Ok(())
//! # }
//! ```

use event_bus::EventEnvelope;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::OutboxConfig;
use crate::error::{OutboxError, OutboxResult};
use crate::queue::JobQueue;
use crate::scheduler::PublishScheduler;
use crate::store::{NewOutboxEntry, OutboxStore};

/// One event of a batch append
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
    pub aggregate_id: String,
}

impl OutboxEvent {
    pub fn new<P: Serialize + ?Sized>(
        event_type: impl Into<String>,
        payload: &P,
        aggregate_id: impl Into<String>,
    ) -> OutboxResult<Self> {
        Ok(Self {
            event_type: event_type.into(),
            payload: serde_json::to_value(payload)?,
            aggregate_id: aggregate_id.into(),
        })
    }
}

/// Writes outbox entries and, on the non-transactional path, schedules them
pub struct Outbox<S, Q> {
    store: Arc<S>,
    scheduler: PublishScheduler<Q>,
    source: String,
    version: String,
}

impl<S, Q> Clone for Outbox<S, Q> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            scheduler: self.scheduler.clone(),
            source: self.source.clone(),
            version: self.version.clone(),
        }
    }
}

impl<S, Q> Outbox<S, Q>
where
    S: OutboxStore,
    Q: JobQueue,
{
    pub fn new(store: Arc<S>, scheduler: PublishScheduler<Q>, config: &OutboxConfig) -> Self {
        Self {
            store,
            scheduler,
            source: config.source_service.clone(),
            version: config.protocol_version.clone(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn scheduler(&self) -> &PublishScheduler<Q> {
        &self.scheduler
    }

    /// Append one event through the caller's transaction
    ///
    /// Returns the new event id. Nothing is scheduled; call
    /// [`PublishScheduler::schedule_publishing`] once the transaction has
    /// committed.
    pub async fn save_event<P: Serialize + ?Sized>(
        &self,
        event_type: &str,
        payload: &P,
        aggregate_id: &str,
        tx: &mut S::Tx,
    ) -> OutboxResult<Uuid> {
        let entry = self.build_entry(event_type, serde_json::to_value(payload)?, aggregate_id)?;
        let event_id = entry.event_id;

        self.store.insert_in_tx(std::slice::from_ref(&entry), tx).await?;

        tracing::debug!(event_id = %event_id, event_type = %event_type, "Outbox event staged");
        Ok(event_id)
    }

    /// Append one event on its own and schedule its delivery
    ///
    /// The event is durable once this returns. If scheduling fails the error
    /// is logged and the id is still returned; the reconciliation sweep picks
    /// the entry up later.
    pub async fn save_event_and_dispatch<P: Serialize + ?Sized>(
        &self,
        event_type: &str,
        payload: &P,
        aggregate_id: &str,
    ) -> OutboxResult<Uuid> {
        let entry = self.build_entry(event_type, serde_json::to_value(payload)?, aggregate_id)?;
        let event_id = entry.event_id;

        self.store.insert(std::slice::from_ref(&entry)).await?;
        self.dispatch(&[event_id]).await;

        Ok(event_id)
    }

    /// Append a batch through the caller's transaction, in input order
    ///
    /// An empty batch touches nothing and returns no ids.
    pub async fn save_events(
        &self,
        events: &[OutboxEvent],
        tx: &mut S::Tx,
    ) -> OutboxResult<Vec<Uuid>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let entries = self.build_entries(events)?;
        self.store.insert_in_tx(&entries, tx).await?;

        tracing::debug!(count = entries.len(), "Outbox events staged");
        Ok(entries.iter().map(|entry| entry.event_id).collect())
    }

    /// Append a batch on its own and schedule delivery for all of it
    pub async fn save_events_and_dispatch(&self, events: &[OutboxEvent]) -> OutboxResult<Vec<Uuid>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let entries = self.build_entries(events)?;
        self.store.insert(&entries).await?;

        let ids: Vec<Uuid> = entries.iter().map(|entry| entry.event_id).collect();
        self.dispatch(&ids).await;
        Ok(ids)
    }

    async fn dispatch(&self, event_ids: &[Uuid]) {
        if let Err(e) = self.scheduler.schedule_publishing(event_ids).await {
            tracing::error!(
                count = event_ids.len(),
                error = %e,
                "Failed to schedule outbox events; left pending for reconciliation"
            );
        }
    }

    fn build_entries(&self, events: &[OutboxEvent]) -> OutboxResult<Vec<NewOutboxEntry>> {
        events
            .iter()
            .map(|event| {
                self.build_entry(&event.event_type, event.payload.clone(), &event.aggregate_id)
            })
            .collect()
    }

    fn build_entry(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        aggregate_id: &str,
    ) -> OutboxResult<NewOutboxEntry> {
        validate_event_type(event_type)?;
        if aggregate_id.trim().is_empty() {
            return Err(OutboxError::InvalidEvent(
                "aggregate_id cannot be empty".to_string(),
            ));
        }

        let envelope = EventEnvelope::new(
            event_type.to_string(),
            self.version.clone(),
            self.source.clone(),
            payload,
        );

        Ok(NewOutboxEntry {
            event_id: envelope.event_id,
            aggregate_id: aggregate_id.to_string(),
            event_type: event_type.to_string(),
            payload: serde_json::to_value(&envelope)?,
        })
    }
}

/// Dotted lowercase name: one or more `[a-z0-9_-]+` segments joined by `.`
fn validate_event_type(event_type: &str) -> OutboxResult<()> {
    let valid_segment = |segment: &str| {
        !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
    };

    if event_type.split('.').all(valid_segment) {
        Ok(())
    } else {
        Err(OutboxError::InvalidEvent(format!(
            "event_type '{event_type}' must be dotted lowercase, e.g. 'user.created'"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryJobQueue;
    use crate::store::{InMemoryOutboxStore, OutboxStatus};
    use crate::unit_of_work::{MemoryUnitOfWork, UnitOfWork};
    use serde_json::json;

    fn outbox() -> (
        Outbox<InMemoryOutboxStore, InMemoryJobQueue>,
        InMemoryOutboxStore,
        Arc<InMemoryJobQueue>,
    ) {
        let store = InMemoryOutboxStore::new();
        let queue = Arc::new(InMemoryJobQueue::new());
        let config = OutboxConfig {
            source_service: "accounts".to_string(),
            ..OutboxConfig::default()
        };
        let scheduler = PublishScheduler::from_config(queue.clone(), &config);
        (
            Outbox::new(Arc::new(store.clone()), scheduler, &config),
            store,
            queue,
        )
    }

    #[test]
    fn test_event_type_validation() {
        for ok in ["user.created", "billing.invoice-paid", "gl.posting_v2.requested", "x"] {
            assert!(validate_event_type(ok).is_ok(), "{ok} should be accepted");
        }
        for bad in ["", "User.Created", "user..created", ".user", "user.", "user created"] {
            assert!(validate_event_type(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[tokio::test]
    async fn test_save_event_stores_full_envelope_without_dispatch() {
        let (outbox, store, queue) = outbox();
        let uow = MemoryUnitOfWork::new();

        let writer = outbox.clone();
        let event_id = uow
            .execute(move |tx| {
                Box::pin(async move {
                    writer
                        .save_event("user.created", &json!({"userId": "u-1"}), "u-1", tx)
                        .await
                })
            })
            .await
            .unwrap();

        let entry = store.find(event_id).await.unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Pending);
        assert_eq!(entry.aggregate_id, "u-1");
        assert_eq!(entry.payload["eventId"], json!(event_id));
        assert_eq!(entry.payload["eventType"], "user.created");
        assert_eq!(entry.payload["version"], "1.0");
        assert_eq!(entry.payload["source"], "accounts");
        assert_eq!(entry.payload["payload"], json!({"userId": "u-1"}));
        assert!(entry.payload["timestamp"].is_i64());

        assert!(queue.jobs().is_empty());
        assert_eq!(queue.submission_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_event_fails_before_any_write() {
        let (outbox, store, queue) = outbox();

        let err = outbox
            .save_event_and_dispatch("User Created", &json!({}), "u-1")
            .await
            .unwrap_err();
        assert!(matches!(err, OutboxError::InvalidEvent(_)));

        let err = outbox
            .save_event_and_dispatch("user.created", &json!({}), "  ")
            .await
            .unwrap_err();
        assert!(matches!(err, OutboxError::InvalidEvent(_)));

        assert!(store.entries().is_empty());
        assert_eq!(queue.submission_count(), 0);
    }

    #[tokio::test]
    async fn test_batch_ids_follow_input_order() {
        let (outbox, store, queue) = outbox();
        let events = vec![
            OutboxEvent::new("order.placed", &json!({"n": 1}), "o-1").unwrap(),
            OutboxEvent::new("order.placed", &json!({"n": 2}), "o-2").unwrap(),
            OutboxEvent::new("order.shipped", &json!({"n": 3}), "o-1").unwrap(),
        ];

        let ids = outbox.save_events_and_dispatch(&events).await.unwrap();

        let stored: Vec<Uuid> = store.entries().iter().map(|e| e.event_id).collect();
        assert_eq!(ids, stored);
        assert_eq!(store.entries()[2].payload["payload"], json!({"n": 3}));
        assert_eq!(queue.jobs().len(), 3);
        assert_eq!(queue.submission_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        let (outbox, store, queue) = outbox();
        let mut tx = MemoryUnitOfWork::new().begin().await.unwrap();

        assert!(outbox.save_events(&[], &mut tx).await.unwrap().is_empty());
        assert!(outbox.save_events_and_dispatch(&[]).await.unwrap().is_empty());

        assert_eq!(tx.staged_len(), 0);
        assert!(store.entries().is_empty());
        assert_eq!(queue.submission_count(), 0);
    }

    #[tokio::test]
    async fn test_every_event_gets_a_distinct_id() {
        let (outbox, _store, _queue) = outbox();

        let first = outbox
            .save_event_and_dispatch("user.created", &json!({}), "u-1")
            .await
            .unwrap();
        let second = outbox
            .save_event_and_dispatch("user.created", &json!({}), "u-1")
            .await
            .unwrap();

        assert_ne!(first, second);
    }
}
