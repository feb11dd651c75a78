//! Idempotent message handling
//!
//! Delivery is at-least-once, so the same envelope can arrive more than
//! once. [`IdempotentConsumer::handle`] checks the ledger before running the
//! handler and records the event after it succeeds.

use event_bus::consumer_retry::{retry_with_backoff_if, RetryConfig};
use event_bus::{validate_envelope_fields, BusMessage, EventBus, EventEnvelope};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::ConsumeError;
use crate::ledger::{MarkOutcome, ProcessedEventLedger};

/// What happened to one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// The handler ran and the event is now in the ledger
    Processed,
    /// The event was already handled by this service; nothing ran
    Duplicate,
}

/// Runs handlers at most once per `(event_id, service_name)`
pub struct IdempotentConsumer<L: ?Sized> {
    ledger: Arc<L>,
    service_name: String,
}

impl<L: ProcessedEventLedger + ?Sized> IdempotentConsumer<L> {
    pub fn new(ledger: Arc<L>, service_name: impl Into<String>) -> Self {
        Self {
            ledger,
            service_name: service_name.into(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn ledger(&self) -> &Arc<L> {
        &self.ledger
    }

    /// Handle one broker message
    ///
    /// The envelope is validated and its `eventId` looked up in the ledger.
    /// Duplicates return [`ConsumeOutcome::Duplicate`] without calling
    /// `handler`. Otherwise the handler runs and, on success, the event is
    /// recorded. A failed handler leaves the ledger untouched so a
    /// redelivery can try again.
    ///
    /// If two deliveries race past the check, both handlers run and the
    /// one that loses the ledger insert reports `Duplicate`. Handlers that
    /// cannot tolerate that should record the event in the same transaction
    /// as their side effect, see
    /// [`PgProcessedEventLedger::mark_processed_in`](crate::PgProcessedEventLedger::mark_processed_in).
    pub async fn handle<T, F, Fut, E>(
        &self,
        msg: &BusMessage,
        handler: F,
    ) -> Result<ConsumeOutcome, ConsumeError>
    where
        T: DeserializeOwned,
        F: FnOnce(EventEnvelope<T>) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let raw: serde_json::Value = serde_json::from_slice(&msg.payload)?;
        validate_envelope_fields(&raw).map_err(ConsumeError::InvalidEnvelope)?;
        let envelope: EventEnvelope<T> = serde_json::from_value(raw)?;
        let event_id: Uuid = envelope.event_id;

        if self
            .ledger
            .has_processed(event_id, &self.service_name)
            .await?
        {
            tracing::debug!(
                event_id = %event_id,
                subject = %msg.subject,
                service_name = %self.service_name,
                "Event already processed, skipping"
            );
            return Ok(ConsumeOutcome::Duplicate);
        }

        let event_type = envelope.event_type.clone();
        handler(envelope)
            .await
            .map_err(|e| ConsumeError::Handler(e.to_string()))?;

        match self
            .ledger
            .mark_processed(event_id, &self.service_name)
            .await?
        {
            MarkOutcome::Recorded => {
                tracing::info!(
                    event_id = %event_id,
                    event_type = %event_type,
                    service_name = %self.service_name,
                    "Event processed successfully"
                );
                Ok(ConsumeOutcome::Processed)
            }
            MarkOutcome::AlreadyProcessed => {
                tracing::warn!(
                    event_id = %event_id,
                    event_type = %event_type,
                    service_name = %self.service_name,
                    "Event processed concurrently by another delivery"
                );
                Ok(ConsumeOutcome::Duplicate)
            }
        }
    }
}

/// Subscribe to `subject` and feed every message through `consumer`
///
/// Handler failures are retried in-process per `retry`. A message that still
/// fails is logged and left out of the ledger, so the broker may redeliver
/// it. Malformed envelopes are logged and dropped without retry.
pub fn start_consumer<L, T, H, Fut, E>(
    bus: Arc<dyn EventBus>,
    subject: impl Into<String>,
    consumer: Arc<IdempotentConsumer<L>>,
    handler: H,
    retry: RetryConfig,
) -> JoinHandle<()>
where
    L: ProcessedEventLedger + ?Sized + 'static,
    T: DeserializeOwned + Send + 'static,
    H: Fn(EventEnvelope<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send,
    E: Display + Send,
{
    let subject = subject.into();

    tokio::spawn(async move {
        tracing::info!(
            subject = %subject,
            service_name = %consumer.service_name(),
            "Starting idempotent consumer"
        );

        let mut stream = match bus.subscribe(&subject).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(subject = %subject, error = %e, "Failed to subscribe");
                return;
            }
        };

        tracing::info!(subject = %subject, "Subscribed");

        while let Some(msg) = stream.next().await {
            let span = tracing::info_span!(
                "consume_event",
                subject = %msg.subject,
                message_id = msg.message_id.as_deref().unwrap_or(""),
                service_name = %consumer.service_name(),
            );

            async {
                let context = format!("{}:{}", consumer.service_name(), msg.subject);
                let result = retry_with_backoff_if(
                    || consumer.handle(&msg, &handler),
                    &retry,
                    &context,
                    ConsumeError::is_retriable,
                )
                .await;

                match result {
                    Ok(outcome) => {
                        tracing::debug!(outcome = ?outcome, "Message consumed");
                    }
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            "Failed to process event; left unmarked for redelivery"
                        );
                    }
                }
            }
            .instrument(span)
            .await;
        }

        tracing::warn!(subject = %subject, "Consumer stream ended");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct UserCreated {
        user_id: String,
    }

    fn message(event_id: Uuid) -> BusMessage {
        let envelope = EventEnvelope::with_event_id(
            event_id,
            "user.created".to_string(),
            "1.0".to_string(),
            "accounts".to_string(),
            json!({"userId": "u-1"}),
        );
        BusMessage::new(
            "events.user.created".to_string(),
            serde_json::to_vec(&envelope).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_handler_receives_typed_envelope() {
        let consumer = IdempotentConsumer::new(Arc::new(InMemoryLedger::new()), "billing");
        let event_id = Uuid::new_v4();

        let outcome = consumer
            .handle(&message(event_id), |envelope: EventEnvelope<UserCreated>| async move {
                assert_eq!(envelope.event_id, event_id);
                assert_eq!(envelope.payload.user_id, "u-1");
                Ok::<_, String>(())
            })
            .await
            .unwrap();

        assert_eq!(outcome, ConsumeOutcome::Processed);
    }

    #[tokio::test]
    async fn test_failed_handler_leaves_ledger_untouched() {
        let ledger = Arc::new(InMemoryLedger::new());
        let consumer = IdempotentConsumer::new(ledger.clone(), "billing");

        let err = consumer
            .handle(&message(Uuid::new_v4()), |_: EventEnvelope<UserCreated>| async {
                Err::<(), _>("downstream unavailable")
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ConsumeError::Handler(_)));
        assert!(err.is_retriable());
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_envelope_is_not_retriable() {
        let consumer = IdempotentConsumer::new(Arc::new(InMemoryLedger::new()), "billing");
        let calls = AtomicU32::new(0);

        let bad = BusMessage::new(
            "events.user.created".to_string(),
            serde_json::to_vec(&json!({"eventId": "not-a-uuid"})).unwrap(),
        );
        let err = consumer
            .handle(&bad, |_: EventEnvelope<serde_json::Value>| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(()) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ConsumeError::InvalidEnvelope(_)));
        assert!(!err.is_retriable());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_lost_insert_race_reports_duplicate() {
        let ledger = Arc::new(InMemoryLedger::new());
        let consumer = IdempotentConsumer::new(ledger.clone(), "billing");
        let event_id = Uuid::new_v4();

        let outcome = consumer
            .handle(&message(event_id), |_: EventEnvelope<UserCreated>| {
                let racing = ledger.clone();
                async move {
                    // Another delivery records the event while this handler runs
                    racing.mark_processed(event_id, "billing").await.unwrap();
                    Ok::<_, String>(())
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome, ConsumeOutcome::Duplicate);
        assert_eq!(ledger.len(), 1);
    }
}
