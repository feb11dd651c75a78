//! Background tasks of the relay service
//!
//! - publisher pool: delivers queued outbox events to the bus
//! - reconciler: re-schedules entries that never got a delivery job
//! - ledger retention sweeper
//! - optional loopback consumer that records the relay's own events in the
//!   ledger under `LEDGER_SERVICE_NAME`

use event_bus::consumer_retry::RetryConfig;
use event_bus::{EventBus, EventEnvelope};
use event_consumer::{start_consumer, start_retention_sweeper, IdempotentConsumer, ProcessedEventLedger};
use outbox::{start_publisher, start_reconciler, JobQueue, OutboxPublisher, OutboxStore, PublishScheduler};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;

/// Handles to the running relay tasks
pub struct Relay {
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    consumers: Vec<JoinHandle<()>>,
}

impl Relay {
    /// Start every relay task
    pub fn start<S, Q>(
        store: Arc<S>,
        queue: Arc<Q>,
        bus: Arc<dyn EventBus>,
        ledger: Arc<dyn ProcessedEventLedger>,
        config: &Config,
    ) -> Self
    where
        S: OutboxStore + 'static,
        Q: JobQueue + 'static,
    {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        let mut consumers = Vec::new();

        let publisher = Arc::new(OutboxPublisher::new(
            store.clone(),
            queue.clone(),
            bus.clone(),
            &config.outbox,
        ));
        tasks.push(("publisher", start_publisher(publisher, shutdown_rx.clone())));

        let scheduler = PublishScheduler::from_config(queue, &config.outbox);
        tasks.push((
            "reconciler",
            start_reconciler(
                store,
                scheduler,
                config.outbox.reconcile_after,
                config.outbox.reconcile_interval,
                shutdown_rx.clone(),
            ),
        ));

        if config.ledger_retention.is_zero() {
            tracing::info!("Ledger retention disabled");
        } else {
            tasks.push((
                "retention",
                start_retention_sweeper(
                    ledger.clone(),
                    config.ledger_retention,
                    config.ledger_sweep_interval,
                    shutdown_rx,
                ),
            ));
        }

        if let Some(service_name) = &config.ledger_service_name {
            let subject = loopback_subject(&config.outbox.topic_prefix);
            let consumer = Arc::new(IdempotentConsumer::new(ledger, service_name.clone()));
            consumers.push(start_consumer(
                bus,
                subject,
                consumer,
                |envelope: EventEnvelope<serde_json::Value>| async move {
                    tracing::info!(
                        event_id = %envelope.event_id,
                        event_type = %envelope.event_type,
                        source = %envelope.source,
                        "Relayed event observed"
                    );
                    Ok::<_, String>(())
                },
                RetryConfig::default(),
            ));
        }

        tracing::info!(tasks = tasks.len(), consumers = consumers.len(), "Relay started");

        Self {
            shutdown,
            tasks,
            consumers,
        }
    }

    /// Signal shutdown and wait for in-flight work to finish
    pub async fn shutdown(self) {
        tracing::info!("Relay shutting down");
        let _ = self.shutdown.send(true);

        for consumer in &self.consumers {
            consumer.abort();
        }

        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(task = name, error = %e, "Relay task ended abnormally");
            }
        }

        tracing::info!("Relay stopped");
    }
}

/// Wildcard subject covering every relayed event
fn loopback_subject(topic_prefix: &str) -> String {
    if topic_prefix.is_empty() {
        ">".to_string()
    } else {
        format!("{topic_prefix}.>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_subject() {
        assert_eq!(loopback_subject("events"), "events.>");
        assert_eq!(loopback_subject(""), ">");
    }
}
