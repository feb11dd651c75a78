//! Outbox publisher worker
//!
//! Takes delivery jobs off the queue, publishes the stored envelope to the
//! event bus and records the result on the outbox entry:
//!
//! - broker ack: `pending` → `published`, job completed
//! - failure with attempts left: `retry_count += 1`, job retried after
//!   `base * 2^(attempt-1)`
//! - failure on the last attempt: `pending` → `failed`, job failed
//!
//! Jobs run concurrently, so entries of different aggregates may go out in
//! any order. An entry is only published once every older entry of its
//! aggregate has left `pending`; until then its job is deferred by one poll
//! interval without spending an attempt. The aggregate id also goes out as
//! the message's partition key.

use event_bus::{BusMessage, EventBus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::Instrument;

use crate::config::OutboxConfig;
use crate::error::{OutboxError, OutboxResult};
use crate::queue::{JobQueue, ReservedJob};
use crate::store::{OutboxEntry, OutboxStatus, OutboxStore};

/// Maps an event type to the broker subject it is published on
pub trait TopicResolver: Send + Sync {
    fn resolve(&self, event_type: &str) -> String;
}

/// `"{prefix}.{event_type}"`, or the bare event type when the prefix is empty
#[derive(Debug, Clone)]
pub struct PrefixTopicResolver {
    prefix: String,
}

impl PrefixTopicResolver {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl TopicResolver for PrefixTopicResolver {
    fn resolve(&self, event_type: &str) -> String {
        if self.prefix.is_empty() {
            event_type.to_string()
        } else {
            format!("{}.{}", self.prefix, event_type)
        }
    }
}

/// What happened to one delivery job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Broker acknowledged the event
    Published,
    /// Attempt failed; the job runs again after `delay`
    Retrying { attempt: u32, delay: Duration },
    /// Last attempt failed; the entry is now `failed`
    Failed { attempts: u32 },
    /// An older entry of the same aggregate is still pending; the job runs
    /// again after `delay` with the same attempt number
    Deferred { delay: Duration },
    /// Entry had already left `pending`; nothing was published
    Skipped,
    /// No outbox entry for the job
    Discarded,
}

pub struct OutboxPublisher<S, Q> {
    store: Arc<S>,
    queue: Arc<Q>,
    bus: Arc<dyn EventBus>,
    topics: Arc<dyn TopicResolver>,
    publish_timeout: Duration,
    concurrency: usize,
    poll_interval: Duration,
}

impl<S, Q> OutboxPublisher<S, Q>
where
    S: OutboxStore + 'static,
    Q: JobQueue + 'static,
{
    pub fn new(store: Arc<S>, queue: Arc<Q>, bus: Arc<dyn EventBus>, config: &OutboxConfig) -> Self {
        Self {
            store,
            queue,
            bus,
            topics: Arc::new(PrefixTopicResolver::new(config.topic_prefix.clone())),
            publish_timeout: config.publish_timeout,
            concurrency: config.worker_concurrency.max(1),
            poll_interval: config.poll_interval,
        }
    }

    pub fn with_topic_resolver(mut self, topics: Arc<dyn TopicResolver>) -> Self {
        self.topics = topics;
        self
    }

    /// Deliver one reserved job and settle it on the queue
    ///
    /// An `Err` means the store or queue could not be updated; the broker
    /// outcome of this attempt is unknown to the caller.
    pub async fn process_job(&self, reserved: ReservedJob) -> OutboxResult<DeliveryOutcome> {
        let event_id = reserved.job.payload.event_id;
        let job_id = reserved.job.job_id.as_str();

        let Some(entry) = self.store.find(event_id).await? else {
            tracing::warn!(event_id = %event_id, "Outbox entry not found, discarding job");
            self.queue.fail(job_id, "outbox entry not found").await?;
            return Ok(DeliveryOutcome::Discarded);
        };

        if entry.status != OutboxStatus::Pending {
            tracing::debug!(
                event_id = %event_id,
                status = %entry.status,
                "Outbox entry already settled, skipping"
            );
            self.queue.complete(job_id).await?;
            return Ok(DeliveryOutcome::Skipped);
        }

        if self.store.has_older_pending(event_id).await? {
            let delay = self.poll_interval;
            self.queue.defer(job_id, delay).await?;
            tracing::debug!(
                event_id = %event_id,
                aggregate_id = %entry.aggregate_id,
                "Older event of the aggregate still pending, deferring"
            );
            return Ok(DeliveryOutcome::Deferred { delay });
        }

        let attempt = reserved.attempt;
        match self.publish(&entry).await {
            Ok(()) => {
                if !self.store.mark_published(event_id).await? {
                    tracing::debug!(event_id = %event_id, "Outbox entry settled concurrently");
                }
                self.queue.complete(job_id).await?;

                tracing::info!(
                    event_id = %event_id,
                    event_type = %entry.event_type,
                    attempt,
                    "Outbox event published"
                );
                Ok(DeliveryOutcome::Published)
            }
            Err(e) if attempt >= reserved.job.options.attempts => {
                let retry_count = self.store.mark_failed(event_id).await?;
                self.queue.fail(job_id, &e.to_string()).await?;

                tracing::error!(
                    event_id = %event_id,
                    event_type = %entry.event_type,
                    attempts = attempt,
                    retry_count = ?retry_count,
                    error = %e,
                    "Outbox event delivery failed permanently"
                );
                Ok(DeliveryOutcome::Failed { attempts: attempt })
            }
            Err(e) => {
                let delay = reserved.job.options.backoff.delay_for(attempt);
                self.store.record_retry(event_id).await?;
                self.queue.retry(job_id, delay, &e.to_string()).await?;

                tracing::warn!(
                    event_id = %event_id,
                    event_type = %entry.event_type,
                    attempt,
                    max_attempts = reserved.job.options.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Outbox event delivery failed, will retry"
                );
                Ok(DeliveryOutcome::Retrying { attempt, delay })
            }
        }
    }

    async fn publish(&self, entry: &OutboxEntry) -> OutboxResult<()> {
        let payload = serde_json::to_vec(&entry.payload)?;
        let message = BusMessage::new(self.topics.resolve(&entry.event_type), payload)
            .with_key(entry.aggregate_id.clone())
            .with_message_id(entry.event_id.to_string());

        match tokio::time::timeout(self.publish_timeout, self.bus.publish(message)).await {
            Ok(result) => result.map_err(OutboxError::from),
            Err(_) => Err(OutboxError::PublishTimeout(entry.event_id)),
        }
    }

    async fn deliver(&self, reserved: ReservedJob) {
        let job_id = reserved.job.job_id.clone();
        let attempt = reserved.attempt;
        let backoff = reserved.job.options.backoff;

        if let Err(e) = self.process_job(reserved).await {
            tracing::error!(job_id = %job_id, error = %e, "Failed to settle publish job");
            if let Err(e) = self
                .queue
                .retry(&job_id, backoff.delay_for(attempt), &e.to_string())
                .await
            {
                tracing::error!(job_id = %job_id, error = %e, "Failed to requeue publish job");
            }
        }
    }

    /// Run the worker pool until `shutdown` flips to `true`
    ///
    /// At most `worker_concurrency` deliveries are in flight at once. The
    /// queue is polled every `poll_interval` while idle. Deliveries already
    /// in flight finish before this returns.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight = JoinSet::new();

        tracing::info!(
            concurrency = self.concurrency,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Outbox publisher started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Outbox delivery task panicked");
                }
            }

            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            match self.queue.reserve().await {
                Ok(Some(reserved)) => {
                    let span = tracing::info_span!(
                        "outbox_delivery",
                        event_id = %reserved.job.payload.event_id,
                        attempt = reserved.attempt,
                    );
                    let worker = self.clone();
                    in_flight.spawn(
                        async move {
                            worker.deliver(reserved).await;
                            drop(permit);
                        }
                        .instrument(span),
                    );
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => break,
                    }
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!(error = %e, "Failed to reserve publish job");
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }

        tracing::info!(in_flight = in_flight.len(), "Outbox publisher draining");
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Outbox delivery task panicked");
            }
        }
        tracing::info!("Outbox publisher stopped");
    }
}

/// Spawn the publisher pool as a background task
pub fn start_publisher<S, Q>(
    publisher: Arc<OutboxPublisher<S, Q>>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    S: OutboxStore + 'static,
    Q: JobQueue + 'static,
{
    tokio::spawn(publisher.run(shutdown))
}
