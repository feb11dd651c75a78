//! Publish Scheduler
//!
//! Turns committed outbox entry ids into delivery jobs. Call it only after
//! the unit of work that wrote the entries has committed; a job cannot be
//! taken back by a later rollback.

use std::sync::Arc;
use uuid::Uuid;

use crate::config::OutboxConfig;
use crate::error::QueueResult;
use crate::queue::{BackoffPolicy, JobOptions, JobQueue, PublishJob};

pub struct PublishScheduler<Q> {
    queue: Arc<Q>,
    options: JobOptions,
}

impl<Q> Clone for PublishScheduler<Q> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            options: self.options,
        }
    }
}

impl<Q: JobQueue> PublishScheduler<Q> {
    pub fn new(queue: Arc<Q>, options: JobOptions) -> Self {
        Self { queue, options }
    }

    pub fn from_config(queue: Arc<Q>, config: &OutboxConfig) -> Self {
        Self::new(
            queue,
            JobOptions {
                attempts: config.max_attempts,
                backoff: BackoffPolicy::exponential(config.backoff_base),
            },
        )
    }

    pub fn options(&self) -> JobOptions {
        self.options
    }

    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    /// Enqueue one delivery job per event id
    ///
    /// An empty list touches nothing. One id is a single enqueue, several
    /// are one bulk submission. Ids the queue already holds are skipped.
    /// Returns the number of jobs actually added.
    pub async fn schedule_publishing(&self, event_ids: &[Uuid]) -> QueueResult<usize> {
        let added = match event_ids {
            [] => return Ok(0),
            [event_id] => {
                let job = PublishJob::for_event(*event_id, self.options);
                usize::from(self.queue.enqueue(job).await?)
            }
            many => {
                let jobs = many
                    .iter()
                    .map(|event_id| PublishJob::for_event(*event_id, self.options))
                    .collect();
                self.queue.enqueue_bulk(jobs).await?
            }
        };

        tracing::debug!(
            requested = event_ids.len(),
            added,
            "Outbox events scheduled for publishing"
        );

        Ok(added)
    }
}
