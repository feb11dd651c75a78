//! Retryable work queue for outbox delivery jobs
//!
//! One job per outbox entry. The job id is the event id, so enqueueing an id
//! the queue already knows is a no-op.

mod memory;
mod postgres;

pub use memory::{InMemoryJobQueue, JobSnapshot};
pub use postgres::PgJobQueue;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::QueueResult;

/// Name of the "publish one outbox event" job
pub const PUBLISH_JOB_NAME: &str = "publish-outbox-event";

/// Exponential backoff seeded from a fixed base delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
}

impl BackoffPolicy {
    pub fn exponential(base_delay: Duration) -> Self {
        Self { base_delay }
    }

    /// Delay after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`
    ///
    /// Strictly increasing in `attempt` until it saturates at `Duration::MAX`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// Per-job delivery options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    /// Attempt ceiling, including the first attempt
    pub attempts: u32,
    pub backoff: BackoffPolicy,
}

/// Job payload: which outbox entry to publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishJobPayload {
    pub event_id: Uuid,
}

/// A delivery job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishJob {
    /// Deduplication key, always the event id
    pub job_id: String,
    pub name: String,
    pub payload: PublishJobPayload,
    pub options: JobOptions,
}

impl PublishJob {
    pub fn for_event(event_id: Uuid, options: JobOptions) -> Self {
        Self {
            job_id: event_id.to_string(),
            name: PUBLISH_JOB_NAME.to_string(),
            payload: PublishJobPayload { event_id },
            options,
        }
    }
}

/// A job handed to a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedJob {
    pub job: PublishJob,
    /// Attempt being made now, 1-based
    pub attempt: u32,
}

/// Queue-side job lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Ready or scheduled for a later run
    Waiting,
    /// Reserved by a worker
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimal retryable, delayed work queue
///
/// Jobs are never removed; a completed or failed job keeps its id reserved
/// so a late duplicate enqueue stays a no-op.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job unless its id is already known; returns whether it was added
    async fn enqueue(&self, job: PublishJob) -> QueueResult<bool>;

    /// Add several jobs in one submission; returns how many were new
    async fn enqueue_bulk(&self, jobs: Vec<PublishJob>) -> QueueResult<usize>;

    /// Claim the next job whose run time has come, if any
    async fn reserve(&self) -> QueueResult<Option<ReservedJob>>;

    async fn complete(&self, job_id: &str) -> QueueResult<()>;

    /// Put a reserved job back to run again after `delay`
    async fn retry(&self, job_id: &str, delay: Duration, error: &str) -> QueueResult<()>;

    /// Put a reserved job back to run after `delay` without counting the
    /// attempt it was reserved for
    async fn defer(&self, job_id: &str, delay: Duration) -> QueueResult<()>;

    /// Give up on a job for good
    async fn fail(&self, job_id: &str, error: &str) -> QueueResult<()>;
}
