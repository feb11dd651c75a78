use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use super::{JobQueue, JobState, PublishJob, ReservedJob};
use crate::error::{QueueError, QueueResult};

struct JobRecord {
    job: PublishJob,
    state: JobState,
    attempts_made: u32,
    run_at: Instant,
    seq: u64,
    last_error: Option<String>,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, JobRecord>,
    next_seq: u64,
}

/// Point-in-time view of a job, for assertions and diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSnapshot {
    pub job_id: String,
    pub state: JobState,
    pub attempts_made: u32,
    pub last_error: Option<String>,
}

/// In-memory job queue for tests and local development
///
/// Delays run on the Tokio clock, so paused-time tests advance through
/// backoff without sleeping. Ready jobs are handed out earliest `run_at`
/// first, ties broken by enqueue order.
#[derive(Clone, Default)]
pub struct InMemoryJobQueue {
    state: Arc<Mutex<QueueState>>,
    submissions: Arc<AtomicU64>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `enqueue`/`enqueue_bulk` calls received
    pub fn submission_count(&self) -> u64 {
        self.submissions.load(Ordering::SeqCst)
    }

    /// All jobs, in enqueue order
    pub fn jobs(&self) -> Vec<JobSnapshot> {
        let state = self.lock();
        let mut records: Vec<&JobRecord> = state.jobs.values().collect();
        records.sort_by_key(|record| record.seq);
        records
            .into_iter()
            .map(|record| JobSnapshot {
                job_id: record.job.job_id.clone(),
                state: record.state,
                attempts_made: record.attempts_made,
                last_error: record.last_error.clone(),
            })
            .collect()
    }

    pub fn job(&self, job_id: &str) -> Option<JobSnapshot> {
        self.jobs().into_iter().find(|job| job.job_id == job_id)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(state: &mut QueueState, job: PublishJob) -> bool {
        if state.jobs.contains_key(&job.job_id) {
            tracing::debug!(job_id = %job.job_id, "Job already enqueued, skipping duplicate");
            return false;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.insert(
            job.job_id.clone(),
            JobRecord {
                job,
                state: JobState::Waiting,
                attempts_made: 0,
                run_at: Instant::now(),
                seq,
                last_error: None,
            },
        );
        true
    }

    fn transition<F>(&self, job_id: &str, apply: F) -> QueueResult<()>
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut state = self.lock();
        let record = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::UnknownJob(job_id.to_string()))?;
        apply(record);
        Ok(())
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: PublishJob) -> QueueResult<bool> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        Ok(Self::insert(&mut self.lock(), job))
    }

    async fn enqueue_bulk(&self, jobs: Vec<PublishJob>) -> QueueResult<usize> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        let mut state = self.lock();
        Ok(jobs
            .into_iter()
            .map(|job| Self::insert(&mut state, job))
            .filter(|added| *added)
            .count())
    }

    async fn reserve(&self) -> QueueResult<Option<ReservedJob>> {
        let now = Instant::now();
        let mut state = self.lock();
        let next = state
            .jobs
            .values_mut()
            .filter(|record| record.state == JobState::Waiting && record.run_at <= now)
            .min_by_key(|record| (record.run_at, record.seq));

        Ok(next.map(|record| {
            record.state = JobState::Active;
            record.attempts_made += 1;
            ReservedJob {
                job: record.job.clone(),
                attempt: record.attempts_made,
            }
        }))
    }

    async fn complete(&self, job_id: &str) -> QueueResult<()> {
        self.transition(job_id, |record| record.state = JobState::Completed)
    }

    async fn retry(&self, job_id: &str, delay: Duration, error: &str) -> QueueResult<()> {
        let run_at = Instant::now() + delay;
        self.transition(job_id, |record| {
            record.state = JobState::Waiting;
            record.run_at = run_at;
            record.last_error = Some(error.to_string());
        })
    }

    async fn defer(&self, job_id: &str, delay: Duration) -> QueueResult<()> {
        let run_at = Instant::now() + delay;
        self.transition(job_id, |record| {
            record.state = JobState::Waiting;
            record.run_at = run_at;
            record.attempts_made = record.attempts_made.saturating_sub(1);
        })
    }

    async fn fail(&self, job_id: &str, error: &str) -> QueueResult<()> {
        self.transition(job_id, |record| {
            record.state = JobState::Failed;
            record.last_error = Some(error.to_string());
        })
    }
}
