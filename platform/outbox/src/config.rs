use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Outbox configuration
///
/// Envelope constants, the delivery retry policy and worker pool sizing.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Service name stamped into every envelope's `source`
    pub source_service: String,
    /// Envelope protocol version
    pub protocol_version: String,
    /// Delivery attempts per entry before it is marked failed
    pub max_attempts: u32,
    /// Delay before the first retry; doubles for each later retry
    pub backoff_base: Duration,
    /// Bound on a single broker publish attempt
    pub publish_timeout: Duration,
    /// Jobs delivered concurrently by one worker pool
    pub worker_concurrency: usize,
    /// Idle wait between queue polls
    pub poll_interval: Duration,
    /// How long a reserved job stays invisible to other workers
    pub job_lease: Duration,
    /// Pending entries older than this are re-scheduled by the reconciler
    pub reconcile_after: Duration,
    /// Interval between reconciliation sweeps
    pub reconcile_interval: Duration,
    /// Prefix for broker subjects
    pub topic_prefix: String,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            source_service: "app".to_string(),
            protocol_version: "1.0".to_string(),
            max_attempts: 5,
            backoff_base: Duration::from_millis(1000),
            publish_timeout: Duration::from_millis(10_000),
            worker_concurrency: 4,
            poll_interval: Duration::from_millis(500),
            job_lease: Duration::from_millis(60_000),
            reconcile_after: Duration::from_secs(300),
            reconcile_interval: Duration::from_secs(60),
            topic_prefix: "events".to_string(),
        }
    }
}

impl OutboxConfig {
    /// Load configuration from `OUTBOX_*` environment variables
    ///
    /// Unset variables keep their defaults; malformed ones are an error.
    pub fn from_env() -> Result<Self, String> {
        let defaults = Self::default();

        let config = Self {
            source_service: env::var("OUTBOX_SOURCE_SERVICE").unwrap_or(defaults.source_service),
            protocol_version: env::var("OUTBOX_PROTOCOL_VERSION")
                .unwrap_or(defaults.protocol_version),
            max_attempts: parse_var("OUTBOX_MAX_ATTEMPTS")?.unwrap_or(defaults.max_attempts),
            backoff_base: parse_var("OUTBOX_BACKOFF_BASE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_base),
            publish_timeout: parse_var("OUTBOX_PUBLISH_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.publish_timeout),
            worker_concurrency: parse_var("OUTBOX_WORKER_CONCURRENCY")?
                .unwrap_or(defaults.worker_concurrency),
            poll_interval: parse_var("OUTBOX_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            job_lease: parse_var("OUTBOX_JOB_LEASE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.job_lease),
            reconcile_after: parse_var("OUTBOX_RECONCILE_AFTER_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.reconcile_after),
            reconcile_interval: parse_var("OUTBOX_RECONCILE_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.reconcile_interval),
            topic_prefix: env::var("OUTBOX_TOPIC_PREFIX").unwrap_or(defaults.topic_prefix),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the worker cannot run with
    pub fn validate(&self) -> Result<(), String> {
        if self.source_service.trim().is_empty() {
            return Err("OUTBOX_SOURCE_SERVICE cannot be empty".to_string());
        }
        if self.max_attempts == 0 {
            return Err("OUTBOX_MAX_ATTEMPTS must be at least 1".to_string());
        }
        if self.backoff_base.is_zero() {
            return Err("OUTBOX_BACKOFF_BASE_MS must be greater than 0".to_string());
        }
        if self.worker_concurrency == 0 {
            return Err("OUTBOX_WORKER_CONCURRENCY must be at least 1".to_string());
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>, String> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| format!("{name} must be a valid number, got '{raw}'")),
        Err(_) => Ok(None),
    }
}
