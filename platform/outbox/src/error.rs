use event_bus::BusError;
use uuid::Uuid;

/// Failure to open or finish a unit-of-work transaction
///
/// Errors raised by the work itself are never wrapped in this type; they
/// reach the caller unchanged.
#[derive(Debug, thiserror::Error)]
pub enum UnitOfWorkError {
    #[error("failed to begin transaction: {0}")]
    Begin(String),

    #[error("failed to commit transaction: {0}")]
    Commit(String),

    #[error("failed to roll back transaction: {0}")]
    Rollback(String),
}

/// Errors raised by the work queue
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("unknown job: {0}")]
    UnknownJob(String),
}

/// Errors raised by the outbox write and delivery paths
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("invalid outbox event: {0}")]
    InvalidEvent(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("broker error: {0}")]
    Bus(#[from] BusError),

    #[error("publish of {0} timed out")]
    PublishTimeout(Uuid),

    #[error("outbox store error: {0}")]
    Store(String),

    #[error(transparent)]
    UnitOfWork(#[from] UnitOfWorkError),
}

/// Result type for outbox operations
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;
