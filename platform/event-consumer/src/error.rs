/// Errors raised by a processed-event ledger
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors raised while consuming one message
#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    #[error("invalid event envelope: {0}")]
    InvalidEnvelope(String),

    #[error("failed to decode event: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("event handler failed: {0}")]
    Handler(String),
}

impl ConsumeError {
    /// Malformed messages never get better on retry; everything else might
    pub fn is_retriable(&self) -> bool {
        matches!(self, ConsumeError::Ledger(_) | ConsumeError::Handler(_))
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
