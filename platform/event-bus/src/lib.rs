//! # EventBus Abstraction
//!
//! Broker-facing side of the outbox subsystem. The outbox publisher worker
//! hands finished envelopes to an [`EventBus`]; consumers subscribe to the
//! same bus and run their handlers behind an idempotency ledger.
//!
//! ## Implementations
//!
//! - **NatsBus**: NATS, either core publish or JetStream with broker acks
//! - **InMemoryBus**: Test/dev implementation using in-memory channels
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{BusMessage, EventBus, InMemoryBus};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
//!
//! let msg = BusMessage::new("events.user.created".to_string(), b"{}".to_vec())
//!     .with_key("user-42".to_string())
//!     .with_message_id("7f6c1f0e-0000-4000-8000-000000000000".to_string());
//! bus.publish(msg).await?;
//!
//! let mut stream = bus.subscribe("events.user.>").await?;
//! while let Some(msg) = futures::StreamExt::next(&mut stream).await {
//!     println!("Received: {} bytes on {}", msg.payload.len(), msg.subject);
//! }
//! # Ok(())
//! # }
//! ```

pub mod consumer_retry;
mod envelope;
mod inmemory_bus;
mod nats_bus;

pub use envelope::{validate_envelope_fields, EventEnvelope};
pub use inmemory_bus::{InMemoryBus, DEFAULT_LOG_LIMIT};
pub use nats_bus::NatsBus;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;

/// Header carrying the broker-level deduplication id
pub const MESSAGE_ID_HEADER: &str = "Nats-Msg-Id";

/// Header carrying the partition (ordering) key
pub const PARTITION_KEY_HEADER: &str = "Partition-Key";

/// A message sent to or received from the event bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// The subject/topic this message was published to
    pub subject: String,
    /// Partition key; messages sharing a key keep their publish order
    pub key: Option<String>,
    /// Broker message id, used by the broker for duplicate detection
    pub message_id: Option<String>,
    /// The message payload (raw bytes)
    pub payload: Vec<u8>,
    /// Optional transport headers
    pub headers: Option<HashMap<String, String>>,
}

impl BusMessage {
    /// Create a new bus message
    pub fn new(subject: String, payload: Vec<u8>) -> Self {
        Self {
            subject,
            key: None,
            message_id: None,
            payload,
            headers: None,
        }
    }

    /// Set the partition key
    pub fn with_key(mut self, key: String) -> Self {
        self.key = Some(key);
        self
    }

    /// Set the broker message id
    pub fn with_message_id(mut self, message_id: String) -> Self {
        self.message_id = Some(message_id);
        self
    }

    /// Add headers to the message
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }
}

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to subscribe to subject: {0}")]
    SubscribeError(String),

    #[error("connection error: {0}")]
    ConnectionError(String),
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Core event bus abstraction for publish-subscribe messaging
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a message
    ///
    /// Returns once the broker has accepted the message. For brokers with
    /// acknowledgements (JetStream) that means the ack was received.
    async fn publish(&self, message: BusMessage) -> BusResult<()>;

    /// Subscribe to messages matching a subject pattern
    ///
    /// Supports NATS wildcards: `*` matches a single token, `>` matches one
    /// or more trailing tokens.
    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>>;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}
