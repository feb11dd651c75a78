//! In-memory implementation of the EventBus trait for testing and development

use crate::{BusMessage, BusResult, EventBus};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

/// EventBus implementation using in-memory channels
///
/// Messages are broadcast to all subscribers via a Tokio broadcast channel
/// and also appended to a publish log, so tests can inspect exactly what
/// left the outbox (including partition key and message id) without racing
/// a subscriber. The log keeps the most recent [`DEFAULT_LOG_LIMIT`]
/// messages unless [`with_log_limit`](Self::with_log_limit) says otherwise.
///
/// # Example
/// ```rust
/// use event_bus::{BusMessage, EventBus, InMemoryBus};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryBus::new();
/// let mut stream = bus.subscribe("test.events.>").await?;
///
/// bus.publish(BusMessage::new("test.events.created".to_string(), b"hello".to_vec())).await?;
///
/// let msg = stream.next().await.unwrap();
/// assert_eq!(msg.subject, "test.events.created");
/// assert_eq!(bus.published().len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryBus {
    sender: Arc<broadcast::Sender<BusMessage>>,
    log: Arc<Mutex<VecDeque<BusMessage>>>,
    log_limit: usize,
}

/// Messages retained in the publish log by default
pub const DEFAULT_LOG_LIMIT: usize = 1000;

impl InMemoryBus {
    /// Create a new in-memory event bus with a buffer of 1000 messages
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    /// Create a new in-memory event bus with a custom buffer size
    ///
    /// If a subscriber falls more than `buffer_size` messages behind, the
    /// oldest messages are dropped for that subscriber.
    pub fn with_capacity(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self {
            sender: Arc::new(sender),
            log: Arc::new(Mutex::new(VecDeque::new())),
            log_limit: DEFAULT_LOG_LIMIT,
        }
    }

    /// Keep at most `limit` messages in the publish log; zero turns it off
    pub fn with_log_limit(mut self, limit: usize) -> Self {
        self.log_limit = limit;
        self
    }

    /// Most recently published messages, oldest first
    pub fn published(&self) -> Vec<BusMessage> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn record(&self, message: &BusMessage) {
        if self.log_limit == 0 {
            return;
        }
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        while log.len() >= self.log_limit {
            log.pop_front();
        }
        log.push_back(message.clone());
    }

    /// Check if a subject matches a subscription pattern
    ///
    /// Supports NATS-style wildcards:
    /// - `*` matches exactly one token
    /// - `>` matches one or more tokens
    fn matches_pattern(subject: &str, pattern: &str) -> bool {
        let subject_tokens: Vec<&str> = subject.split('.').collect();
        let pattern_tokens: Vec<&str> = pattern.split('.').collect();

        let mut s_idx = 0;
        let mut p_idx = 0;

        while s_idx < subject_tokens.len() && p_idx < pattern_tokens.len() {
            let pattern_token = pattern_tokens[p_idx];

            if pattern_token == ">" {
                return true;
            } else if pattern_token == "*" || subject_tokens[s_idx] == pattern_token {
                s_idx += 1;
                p_idx += 1;
            } else {
                return false;
            }
        }

        s_idx == subject_tokens.len() && p_idx == pattern_tokens.len()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, message: BusMessage) -> BusResult<()> {
        self.record(&message);

        // No receivers is fine
        let _ = self.sender.send(message);

        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        let mut receiver = self.sender.subscribe();
        let pattern = pattern.to_string();

        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(msg) => {
                        if Self::matches_pattern(&msg.subject, &pattern) {
                            yield msg;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, pattern = %pattern, "InMemoryBus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[test]
    fn test_pattern_matching() {
        assert!(InMemoryBus::matches_pattern("auth.events.user.created", "auth.events.user.created"));

        assert!(InMemoryBus::matches_pattern("auth.events.user.created", "auth.*.user.created"));
        assert!(!InMemoryBus::matches_pattern("auth.events.user.created", "auth.*.created"));

        assert!(InMemoryBus::matches_pattern("auth.events.user.created", "auth.>"));
        assert!(!InMemoryBus::matches_pattern("auth.events.user.created", "billing.>"));

        assert!(InMemoryBus::matches_pattern("single", "*"));
        assert!(InMemoryBus::matches_pattern("single", ">"));
        assert!(!InMemoryBus::matches_pattern("one.two", "one"));
    }

    #[tokio::test]
    async fn test_publish_and_subscribe_keeps_key_and_id() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe("test.events.>").await.unwrap();

        let msg = BusMessage::new("test.events.user.created".to_string(), b"payload".to_vec())
            .with_key("agg-1".to_string())
            .with_message_id("evt-1".to_string());
        bus.publish(msg.clone()).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended");

        assert_eq!(received, msg);
        assert_eq!(bus.published(), vec![msg]);
    }

    #[tokio::test]
    async fn test_same_key_messages_arrive_in_publish_order() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe("orders.>").await.unwrap();

        for i in 0..5 {
            let msg = BusMessage::new("orders.updated".to_string(), format!("v{i}").into_bytes())
                .with_key("order-9".to_string());
            bus.publish(msg).await.unwrap();
        }

        for i in 0..5 {
            let msg = tokio::time::timeout(Duration::from_secs(1), stream.next())
                .await
                .expect("timeout")
                .expect("stream ended");
            assert_eq!(msg.payload, format!("v{i}").into_bytes());
        }
    }

    #[tokio::test]
    async fn test_wildcard_filtering() {
        let bus = InMemoryBus::new();
        let mut stream = bus.subscribe("auth.events.*").await.unwrap();

        for subject in [
            "auth.events.created",
            "auth.events.user.created",
            "billing.events.created",
        ] {
            bus.publish(BusMessage::new(subject.to_string(), Vec::new()))
                .await
                .unwrap();
        }

        let msg = tokio::time::timeout(Duration::from_millis(100), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended");
        assert_eq!(msg.subject, "auth.events.created");

        let result = tokio::time::timeout(Duration::from_millis(100), stream.next()).await;
        assert!(result.is_err(), "should timeout, no more messages");
        assert_eq!(bus.published().len(), 3);
    }

    #[tokio::test]
    async fn test_publish_log_keeps_only_the_newest_messages() {
        let bus = InMemoryBus::new().with_log_limit(2);
        for subject in ["a.one", "a.two", "a.three"] {
            bus.publish(BusMessage::new(subject.to_string(), Vec::new()))
                .await
                .unwrap();
        }

        let subjects: Vec<String> = bus.published().into_iter().map(|m| m.subject).collect();
        assert_eq!(subjects, vec!["a.two", "a.three"]);

        let silent = InMemoryBus::new().with_log_limit(0);
        silent
            .publish(BusMessage::new("a.one".to_string(), Vec::new()))
            .await
            .unwrap();
        assert!(silent.published().is_empty());
    }
}
