//! NATS-based implementation of the EventBus trait

use crate::{BusError, BusMessage, BusResult, EventBus, MESSAGE_ID_HEADER, PARTITION_KEY_HEADER};
use async_nats::jetstream;
use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;

/// EventBus implementation backed by NATS
///
/// Two publish modes:
/// - [`NatsBus::new`]: core NATS publish (fire-and-forget once flushed to
///   the client buffer)
/// - [`NatsBus::jetstream`]: JetStream publish, which waits for the
///   stream's ack and lets the stream deduplicate on `Nats-Msg-Id`
///
/// The partition key and message id travel as headers.
///
/// # Example
/// ```rust,no_run
/// use event_bus::{BusMessage, EventBus, NatsBus};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let nats_client = async_nats::connect("nats://localhost:4222").await?;
/// let bus = NatsBus::jetstream(nats_client);
///
/// bus.publish(BusMessage::new("my.subject".to_string(), b"hello".to_vec())).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NatsBus {
    client: Client,
    jetstream: Option<jetstream::Context>,
}

impl NatsBus {
    /// Create a NatsBus that publishes with core NATS
    pub fn new(client: Client) -> Self {
        Self {
            client,
            jetstream: None,
        }
    }

    /// Create a NatsBus that publishes through JetStream and awaits acks
    pub fn jetstream(client: Client) -> Self {
        let context = jetstream::new(client.clone());
        Self {
            client,
            jetstream: Some(context),
        }
    }

    /// Get a reference to the underlying NATS client
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn headers_for(message: &BusMessage) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(extra) = &message.headers {
            for (key, value) in extra {
                headers.insert(key.as_str(), value.as_str());
            }
        }
        if let Some(id) = &message.message_id {
            headers.insert(MESSAGE_ID_HEADER, id.as_str());
        }
        if let Some(key) = &message.key {
            headers.insert(PARTITION_KEY_HEADER, key.as_str());
        }
        headers
    }
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, message: BusMessage) -> BusResult<()> {
        let headers = Self::headers_for(&message);
        let subject = message.subject;
        let payload = message.payload.into();

        match &self.jetstream {
            Some(js) => {
                let ack = js
                    .publish_with_headers(subject, headers, payload)
                    .await
                    .map_err(|e| BusError::PublishError(e.to_string()))?;
                ack.await
                    .map_err(|e| BusError::PublishError(format!("no ack: {e}")))?;
            }
            None => {
                self.client
                    .publish_with_headers(subject, headers, payload)
                    .await
                    .map_err(|e| BusError::PublishError(e.to_string()))?;
            }
        }

        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let stream = subscriber.map(|nats_msg| {
            let mut msg = BusMessage::new(nats_msg.subject.to_string(), nats_msg.payload.to_vec());

            if let Some(nats_headers) = nats_msg.headers {
                let mut headers = HashMap::new();
                for (key, values) in nats_headers.iter() {
                    if let Some(value) = values.first() {
                        headers.insert(key.to_string(), value.to_string());
                    }
                }
                if let Some(id) = headers.remove(MESSAGE_ID_HEADER) {
                    msg = msg.with_message_id(id);
                }
                if let Some(key) = headers.remove(PARTITION_KEY_HEADER) {
                    msg = msg.with_key(key);
                }
                if !headers.is_empty() {
                    msg = msg.with_headers(headers);
                }
            }

            msg
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Requires a running NATS server: docker run -p 4222:4222 nats:2.10-alpine
    #[tokio::test]
    #[ignore]
    async fn test_nats_bus_round_trips_key_and_message_id() {
        let client = async_nats::connect("nats://localhost:4222")
            .await
            .expect("NATS server must be running on localhost:4222");

        let bus = NatsBus::new(client);
        let mut stream = bus.subscribe("test.nats.>").await.unwrap();

        let msg = BusMessage::new("test.nats.hello".to_string(), b"test message".to_vec())
            .with_key("agg-1".to_string())
            .with_message_id("evt-1".to_string());
        bus.publish(msg.clone()).await.unwrap();

        let received = tokio::time::timeout(std::time::Duration::from_secs(2), stream.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended");

        assert_eq!(received, msg);
    }
}
