//! Outgoing payloads and incoming messages

use crate::error::{BrokerError, BrokerResult};
use crate::transport::{AmqpChannel, Delivery, MessageProperties};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Body and content type of a message to publish
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub body: Bytes,
    pub content_type: Option<String>,
}

impl Payload {
    pub fn new<B: Into<Bytes>>(body: B) -> Self {
        Self {
            body: body.into(),
            content_type: None,
        }
    }

    /// Serialize `value` as an `application/json` payload
    pub fn json<T: Serialize>(value: &T) -> BrokerResult<Self> {
        Ok(Self {
            body: Bytes::from(serde_json::to_vec(value)?),
            content_type: Some("application/json".to_string()),
        })
    }

    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::from(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::new(text).with_content_type("text/plain")
    }
}

impl From<Vec<u8>> for Payload {
    fn from(body: Vec<u8>) -> Self {
        Self::new(body)
    }
}

impl From<Bytes> for Payload {
    fn from(body: Bytes) -> Self {
        Self::new(body)
    }
}

/// Settles one delivery; shared by every clone of the message
pub(crate) struct Acker {
    channel: Arc<dyn AmqpChannel>,
    delivery_tag: u64,
    settled: AtomicBool,
    timeout: Duration,
}

impl Acker {
    pub(crate) fn new(channel: Arc<dyn AmqpChannel>, delivery_tag: u64, timeout: Duration) -> Self {
        Self {
            channel,
            delivery_tag,
            settled: AtomicBool::new(false),
            timeout,
        }
    }

    async fn settle(&self, subscription: &str, ack: bool, requeue: bool) -> BrokerResult<()> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let operation = if ack { "ack" } else { "nack" };
        let call = async {
            if ack {
                self.channel.ack(self.delivery_tag).await
            } else {
                self.channel.nack(self.delivery_tag, requeue).await
            }
        };
        let target = format!("delivery {} on {}", self.delivery_tag, subscription);

        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BrokerError::channel(operation, target, e)),
            Err(_) => Err(BrokerError::timeout(operation, target, self.timeout)),
        }
    }
}

impl fmt::Debug for Acker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acker")
            .field("delivery_tag", &self.delivery_tag)
            .field("settled", &self.settled.load(Ordering::Relaxed))
            .finish()
    }
}

/// A message delivered to a subscriber session
#[derive(Debug, Clone)]
pub struct Message {
    pub subscription: String,
    pub vhost: String,
    pub body: Bytes,
    pub properties: MessageProperties,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub delivery_tag: u64,
    acker: Option<Arc<Acker>>,
}

impl Message {
    pub(crate) fn from_delivery(
        subscription: &str,
        vhost: &str,
        delivery: Delivery,
        acker: Option<Acker>,
    ) -> Self {
        Self {
            subscription: subscription.to_string(),
            vhost: vhost.to_string(),
            body: delivery.body,
            properties: delivery.properties,
            exchange: delivery.exchange,
            routing_key: delivery.routing_key,
            redelivered: delivery.redelivered,
            delivery_tag: delivery.delivery_tag,
            acker: acker.map(Arc::new),
        }
    }

    /// The body as UTF-8 text, if it is valid UTF-8
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> BrokerResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.properties.content_type.as_deref()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.properties.message_id.as_deref()
    }

    /// Whether the broker expects an ack or nack for this message
    pub fn requires_ack(&self) -> bool {
        self.acker.is_some()
    }

    /// Acknowledge the message; no-op for `no_ack` subscriptions or if already settled
    pub async fn ack(&self) -> BrokerResult<()> {
        match &self.acker {
            Some(acker) => acker.settle(&self.subscription, true, false).await,
            None => Ok(()),
        }
    }

    /// Reject the message, optionally requeueing it
    pub async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        match &self.acker {
            Some(acker) => acker.settle(&self.subscription, false, requeue).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Order {
        id: u32,
        item: String,
    }

    fn delivery(body: &'static [u8]) -> Delivery {
        Delivery {
            consumer_tag: "ctag-1".to_string(),
            delivery_tag: 7,
            exchange: "ns:e1".to_string(),
            routing_key: "orders.created".to_string(),
            redelivered: false,
            body: Bytes::from_static(body),
            properties: MessageProperties {
                content_type: Some("application/json".to_string()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_text_payload_sets_content_type() {
        let payload = Payload::from("hello");
        assert_eq!(payload.body, Bytes::from_static(b"hello"));
        assert_eq!(payload.content_type.as_deref(), Some("text/plain"));

        let raw = Payload::from(vec![0u8, 1, 2]);
        assert_eq!(raw.content_type, None);
    }

    #[test]
    fn test_json_payload() {
        let payload = Payload::json(&Order {
            id: 1,
            item: "book".to_string(),
        })
        .unwrap();

        assert_eq!(payload.content_type.as_deref(), Some("application/json"));
        assert_eq!(payload.body, Bytes::from_static(br#"{"id":1,"item":"book"}"#));
    }

    #[test]
    fn test_message_decoding() {
        let message = Message::from_delivery(
            "s1",
            "v1",
            delivery(br#"{"id":2,"item":"pen"}"#),
            None,
        );

        assert_eq!(
            message.json::<Order>().unwrap(),
            Order {
                id: 2,
                item: "pen".to_string()
            }
        );
        assert_eq!(message.content_type(), Some("application/json"));
        assert!(message.text().is_some());
        assert!(!message.requires_ack());
    }

    #[test]
    fn test_invalid_json_is_a_serialization_error() {
        let message = Message::from_delivery("s1", "v1", delivery(b"not json"), None);
        assert!(matches!(
            message.json::<Order>(),
            Err(BrokerError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_settling_without_acker_is_a_no_op() {
        let message = Message::from_delivery("s1", "v1", delivery(b"{}"), None);
        message.ack().await.unwrap();
        message.nack(true).await.unwrap();
    }
}
