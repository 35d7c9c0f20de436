//! Wire-protocol seam
//!
//! The engine talks to the broker only through these traits.
//! [`LapinTransport`] implements them over the network and
//! [`crate::testing::InMemoryBroker`] implements them in-process.
//!
//! - [`amqp`] - the lapin-backed client
//! - [`connection`] - pure connection URL construction and retry policy
//! - [`manager`] - per-vhost connection ownership with retry and channel acquisition

use crate::error::ObjectKind;
use crate::topology::{BindingSpec, ExchangeSpec, QueueSpec};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod amqp;
pub mod connection;
pub mod manager;

pub use amqp::LapinTransport;
pub use connection::{ConnectionState, ConnectionUrl, RetryDecision, RetryPolicy};
pub use manager::{ConnectionInfo, ConnectionManager};

/// Errors reported by a wire-protocol client
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("ACCESS_REFUSED - {0}")]
    Authentication(String),
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),
    #[error("NOT_FOUND - no {kind} '{name}'")]
    NotFound { kind: ObjectKind, name: String },
    #[error("PRECONDITION_FAILED - {reason}")]
    PreconditionFailed {
        kind: ObjectKind,
        name: String,
        reason: String,
    },
    #[error("NOT_ALLOWED - {0}")]
    NotAllowed(String),
    #[error("Channel closed")]
    ChannelClosed,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Timed out after {after_ms}ms")]
    TimedOut { after_ms: u64 },
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Errors that must not be retried when establishing a connection
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, TransportError::Authentication(_))
    }

    /// AMQP reply code for the failure, when one applies
    pub fn reply_code(&self) -> Option<u16> {
        match self {
            TransportError::Authentication(_) => Some(403),
            TransportError::NotFound { .. } => Some(404),
            TransportError::PreconditionFailed { .. } => Some(406),
            TransportError::NotAllowed(_) => Some(530),
            _ => None,
        }
    }
}

/// Basic message properties
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// 1 = transient, 2 = persistent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_mode: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Seconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl MessageProperties {
    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == Some(2)
    }
}

/// A message delivered to a consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Bytes,
    pub properties: MessageProperties,
}

/// Options for `basic.consume`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumeOptions {
    pub no_ack: bool,
    pub exclusive: bool,
    pub consumer_tag: Option<String>,
}

/// A live consumer attachment
///
/// `deliveries` ends once the consumer has been cancelled and the broker has
/// acknowledged the cancellation.
#[derive(Debug)]
pub struct Consumer {
    pub tag: String,
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
}

/// Broker confirmation of a published message
#[derive(Debug, Clone, PartialEq)]
pub struct Confirmation {
    /// Publisher-confirm sequence number on the channel
    pub sequence: u64,
    /// Whether the message reached at least one queue
    pub routed: bool,
}

/// Entry point of a wire-protocol client
#[async_trait]
pub trait AmqpTransport: Send + Sync {
    /// Open a network connection to the vhost addressed by `url`
    async fn connect(&self, url: &ConnectionUrl)
        -> Result<Arc<dyn AmqpConnection>, TransportError>;
}

/// One network connection to one vhost
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, TransportError>;

    /// Close the connection and every channel on it; closing twice is not an error
    async fn close(&self) -> Result<(), TransportError>;

    fn is_closed(&self) -> bool;
}

/// A logical channel multiplexed over a connection
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Declare an exchange, failing with `PreconditionFailed` if it exists with different settings
    async fn assert_exchange(&self, spec: &ExchangeSpec) -> Result<(), TransportError>;

    /// Passive declare, failing with `NotFound` if absent
    async fn check_exchange(&self, name: &str) -> Result<(), TransportError>;

    async fn delete_exchange(&self, name: &str) -> Result<(), TransportError>;

    /// Declare a queue, failing with `PreconditionFailed` if it exists with different settings
    async fn assert_queue(&self, spec: &QueueSpec) -> Result<(), TransportError>;

    /// Passive declare, failing with `NotFound` if absent
    async fn check_queue(&self, name: &str) -> Result<(), TransportError>;

    async fn delete_queue(&self, name: &str) -> Result<(), TransportError>;

    /// Remove all ready messages, returning how many were purged
    async fn purge_queue(&self, name: &str) -> Result<u32, TransportError>;

    async fn bind(&self, binding: &BindingSpec) -> Result<(), TransportError>;

    async fn unbind(&self, binding: &BindingSpec) -> Result<(), TransportError>;

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError>;

    /// Publish and wait for the publisher confirm
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: &MessageProperties,
        mandatory: bool,
    ) -> Result<Confirmation, TransportError>;

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<Consumer, TransportError>;

    /// Cancel a consumer; resolves once the broker has acknowledged and the
    /// consumer's delivery stream has been closed
    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    /// Close the channel; closing twice is not an error
    async fn close(&self) -> Result<(), TransportError>;

    fn is_closed(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_authentication_is_unrecoverable() {
        assert!(TransportError::Authentication("bad password".to_string()).is_unrecoverable());
        assert!(!TransportError::ConnectionRefused("down".to_string()).is_unrecoverable());
        assert!(!TransportError::NotAllowed("vhost not found".to_string()).is_unrecoverable());
        assert!(!TransportError::TimedOut { after_ms: 10 }.is_unrecoverable());
    }

    #[test]
    fn test_reply_codes() {
        let not_found = TransportError::NotFound {
            kind: ObjectKind::Queue,
            name: "q1".to_string(),
        };
        assert_eq!(not_found.reply_code(), Some(404));
        assert_eq!(not_found.to_string(), "NOT_FOUND - no queue 'q1'");
        assert_eq!(TransportError::ChannelClosed.reply_code(), None);
    }

    #[test]
    fn test_persistent_delivery_mode() {
        let mut properties = MessageProperties::default();
        assert!(!properties.is_persistent());
        properties.delivery_mode = Some(2);
        assert!(properties.is_persistent());
    }
}
