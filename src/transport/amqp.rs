//! AMQP 0-9-1 client backed by lapin
//!
//! [`LapinTransport`] implements the wire-protocol seam against a running
//! broker. Every channel is opened in publisher-confirm mode; consumers are
//! forwarded onto the unbounded delivery stream the seam expects by one task
//! per consumer, which ends when the broker confirms the cancellation.

use super::{
    AmqpChannel, AmqpConnection, AmqpTransport, Confirmation, ConnectionUrl, ConsumeOptions,
    Consumer, Delivery, MessageProperties, TransportError,
};
use crate::config::{Arguments, DestinationType, ExchangeType};
use crate::error::ObjectKind;
use crate::topology::{BindingSpec, ExchangeSpec, QueueSpec};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeBindOptions,
    ExchangeDeclareOptions, ExchangeDeleteOptions, ExchangeUnbindOptions, QueueBindOptions,
    QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
};
use lapin::publisher_confirm::Confirmation as PublisherConfirmation;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connects to real brokers over the network
#[derive(Debug, Clone, Default)]
pub struct LapinTransport;

impl LapinTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AmqpTransport for LapinTransport {
    async fn connect(
        &self,
        url: &ConnectionUrl,
    ) -> Result<Arc<dyn AmqpConnection>, TransportError> {
        let connection = Connection::connect(url.as_str(), ConnectionProperties::default())
            .await
            .map_err(|e| match e {
                lapin::Error::IOError(io) => TransportError::ConnectionRefused(io.to_string()),
                other => translate(other, ObjectKind::Vhost, url.vhost()),
            })?;

        info!("Connected to {}", url.redacted());
        Ok(Arc::new(LapinConnection {
            connection,
            vhost: url.vhost().to_string(),
        }))
    }
}

struct LapinConnection {
    connection: Connection,
    vhost: String,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, TransportError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| translate(e, ObjectKind::Vhost, &self.vhost))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| translate(e, ObjectKind::Vhost, &self.vhost))?;

        Ok(Arc::new(LapinChannel {
            channel,
            publish_sequence: AtomicU64::new(0),
            forwarders: Mutex::new(HashMap::new()),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        match self.connection.close(200, "Bye").await {
            Ok(()) | Err(lapin::Error::InvalidConnectionState(_)) => Ok(()),
            Err(e) => Err(translate(e, ObjectKind::Vhost, &self.vhost)),
        }
    }

    fn is_closed(&self) -> bool {
        !self.connection.status().connected()
    }
}

struct LapinChannel {
    channel: Channel,
    publish_sequence: AtomicU64,
    /// Delivery forwarding task per consumer tag
    forwarders: Mutex<HashMap<String, JoinHandle<()>>>,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn assert_exchange(&self, spec: &ExchangeSpec) -> Result<(), TransportError> {
        let options = ExchangeDeclareOptions {
            passive: false,
            durable: spec.durable,
            auto_delete: spec.auto_delete,
            internal: spec.internal,
            nowait: false,
        };
        self.channel
            .exchange_declare(
                &spec.name,
                exchange_kind(spec.kind),
                options,
                field_table(&spec.arguments),
            )
            .await
            .map_err(|e| translate(e, ObjectKind::Exchange, &spec.name))
    }

    async fn check_exchange(&self, name: &str) -> Result<(), TransportError> {
        let options = ExchangeDeclareOptions {
            passive: true,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(name, ExchangeKind::Direct, options, FieldTable::default())
            .await
            .map_err(|e| translate(e, ObjectKind::Exchange, name))
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), TransportError> {
        self.channel
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await
            .map_err(|e| translate(e, ObjectKind::Exchange, name))
    }

    async fn assert_queue(&self, spec: &QueueSpec) -> Result<(), TransportError> {
        let options = QueueDeclareOptions {
            passive: false,
            durable: spec.durable,
            exclusive: spec.exclusive,
            auto_delete: spec.auto_delete,
            nowait: false,
        };
        self.channel
            .queue_declare(&spec.name, options, field_table(&spec.arguments))
            .await
            .map(|_| ())
            .map_err(|e| translate(e, ObjectKind::Queue, &spec.name))
    }

    async fn check_queue(&self, name: &str) -> Result<(), TransportError> {
        let options = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };
        self.channel
            .queue_declare(name, options, FieldTable::default())
            .await
            .map(|_| ())
            .map_err(|e| translate(e, ObjectKind::Queue, name))
    }

    async fn delete_queue(&self, name: &str) -> Result<(), TransportError> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| translate(e, ObjectKind::Queue, name))
    }

    async fn purge_queue(&self, name: &str) -> Result<u32, TransportError> {
        self.channel
            .queue_purge(name, QueuePurgeOptions::default())
            .await
            .map_err(|e| translate(e, ObjectKind::Queue, name))
    }

    async fn bind(&self, binding: &BindingSpec) -> Result<(), TransportError> {
        let arguments = field_table(&binding.arguments);
        let result = match binding.destination_type {
            DestinationType::Queue => {
                self.channel
                    .queue_bind(
                        &binding.destination,
                        &binding.source,
                        &binding.binding_key,
                        QueueBindOptions::default(),
                        arguments,
                    )
                    .await
            }
            DestinationType::Exchange => {
                self.channel
                    .exchange_bind(
                        &binding.destination,
                        &binding.source,
                        &binding.binding_key,
                        ExchangeBindOptions::default(),
                        arguments,
                    )
                    .await
            }
        };
        result.map_err(|e| translate(e, ObjectKind::Binding, &binding_label(binding)))
    }

    async fn unbind(&self, binding: &BindingSpec) -> Result<(), TransportError> {
        let arguments = field_table(&binding.arguments);
        let result = match binding.destination_type {
            DestinationType::Queue => {
                self.channel
                    .queue_unbind(
                        &binding.destination,
                        &binding.source,
                        &binding.binding_key,
                        arguments,
                    )
                    .await
            }
            DestinationType::Exchange => {
                self.channel
                    .exchange_unbind(
                        &binding.destination,
                        &binding.source,
                        &binding.binding_key,
                        ExchangeUnbindOptions::default(),
                        arguments,
                    )
                    .await
            }
        };
        result.map_err(|e| translate(e, ObjectKind::Binding, &binding_label(binding)))
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| translate(e, ObjectKind::Queue, ""))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: &MessageProperties,
        mandatory: bool,
    ) -> Result<Confirmation, TransportError> {
        let options = BasicPublishOptions {
            mandatory,
            immediate: false,
        };
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                options,
                &body,
                to_basic_properties(properties),
            )
            .await
            .map_err(|e| translate(e, ObjectKind::Exchange, exchange))?;
        let sequence = self.publish_sequence.fetch_add(1, Ordering::Relaxed) + 1;

        let confirmation = confirm
            .await
            .map_err(|e| translate(e, ObjectKind::Exchange, exchange))?;
        match confirmation {
            // A returned message was unroutable; only reported for mandatory publishes
            PublisherConfirmation::Ack(returned) => Ok(Confirmation {
                sequence,
                routed: returned.is_none(),
            }),
            PublisherConfirmation::NotRequested => Ok(Confirmation {
                sequence,
                routed: true,
            }),
            PublisherConfirmation::Nack(_) => Err(TransportError::Other(format!(
                "broker rejected message {sequence} published to '{exchange}'"
            ))),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<Consumer, TransportError> {
        let consume_options = BasicConsumeOptions {
            no_local: false,
            no_ack: options.no_ack,
            exclusive: options.exclusive,
            nowait: false,
        };
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                options.consumer_tag.as_deref().unwrap_or_default(),
                consume_options,
                FieldTable::default(),
            )
            .await
            .map_err(|e| translate(e, ObjectKind::Queue, queue))?;

        let tag = consumer.tag().as_str().to_string();
        let (sender, deliveries) = mpsc::unbounded_channel();
        let forwarder_tag = tag.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        if sender.send(from_lapin_delivery(&forwarder_tag, delivery)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Consumer {} stopped: {}", forwarder_tag, e);
                        break;
                    }
                }
            }
            debug!("Consumer {} stream ended", forwarder_tag);
        });
        if let Ok(mut forwarders) = self.forwarders.lock() {
            forwarders.insert(tag.clone(), forwarder);
        }

        Ok(Consumer { tag, deliveries })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| translate(e, ObjectKind::Queue, consumer_tag))?;

        let forwarder = self
            .forwarders
            .lock()
            .ok()
            .and_then(|mut forwarders| forwarders.remove(consumer_tag));
        if let Some(forwarder) = forwarder {
            if let Err(e) = forwarder.await {
                debug!("Forwarder for consumer {} ended abnormally: {}", consumer_tag, e);
            }
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| translate(e, ObjectKind::Queue, ""))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        let options = BasicNackOptions {
            multiple: false,
            requeue,
        };
        self.channel
            .basic_nack(delivery_tag, options)
            .await
            .map_err(|e| translate(e, ObjectKind::Queue, ""))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        match self.channel.close(200, "Bye").await {
            Ok(()) | Err(lapin::Error::InvalidChannelState(_)) => Ok(()),
            Err(e) => Err(translate(e, ObjectKind::Vhost, "")),
        }
    }

    fn is_closed(&self) -> bool {
        !self.channel.status().connected()
    }
}

/// Map a lapin error onto the seam's error, naming the object it concerned
fn translate(error: lapin::Error, kind: ObjectKind, name: &str) -> TransportError {
    match error {
        lapin::Error::ProtocolError(amqp) => {
            let reason = amqp.get_message().as_str().to_string();
            match amqp.get_id() {
                403 => TransportError::Authentication(reason),
                404 => TransportError::NotFound {
                    kind,
                    name: name.to_string(),
                },
                406 => TransportError::PreconditionFailed {
                    kind,
                    name: name.to_string(),
                    reason,
                },
                530 => TransportError::NotAllowed(reason),
                _ => TransportError::Other(reason),
            }
        }
        lapin::Error::InvalidChannelState(_) => TransportError::ChannelClosed,
        lapin::Error::InvalidConnectionState(_) => TransportError::ConnectionClosed,
        other => TransportError::Other(other.to_string()),
    }
}

fn binding_label(binding: &BindingSpec) -> String {
    format!(
        "{} -> {} ({})",
        binding.source, binding.destination, binding.binding_key
    )
}

fn exchange_kind(kind: ExchangeType) -> ExchangeKind {
    match kind {
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Topic => ExchangeKind::Topic,
        ExchangeType::Headers => ExchangeKind::Headers,
    }
}

fn field_value(value: &serde_json::Value) -> AMQPValue {
    match value {
        serde_json::Value::Bool(b) => AMQPValue::Boolean(*b),
        serde_json::Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => AMQPValue::LongLongInt(i),
            (None, Some(f)) => AMQPValue::Double(f),
            (None, None) => AMQPValue::LongString(LongString::from(n.to_string())),
        },
        serde_json::Value::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        other => AMQPValue::LongString(LongString::from(other.to_string())),
    }
}

fn field_table(arguments: &Arguments) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        table.insert(ShortString::from(key.clone()), field_value(value));
    }
    table
}

fn header_text(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        AMQPValue::Boolean(b) => Some(b.to_string()),
        AMQPValue::ShortInt(i) => Some(i.to_string()),
        AMQPValue::LongInt(i) => Some(i.to_string()),
        AMQPValue::LongLongInt(i) => Some(i.to_string()),
        AMQPValue::Double(f) => Some(f.to_string()),
        _ => None,
    }
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(encoding) = &properties.content_encoding {
        basic = basic.with_content_encoding(ShortString::from(encoding.clone()));
    }
    if !properties.headers.is_empty() {
        let mut headers = FieldTable::default();
        for (key, value) in &properties.headers {
            headers.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }
        basic = basic.with_headers(headers);
    }
    if let Some(mode) = properties.delivery_mode {
        basic = basic.with_delivery_mode(mode);
    }
    if let Some(priority) = properties.priority {
        basic = basic.with_priority(priority);
    }
    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(correlation_id.clone()));
    }
    if let Some(reply_to) = &properties.reply_to {
        basic = basic.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(expiration) = &properties.expiration {
        basic = basic.with_expiration(ShortString::from(expiration.clone()));
    }
    if let Some(message_id) = &properties.message_id {
        basic = basic.with_message_id(ShortString::from(message_id.clone()));
    }
    if let Some(timestamp) = properties.timestamp.and_then(|t| u64::try_from(t).ok()) {
        basic = basic.with_timestamp(timestamp);
    }
    basic
}

fn from_basic_properties(basic: &BasicProperties) -> MessageProperties {
    let text = |value: &Option<ShortString>| value.as_ref().map(|s| s.as_str().to_string());
    let headers: BTreeMap<String, String> = basic
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| {
                    header_text(value).map(|value| (key.as_str().to_string(), value))
                })
                .collect()
        })
        .unwrap_or_default();

    MessageProperties {
        content_type: text(basic.content_type()),
        content_encoding: text(basic.content_encoding()),
        headers,
        delivery_mode: *basic.delivery_mode(),
        priority: *basic.priority(),
        correlation_id: text(basic.correlation_id()),
        reply_to: text(basic.reply_to()),
        expiration: text(basic.expiration()),
        message_id: text(basic.message_id()),
        timestamp: (*basic.timestamp()).and_then(|t| i64::try_from(t).ok()),
    }
}

fn from_lapin_delivery(consumer_tag: &str, delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        consumer_tag: consumer_tag.to_string(),
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        properties: from_basic_properties(&delivery.properties),
        body: Bytes::from(delivery.data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_arguments_become_typed_field_values() {
        let mut arguments = Arguments::new();
        arguments.insert("x-max-length".to_string(), json!(1000));
        arguments.insert("x-queue-type".to_string(), json!("quorum"));
        arguments.insert("x-single-active-consumer".to_string(), json!(true));

        let table = field_table(&arguments);
        let inner = table.inner();
        assert_eq!(
            inner.get(&ShortString::from("x-max-length".to_string())),
            Some(&AMQPValue::LongLongInt(1000))
        );
        assert_eq!(
            inner.get(&ShortString::from("x-queue-type".to_string())),
            Some(&AMQPValue::LongString(LongString::from("quorum".to_string())))
        );
        assert_eq!(
            inner.get(&ShortString::from("x-single-active-consumer".to_string())),
            Some(&AMQPValue::Boolean(true))
        );
    }

    #[test]
    fn test_message_properties_survive_conversion() {
        let mut headers = BTreeMap::new();
        headers.insert("tenant".to_string(), "acme".to_string());
        let properties = MessageProperties {
            content_type: Some("application/json".to_string()),
            content_encoding: None,
            headers,
            delivery_mode: Some(2),
            priority: Some(5),
            correlation_id: Some("corr-1".to_string()),
            reply_to: None,
            expiration: Some("60000".to_string()),
            message_id: Some("m-1".to_string()),
            timestamp: Some(1_700_000_000),
        };

        let converted = from_basic_properties(&to_basic_properties(&properties));
        assert_eq!(converted, properties);
    }

    #[test]
    fn test_negative_timestamp_is_dropped() {
        let properties = MessageProperties {
            timestamp: Some(-1),
            ..MessageProperties::default()
        };
        assert_eq!(from_basic_properties(&to_basic_properties(&properties)).timestamp, None);
    }

    #[test]
    fn test_exchange_kinds() {
        assert!(matches!(exchange_kind(ExchangeType::Topic), ExchangeKind::Topic));
        assert!(matches!(exchange_kind(ExchangeType::Headers), ExchangeKind::Headers));
    }
}
