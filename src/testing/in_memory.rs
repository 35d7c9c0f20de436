//! In-process broker implementing both the wire-protocol seam and the
//! management API
//!
//! Routing follows AMQP 0-9-1 semantics for direct, fanout, topic and
//! headers exchanges, including the default exchange and
//! exchange-to-exchange bindings. Consumers on a queue are served
//! round-robin, unacknowledged deliveries are requeued when their channel
//! closes, and deleting a vhost closes every connection to it.
//!
//! Failures can be injected: refused connects, and latency on channel
//! operations.

use crate::config::{DestinationType, ExchangeType};
use crate::error::ObjectKind;
use crate::management::{ManagementApi, ManagementEndpoint, ManagementError};
use crate::topology::{BindingSpec, ExchangeSpec, QueueSpec};
use crate::transport::{
    AmqpChannel, AmqpConnection, AmqpTransport, Confirmation, ConnectionUrl, ConsumeOptions,
    Consumer, Delivery, MessageProperties, TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

const PREDECLARED_EXCHANGES: [(&str, ExchangeType); 4] = [
    ("amq.direct", ExchangeType::Direct),
    ("amq.fanout", ExchangeType::Fanout),
    ("amq.topic", ExchangeType::Topic),
    ("amq.headers", ExchangeType::Headers),
];

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Bytes,
    properties: MessageProperties,
    redelivered: bool,
}

struct ConsumerEntry {
    tag: String,
    channel_id: u64,
    no_ack: bool,
    exclusive: bool,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
}

struct VhostState {
    exchanges: BTreeMap<String, ExchangeSpec>,
    queues: BTreeMap<String, QueueState>,
    bindings: Vec<BindingSpec>,
}

impl VhostState {
    fn new() -> Self {
        let exchanges = PREDECLARED_EXCHANGES
            .iter()
            .map(|(name, kind)| {
                (
                    name.to_string(),
                    ExchangeSpec {
                        name: name.to_string(),
                        kind: *kind,
                        durable: true,
                        auto_delete: false,
                        internal: false,
                        arguments: Default::default(),
                    },
                )
            })
            .collect();

        Self {
            exchanges,
            queues: BTreeMap::new(),
            bindings: Vec::new(),
        }
    }
}

struct ConnectionRecord {
    vhost: String,
    closed: bool,
}

struct ChannelRecord {
    connection_id: u64,
    vhost: String,
    closed: bool,
    prefetch: u16,
    publish_sequence: u64,
}

struct Unacked {
    channel_id: u64,
    vhost: String,
    queue: String,
    message: StoredMessage,
}

struct State {
    user: String,
    password: String,
    vhosts: BTreeMap<String, VhostState>,
    connections: HashMap<u64, ConnectionRecord>,
    channels: HashMap<u64, ChannelRecord>,
    unacked: BTreeMap<u64, Unacked>,
    next_id: u64,
    failing_connects: u32,
    connect_attempts: u32,
    latency: Duration,
    management_calls: Vec<String>,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Vhost of a usable channel
    fn channel_vhost(&self, channel_id: u64) -> Result<String, TransportError> {
        let channel = self
            .channels
            .get(&channel_id)
            .filter(|c| !c.closed)
            .ok_or(TransportError::ChannelClosed)?;
        let connection_open = self
            .connections
            .get(&channel.connection_id)
            .is_some_and(|c| !c.closed);
        if !connection_open || !self.vhosts.contains_key(&channel.vhost) {
            return Err(TransportError::ConnectionClosed);
        }
        Ok(channel.vhost.clone())
    }

    fn vhost_mut(&mut self, channel_id: u64) -> Result<(String, &mut VhostState), TransportError> {
        let name = self.channel_vhost(channel_id)?;
        let vhost = self
            .vhosts
            .get_mut(&name)
            .ok_or(TransportError::ConnectionClosed)?;
        Ok((name, vhost))
    }

    fn authorized(&self, endpoint: &ManagementEndpoint) -> bool {
        endpoint.user == self.user && endpoint.password == self.password
    }

    /// Hand ready messages to consumers until one side runs out
    fn dispatch(&mut self, vhost: &str, queue: &str) {
        loop {
            let Some(state) = self
                .vhosts
                .get_mut(vhost)
                .and_then(|v| v.queues.get_mut(queue))
            else {
                return;
            };
            if state.ready.is_empty() || state.consumers.is_empty() {
                return;
            }

            let count = state.consumers.len();
            let chosen = (0..count)
                .map(|offset| (state.next_consumer + offset) % count)
                .find(|&index| {
                    let consumer = &state.consumers[index];
                    consumer.no_ack
                        || has_capacity(&self.channels, &self.unacked, consumer.channel_id)
                });
            let Some(index) = chosen else { return };
            let Some(message) = state.ready.pop_front() else {
                return;
            };

            self.next_id += 1;
            let delivery_tag = self.next_id;
            state.next_consumer = (index + 1) % count;

            let consumer = &state.consumers[index];
            let delivery = Delivery {
                consumer_tag: consumer.tag.clone(),
                delivery_tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                body: message.body.clone(),
                properties: message.properties.clone(),
            };

            if consumer.sender.send(delivery).is_err() {
                state.ready.push_front(message);
                state.consumers.remove(index);
                state.next_consumer = 0;
                continue;
            }
            if !consumer.no_ack {
                self.unacked.insert(
                    delivery_tag,
                    Unacked {
                        channel_id: consumer.channel_id,
                        vhost: vhost.to_string(),
                        queue: queue.to_string(),
                        message,
                    },
                );
            }
        }
    }

    fn requeue(&mut self, unacked: Unacked) {
        let Unacked {
            vhost,
            queue,
            mut message,
            ..
        } = unacked;
        let Some(state) = self
            .vhosts
            .get_mut(&vhost)
            .and_then(|v| v.queues.get_mut(&queue))
        else {
            return;
        };
        message.redelivered = true;
        state.ready.push_front(message);
        self.dispatch(&vhost, &queue);
    }

    fn close_channel(&mut self, channel_id: u64) {
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            return;
        };
        if channel.closed {
            return;
        }
        channel.closed = true;
        let vhost = channel.vhost.clone();

        if let Some(state) = self.vhosts.get_mut(&vhost) {
            for queue in state.queues.values_mut() {
                queue.consumers.retain(|c| c.channel_id != channel_id);
                queue.next_consumer = 0;
            }
        }

        let pending: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in pending {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.requeue(unacked);
            }
        }
    }

    fn close_connection(&mut self, connection_id: u64) {
        match self.connections.get_mut(&connection_id) {
            Some(connection) if !connection.closed => connection.closed = true,
            _ => return,
        }
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection_id == connection_id && !c.closed)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }
    }

    fn publish(
        &mut self,
        channel_id: u64,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: &MessageProperties,
    ) -> Result<Confirmation, TransportError> {
        let (vhost_name, vhost) = self.vhost_mut(channel_id)?;

        let targets: Vec<String> = if exchange.is_empty() {
            vhost
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect()
        } else {
            if !vhost.exchanges.contains_key(exchange) {
                return Err(TransportError::NotFound {
                    kind: ObjectKind::Exchange,
                    name: exchange.to_string(),
                });
            }
            route(vhost, exchange, routing_key, &properties.headers)
                .into_iter()
                .collect()
        };

        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body,
            properties: properties.clone(),
            redelivered: false,
        };
        for queue in &targets {
            if let Some(state) = vhost.queues.get_mut(queue) {
                state.ready.push_back(message.clone());
            }
        }
        for queue in &targets {
            self.dispatch(&vhost_name, queue);
        }

        let sequence = match self.channels.get_mut(&channel_id) {
            Some(channel) => {
                channel.publish_sequence += 1;
                channel.publish_sequence
            }
            None => 0,
        };
        Ok(Confirmation {
            sequence,
            routed: !targets.is_empty(),
        })
    }
}

fn has_capacity(
    channels: &HashMap<u64, ChannelRecord>,
    unacked: &BTreeMap<u64, Unacked>,
    channel_id: u64,
) -> bool {
    let prefetch = channels.get(&channel_id).map_or(0, |c| c.prefetch);
    prefetch == 0
        || unacked.values().filter(|u| u.channel_id == channel_id).count() < usize::from(prefetch)
}

/// Queues reached from `exchange`, following exchange-to-exchange bindings
fn route(
    vhost: &VhostState,
    exchange: &str,
    routing_key: &str,
    headers: &BTreeMap<String, String>,
) -> BTreeSet<String> {
    let mut queues = BTreeSet::new();
    let mut visited = HashSet::new();
    let mut pending = vec![exchange.to_string()];

    while let Some(source) = pending.pop() {
        if !visited.insert(source.clone()) {
            continue;
        }
        let Some(spec) = vhost.exchanges.get(&source) else {
            continue;
        };
        for binding in vhost.bindings.iter().filter(|b| b.source == source) {
            if !binding_matches(spec.kind, binding, routing_key, headers) {
                continue;
            }
            match binding.destination_type {
                DestinationType::Queue => {
                    if vhost.queues.contains_key(&binding.destination) {
                        queues.insert(binding.destination.clone());
                    }
                }
                DestinationType::Exchange => pending.push(binding.destination.clone()),
            }
        }
    }
    queues
}

fn binding_matches(
    kind: ExchangeType,
    binding: &BindingSpec,
    routing_key: &str,
    headers: &BTreeMap<String, String>,
) -> bool {
    match kind {
        ExchangeType::Direct => binding.binding_key == routing_key,
        ExchangeType::Fanout => true,
        ExchangeType::Topic => topic_matches(&binding.binding_key, routing_key),
        ExchangeType::Headers => headers_match(binding, headers),
    }
}

fn words(s: &str) -> Vec<&str> {
    if s.is_empty() {
        Vec::new()
    } else {
        s.split('.').collect()
    }
}

/// `*` matches exactly one word, `#` zero or more
pub(crate) fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    words_match(&words(pattern), &words(routing_key))
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && words_match(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && words_match(rest, &key[1..]),
    }
}

fn headers_match(binding: &BindingSpec, headers: &BTreeMap<String, String>) -> bool {
    let match_any = binding
        .arguments
        .get("x-match")
        .and_then(|v| v.as_str())
        .is_some_and(|mode| mode == "any");

    let mut expected = binding
        .arguments
        .iter()
        .filter(|(key, _)| !key.starts_with("x-"));
    let matches = |(key, value): (&String, &serde_json::Value)| {
        headers.get(key).is_some_and(|actual| match value {
            serde_json::Value::String(s) => s == actual,
            other => other.to_string() == *actual,
        })
    };

    if match_any {
        expected.any(matches)
    } else {
        expected.all(matches)
    }
}

/// Shared in-process broker; clones observe the same state
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("InMemoryBroker")
            .field("vhosts", &state.vhosts.keys().collect::<Vec<_>>())
            .field("connections", &state.connections.len())
            .finish()
    }
}

impl InMemoryBroker {
    /// A broker accepting the `guest`/`guest` credentials
    pub fn new() -> Self {
        Self::with_credentials("guest", "guest")
    }

    pub fn with_credentials(user: &str, password: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                user: user.to_string(),
                password: password.to_string(),
                vhosts: BTreeMap::new(),
                connections: HashMap::new(),
                channels: HashMap::new(),
                unacked: BTreeMap::new(),
                next_id: 0,
                failing_connects: 0,
                connect_attempts: 0,
                latency: Duration::ZERO,
                management_calls: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn delay(&self) {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    pub fn transport(&self) -> Arc<dyn AmqpTransport> {
        Arc::new(self.clone())
    }

    pub fn management(&self) -> Arc<dyn ManagementApi> {
        Arc::new(self.clone())
    }

    /// Create a vhost directly, bypassing the management API
    pub fn add_vhost(&self, name: &str) {
        self.lock()
            .vhosts
            .entry(name.to_string())
            .or_insert_with(VhostState::new);
    }

    /// Refuse the next `count` connection attempts
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().failing_connects = count;
    }

    /// Delay every channel operation by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    pub fn open_connections(&self, vhost: &str) -> usize {
        self.lock()
            .connections
            .values()
            .filter(|c| c.vhost == vhost && !c.closed)
            .count()
    }

    /// Management requests received so far, as `METHOD vhost`
    pub fn management_calls(&self) -> Vec<String> {
        self.lock().management_calls.clone()
    }

    pub fn has_vhost(&self, vhost: &str) -> bool {
        self.lock().vhosts.contains_key(vhost)
    }

    pub fn has_exchange(&self, vhost: &str, exchange: &str) -> bool {
        self.lock()
            .vhosts
            .get(vhost)
            .is_some_and(|v| v.exchanges.contains_key(exchange))
    }

    pub fn has_queue(&self, vhost: &str, queue: &str) -> bool {
        self.lock()
            .vhosts
            .get(vhost)
            .is_some_and(|v| v.queues.contains_key(queue))
    }

    pub fn has_binding(&self, vhost: &str, source: &str, destination: &str, key: &str) -> bool {
        self.lock().vhosts.get(vhost).is_some_and(|v| {
            v.bindings
                .iter()
                .any(|b| b.source == source && b.destination == destination && b.binding_key == key)
        })
    }

    pub fn binding_count(&self, vhost: &str) -> usize {
        self.lock()
            .vhosts
            .get(vhost)
            .map_or(0, |v| v.bindings.len())
    }

    /// Ready messages in a queue, `None` if it does not exist
    pub fn queue_depth(&self, vhost: &str, queue: &str) -> Option<usize> {
        self.lock()
            .vhosts
            .get(vhost)
            .and_then(|v| v.queues.get(queue))
            .map(|q| q.ready.len())
    }

    pub fn consumer_count(&self, vhost: &str, queue: &str) -> usize {
        self.lock()
            .vhosts
            .get(vhost)
            .and_then(|v| v.queues.get(queue))
            .map_or(0, |q| q.consumers.len())
    }

    /// Deliveries from `queue` awaiting ack or nack
    pub fn unacked_count(&self, vhost: &str, queue: &str) -> usize {
        self.lock()
            .unacked
            .values()
            .filter(|u| u.vhost == vhost && u.queue == queue)
            .count()
    }

    /// Place a text message directly on a queue, as if published to the default exchange
    pub fn enqueue(&self, vhost: &str, queue: &str, body: &str) {
        let mut state = self.lock();
        let Some(target) = state
            .vhosts
            .get_mut(vhost)
            .and_then(|v| v.queues.get_mut(queue))
        else {
            return;
        };
        target.ready.push_back(StoredMessage {
            exchange: String::new(),
            routing_key: queue.to_string(),
            body: Bytes::from(body.to_string()),
            properties: MessageProperties {
                content_type: Some("text/plain".to_string()),
                ..Default::default()
            },
            redelivered: false,
        });
        state.dispatch(vhost, queue);
    }
}

#[async_trait]
impl AmqpTransport for InMemoryBroker {
    async fn connect(
        &self,
        url: &ConnectionUrl,
    ) -> Result<Arc<dyn AmqpConnection>, TransportError> {
        let id = {
            let mut state = self.lock();
            state.connect_attempts += 1;

            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(TransportError::ConnectionRefused(format!(
                    "{}:{}",
                    url.hostname(),
                    url.port()
                )));
            }
            if url.user() != state.user || url.password() != state.password {
                return Err(TransportError::Authentication(
                    "Login was refused using authentication mechanism PLAIN".to_string(),
                ));
            }
            if !state.vhosts.contains_key(url.vhost()) {
                return Err(TransportError::NotAllowed(format!(
                    "vhost {} not found",
                    url.vhost()
                )));
            }

            let id = state.next_id();
            state.connections.insert(
                id,
                ConnectionRecord {
                    vhost: url.vhost().to_string(),
                    closed: false,
                },
            );
            id
        };

        Ok(Arc::new(InMemoryConnection {
            id,
            broker: self.clone(),
        }))
    }
}

#[async_trait]
impl ManagementApi for InMemoryBroker {
    async fn get_vhost(
        &self,
        endpoint: &ManagementEndpoint,
        vhost: &str,
    ) -> Result<u16, ManagementError> {
        let mut state = self.lock();
        state.management_calls.push(format!("GET {vhost}"));
        if !state.authorized(endpoint) {
            return Ok(401);
        }
        Ok(if state.vhosts.contains_key(vhost) { 200 } else { 404 })
    }

    async fn put_vhost(
        &self,
        endpoint: &ManagementEndpoint,
        vhost: &str,
    ) -> Result<u16, ManagementError> {
        let mut state = self.lock();
        state.management_calls.push(format!("PUT {vhost}"));
        if !state.authorized(endpoint) {
            return Ok(401);
        }
        if state.vhosts.contains_key(vhost) {
            return Ok(204);
        }
        state.vhosts.insert(vhost.to_string(), VhostState::new());
        Ok(201)
    }

    async fn delete_vhost(
        &self,
        endpoint: &ManagementEndpoint,
        vhost: &str,
    ) -> Result<u16, ManagementError> {
        let mut state = self.lock();
        state.management_calls.push(format!("DELETE {vhost}"));
        if !state.authorized(endpoint) {
            return Ok(401);
        }
        if state.vhosts.remove(vhost).is_none() {
            return Ok(404);
        }

        let connections: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, c)| c.vhost == vhost && !c.closed)
            .map(|(id, _)| *id)
            .collect();
        for connection in connections {
            state.close_connection(connection);
        }
        Ok(204)
    }
}

struct InMemoryConnection {
    id: u64,
    broker: InMemoryBroker,
}

#[async_trait]
impl AmqpConnection for InMemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, TransportError> {
        let id = {
            let mut state = self.broker.lock();
            let vhost = match state.connections.get(&self.id) {
                Some(connection) if !connection.closed => connection.vhost.clone(),
                _ => return Err(TransportError::ConnectionClosed),
            };
            let id = state.next_id();
            state.channels.insert(
                id,
                ChannelRecord {
                    connection_id: self.id,
                    vhost,
                    closed: false,
                    prefetch: 0,
                    publish_sequence: 0,
                },
            );
            id
        };

        Ok(Arc::new(InMemoryChannel {
            id,
            broker: self.broker.clone(),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.lock().close_connection(self.id);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.broker
            .lock()
            .connections
            .get(&self.id)
            .map_or(true, |c| c.closed)
    }
}

struct InMemoryChannel {
    id: u64,
    broker: InMemoryBroker,
}

impl InMemoryChannel {
    fn check(
        &self,
        kind: ObjectKind,
        name: &str,
        exists: impl Fn(&VhostState) -> bool,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        let (_, vhost) = state.vhost_mut(self.id)?;
        if exists(vhost) {
            Ok(())
        } else {
            Err(TransportError::NotFound {
                kind,
                name: name.to_string(),
            })
        }
    }
}

#[async_trait]
impl AmqpChannel for InMemoryChannel {
    async fn assert_exchange(&self, spec: &ExchangeSpec) -> Result<(), TransportError> {
        self.broker.delay().await;
        let mut state = self.broker.lock();
        let (_, vhost) = state.vhost_mut(self.id)?;

        match vhost.exchanges.get(&spec.name) {
            Some(existing) => match spec.mismatch(existing) {
                Some(reason) => Err(TransportError::PreconditionFailed {
                    kind: ObjectKind::Exchange,
                    name: spec.name.clone(),
                    reason,
                }),
                None => Ok(()),
            },
            None => {
                vhost.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    async fn check_exchange(&self, name: &str) -> Result<(), TransportError> {
        self.broker.delay().await;
        self.check(ObjectKind::Exchange, name, |v| v.exchanges.contains_key(name))
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), TransportError> {
        self.broker.delay().await;
        let mut state = self.broker.lock();
        let (_, vhost) = state.vhost_mut(self.id)?;

        if vhost.exchanges.remove(name).is_some() {
            vhost.bindings.retain(|b| {
                b.source != name
                    && !(b.destination_type == DestinationType::Exchange && b.destination == name)
            });
        }
        Ok(())
    }

    async fn assert_queue(&self, spec: &QueueSpec) -> Result<(), TransportError> {
        self.broker.delay().await;
        let mut state = self.broker.lock();
        let (_, vhost) = state.vhost_mut(self.id)?;

        match vhost.queues.get(&spec.name) {
            Some(existing) => match spec.mismatch(&existing.spec) {
                Some(reason) => Err(TransportError::PreconditionFailed {
                    kind: ObjectKind::Queue,
                    name: spec.name.clone(),
                    reason,
                }),
                None => Ok(()),
            },
            None => {
                vhost.queues.insert(
                    spec.name.clone(),
                    QueueState {
                        spec: spec.clone(),
                        ready: VecDeque::new(),
                        consumers: Vec::new(),
                        next_consumer: 0,
                    },
                );
                Ok(())
            }
        }
    }

    async fn check_queue(&self, name: &str) -> Result<(), TransportError> {
        self.broker.delay().await;
        self.check(ObjectKind::Queue, name, |v| v.queues.contains_key(name))
    }

    async fn delete_queue(&self, name: &str) -> Result<(), TransportError> {
        self.broker.delay().await;
        let mut state = self.broker.lock();
        let (vhost_name, vhost) = state.vhost_mut(self.id)?;

        if vhost.queues.remove(name).is_some() {
            vhost
                .bindings
                .retain(|b| !(b.destination_type == DestinationType::Queue && b.destination == name));
            state
                .unacked
                .retain(|_, u| !(u.vhost == vhost_name && u.queue == name));
        }
        Ok(())
    }

    async fn purge_queue(&self, name: &str) -> Result<u32, TransportError> {
        self.broker.delay().await;
        let mut state = self.broker.lock();
        let (_, vhost) = state.vhost_mut(self.id)?;

        let queue = vhost
            .queues
            .get_mut(name)
            .ok_or_else(|| TransportError::NotFound {
                kind: ObjectKind::Queue,
                name: name.to_string(),
            })?;
        let purged = queue.ready.len();
        queue.ready.clear();
        Ok(u32::try_from(purged).unwrap_or(u32::MAX))
    }

    async fn bind(&self, binding: &BindingSpec) -> Result<(), TransportError> {
        self.broker.delay().await;
        let mut state = self.broker.lock();
        let (_, vhost) = state.vhost_mut(self.id)?;

        if !vhost.exchanges.contains_key(&binding.source) {
            return Err(TransportError::NotFound {
                kind: ObjectKind::Exchange,
                name: binding.source.clone(),
            });
        }
        let (kind, destination_exists) = match binding.destination_type {
            DestinationType::Queue => (
                ObjectKind::Queue,
                vhost.queues.contains_key(&binding.destination),
            ),
            DestinationType::Exchange => (
                ObjectKind::Exchange,
                vhost.exchanges.contains_key(&binding.destination),
            ),
        };
        if !destination_exists {
            return Err(TransportError::NotFound {
                kind,
                name: binding.destination.clone(),
            });
        }

        if !vhost.bindings.contains(binding) {
            vhost.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn unbind(&self, binding: &BindingSpec) -> Result<(), TransportError> {
        self.broker.delay().await;
        let mut state = self.broker.lock();
        let (_, vhost) = state.vhost_mut(self.id)?;
        vhost.bindings.retain(|b| b != binding);
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.broker.delay().await;
        let mut state = self.broker.lock();
        state.channel_vhost(self.id)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = count;
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: &MessageProperties,
        _mandatory: bool,
    ) -> Result<Confirmation, TransportError> {
        self.broker.delay().await;
        self.broker
            .lock()
            .publish(self.id, exchange, routing_key, body, properties)
    }

    async fn consume(
        &self,
        queue: &str,
        options: &ConsumeOptions,
    ) -> Result<Consumer, TransportError> {
        self.broker.delay().await;
        let mut state = self.broker.lock();
        let (vhost_name, _) = state.vhost_mut(self.id)?;
        let tag = match &options.consumer_tag {
            Some(tag) => tag.clone(),
            None => format!("amq.ctag-{}", state.next_id()),
        };

        let target = state
            .vhosts
            .get_mut(&vhost_name)
            .and_then(|v| v.queues.get_mut(queue))
            .ok_or_else(|| TransportError::NotFound {
                kind: ObjectKind::Queue,
                name: queue.to_string(),
            })?;
        let exclusive_conflict = target.consumers.iter().any(|c| c.exclusive)
            || (options.exclusive && !target.consumers.is_empty());
        if exclusive_conflict {
            return Err(TransportError::Other(format!(
                "ACCESS_REFUSED - queue '{queue}' in exclusive use"
            )));
        }

        let (sender, deliveries) = mpsc::unbounded_channel();
        target.consumers.push(ConsumerEntry {
            tag: tag.clone(),
            channel_id: self.id,
            no_ack: options.no_ack,
            exclusive: options.exclusive,
            sender,
        });
        state.dispatch(&vhost_name, queue);

        Ok(Consumer { tag, deliveries })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.broker.delay().await;
        let mut state = self.broker.lock();
        let (_, vhost) = state.vhost_mut(self.id)?;
        for queue in vhost.queues.values_mut() {
            let before = queue.consumers.len();
            queue
                .consumers
                .retain(|c| !(c.channel_id == self.id && c.tag == consumer_tag));
            if queue.consumers.len() != before {
                queue.next_consumer = 0;
            }
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.broker.delay().await;
        let mut state = self.broker.lock();
        state.channel_vhost(self.id)?;
        let unacked = take_unacked(&mut state, self.id, delivery_tag)?;
        // Freed prefetch capacity
        state.dispatch(&unacked.vhost, &unacked.queue);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.broker.delay().await;
        let mut state = self.broker.lock();
        state.channel_vhost(self.id)?;
        let unacked = take_unacked(&mut state, self.id, delivery_tag)?;
        if requeue {
            state.requeue(unacked);
        } else {
            state.dispatch(&unacked.vhost, &unacked.queue);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.lock().close_channel(self.id);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.broker.lock().channel_vhost(self.id).is_err()
    }
}

fn take_unacked(
    state: &mut State,
    channel_id: u64,
    delivery_tag: u64,
) -> Result<Unacked, TransportError> {
    match state.unacked.get(&delivery_tag) {
        Some(unacked) if unacked.channel_id == channel_id => {}
        _ => {
            return Err(TransportError::Other(format!(
                "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
            )))
        }
    }
    state
        .unacked
        .remove(&delivery_tag)
        .ok_or(TransportError::ChannelClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, ExchangeType};
    use serde_json::json;

    fn url(vhost: &str) -> ConnectionUrl {
        ConnectionUrl::build(vhost, &ConnectionConfig::default()).unwrap()
    }

    fn exchange(name: &str, kind: ExchangeType) -> ExchangeSpec {
        ExchangeSpec {
            name: name.to_string(),
            kind,
            durable: true,
            auto_delete: false,
            internal: false,
            arguments: Default::default(),
        }
    }

    fn queue(name: &str) -> QueueSpec {
        QueueSpec {
            name: name.to_string(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: Default::default(),
        }
    }

    fn binding(source: &str, destination: &str, key: &str) -> BindingSpec {
        BindingSpec {
            source: source.to_string(),
            destination: destination.to_string(),
            destination_type: DestinationType::Queue,
            binding_key: key.to_string(),
            arguments: Default::default(),
        }
    }

    async fn channel(broker: &InMemoryBroker) -> Arc<dyn AmqpChannel> {
        broker.add_vhost("v1");
        let connection = broker.connect(&url("v1")).await.unwrap();
        connection.open_channel().await.unwrap()
    }

    async fn publish(channel: &Arc<dyn AmqpChannel>, exchange: &str, key: &str) -> bool {
        channel
            .publish(exchange, key, Bytes::from_static(b"x"), &MessageProperties::default(), false)
            .await
            .unwrap()
            .routed
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("a.*", "a.b"));
        assert!(!topic_matches("a.*", "a.b.c"));
        assert!(topic_matches("a.#", "a"));
        assert!(topic_matches("a.#", "a.b.c"));
        assert!(topic_matches("#", ""));
        assert!(topic_matches("#.c", "a.b.c"));
        assert!(topic_matches("*.b.*", "a.b.c"));
        assert!(!topic_matches("*", ""));
        assert!(topic_matches("", ""));
        assert!(!topic_matches("a.b", "a.c"));
    }

    #[tokio::test]
    async fn test_routing_by_exchange_type() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;

        channel.assert_queue(&queue("q1")).await.unwrap();
        channel.assert_queue(&queue("q2")).await.unwrap();
        channel.assert_exchange(&exchange("direct", ExchangeType::Direct)).await.unwrap();
        channel.assert_exchange(&exchange("fanout", ExchangeType::Fanout)).await.unwrap();
        channel.bind(&binding("direct", "q1", "k1")).await.unwrap();
        channel.bind(&binding("fanout", "q1", "")).await.unwrap();
        channel.bind(&binding("fanout", "q2", "")).await.unwrap();

        assert!(publish(&channel, "direct", "k1").await);
        assert!(!publish(&channel, "direct", "k2").await);
        assert!(publish(&channel, "fanout", "anything").await);
        assert!(publish(&channel, "", "q2").await);
        assert!(!publish(&channel, "", "missing").await);

        assert_eq!(broker.queue_depth("v1", "q1"), Some(2));
        assert_eq!(broker.queue_depth("v1", "q2"), Some(2));
    }

    #[tokio::test]
    async fn test_exchange_to_exchange_and_headers_routing() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;

        channel.assert_queue(&queue("q1")).await.unwrap();
        channel.assert_exchange(&exchange("front", ExchangeType::Fanout)).await.unwrap();
        channel.assert_exchange(&exchange("by-header", ExchangeType::Headers)).await.unwrap();
        channel
            .bind(&BindingSpec {
                destination_type: DestinationType::Exchange,
                ..binding("front", "by-header", "")
            })
            .await
            .unwrap();

        let mut arguments = crate::config::Arguments::new();
        arguments.insert("x-match".to_string(), json!("all"));
        arguments.insert("region".to_string(), json!("eu"));
        channel
            .bind(&BindingSpec {
                arguments,
                ..binding("by-header", "q1", "")
            })
            .await
            .unwrap();

        let mut properties = MessageProperties::default();
        properties.headers.insert("region".to_string(), "eu".to_string());
        let routed = channel
            .publish("front", "", Bytes::from_static(b"x"), &properties, false)
            .await
            .unwrap();
        assert!(routed.routed);
        assert!(!publish(&channel, "front", "").await);
        assert_eq!(broker.queue_depth("v1", "q1"), Some(1));
    }

    #[tokio::test]
    async fn test_redeclaration_with_different_settings_conflicts() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;

        channel.assert_queue(&queue("q1")).await.unwrap();
        channel.assert_queue(&queue("q1")).await.unwrap();
        let error = channel
            .assert_queue(&QueueSpec {
                durable: false,
                ..queue("q1")
            })
            .await
            .unwrap_err();
        assert!(matches!(error, TransportError::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn test_round_robin_and_requeue() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;
        channel.assert_queue(&queue("q1")).await.unwrap();

        let mut first = channel.consume("q1", &ConsumeOptions::default()).await.unwrap();
        let mut second = channel.consume("q1", &ConsumeOptions::default()).await.unwrap();
        broker.enqueue("v1", "q1", "a");
        broker.enqueue("v1", "q1", "b");

        let a = first.deliveries.recv().await.unwrap();
        let b = second.deliveries.recv().await.unwrap();
        assert_eq!(a.body, Bytes::from_static(b"a"));
        assert_eq!(b.body, Bytes::from_static(b"b"));
        assert_eq!(broker.unacked_count("v1", "q1"), 2);

        channel.ack(a.delivery_tag).await.unwrap();
        channel.cancel(&second.tag).await.unwrap();
        channel.nack(b.delivery_tag, true).await.unwrap();

        let redelivered = first.deliveries.recv().await.unwrap();
        assert!(redelivered.redelivered);
        assert_eq!(redelivered.body, Bytes::from_static(b"b"));
        assert!(second.deliveries.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_closing_channel_requeues_unacked() {
        let broker = InMemoryBroker::new();
        let channel = channel(&broker).await;
        channel.assert_queue(&queue("q1")).await.unwrap();

        let mut consumer = channel.consume("q1", &ConsumeOptions::default()).await.unwrap();
        broker.enqueue("v1", "q1", "a");
        consumer.deliveries.recv().await.unwrap();

        channel.close().await.unwrap();
        assert!(channel.is_closed());
        assert_eq!(broker.queue_depth("v1", "q1"), Some(1));
        assert_eq!(broker.consumer_count("v1", "q1"), 0);
        assert!(matches!(
            channel.check_queue("q1").await,
            Err(TransportError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_connect_failures() {
        let broker = InMemoryBroker::new();
        assert!(matches!(
            broker.connect(&url("v1")).await.err().unwrap(),
            TransportError::NotAllowed(_)
        ));

        broker.add_vhost("v1");
        let wrong = ConnectionConfig {
            password: "nope".to_string(),
            ..Default::default()
        };
        let wrong = ConnectionUrl::build("v1", &wrong).unwrap();
        assert!(matches!(
            broker.connect(&wrong).await.err().unwrap(),
            TransportError::Authentication(_)
        ));
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_management_status_codes() {
        let broker = InMemoryBroker::new();
        let endpoint = ManagementEndpoint::from_config(&ConnectionConfig::default());

        assert_eq!(broker.get_vhost(&endpoint, "v1").await.unwrap(), 404);
        assert_eq!(broker.put_vhost(&endpoint, "v1").await.unwrap(), 201);
        assert_eq!(broker.put_vhost(&endpoint, "v1").await.unwrap(), 204);
        assert_eq!(broker.get_vhost(&endpoint, "v1").await.unwrap(), 200);

        let connection = broker.connect(&url("v1")).await.unwrap();
        assert_eq!(broker.delete_vhost(&endpoint, "v1").await.unwrap(), 204);
        assert!(connection.is_closed());
        assert_eq!(broker.delete_vhost(&endpoint, "v1").await.unwrap(), 404);

        let stranger = ManagementEndpoint {
            password: "wrong".to_string(),
            ..endpoint
        };
        assert_eq!(broker.get_vhost(&stranger, "v1").await.unwrap(), 401);
        assert_eq!(
            broker.management_calls(),
            vec!["GET v1", "PUT v1", "PUT v1", "GET v1", "DELETE v1", "DELETE v1", "GET v1"]
        );
    }
}
