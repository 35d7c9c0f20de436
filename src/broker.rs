//! The broker facade
//!
//! [`Broker`] is the composition root: [`Broker::create`] resolves the
//! configuration, provisions every vhost and only then hands back a broker
//! ready to publish and subscribe. When initialisation fails, the
//! [`InitializationError`] still carries the partially built broker so the
//! caller can run [`Broker::nuke`] against whatever was provisioned.
//!
//! ```no_run
//! use burrow::config::BrokerConfig;
//! use burrow::testing::InMemoryBroker;
//! use burrow::Broker;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BrokerConfig::from_toml_str(r#"
//! [[vhosts]]
//! name = "v1"
//! namespace = "demo"
//! assert = true
//!
//! [[vhosts.queues]]
//! name = "q1"
//! "#)?;
//!
//! let server = InMemoryBroker::new();
//! let broker = match Broker::create(&config, server.transport(), server.management()).await {
//!     Ok(broker) => broker,
//!     Err(e) => {
//!         let (error, partial) = e.into_parts();
//!         partial.nuke().await?;
//!         return Err(error.into());
//!     }
//! };
//!
//! let session = broker.subscribe("q1").await?;
//! let mut messages = session.messages();
//! broker.publish("v1/q1", "hello").await?;
//! let message = messages.recv().await?;
//! message.ack().await?;
//!
//! broker.nuke().await?;
//! # Ok(())
//! # }
//! ```

use crate::broker_span;
use crate::config::{BrokerConfig, PublishOptions};
use crate::error::{BrokerError, BrokerResult, InitializationError};
use crate::management::ManagementApi;
use crate::message::Payload;
use crate::observability::{BrokerMetrics, MetricsSnapshot};
use crate::registry::{
    PublicationRegistry, ResolvedPublication, ResolvedSubscription, SubscriptionRegistry,
};
use crate::session::{SessionManager, SubscriberSession};
use crate::topology::{ResolvedTopology, TopologyProvisioner};
use crate::transport::{
    AmqpConnection, AmqpTransport, ConnectionInfo, ConnectionManager, ConnectionState,
    MessageProperties,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Where the broker is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Running,
    /// Sessions cancelled and connections closed; topology left in place
    ShutDown,
    /// Sessions cancelled, topology deleted and connections closed
    Nuked,
}

/// Per-call adjustments to a publication's configured routing and options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOverrides {
    /// Replaces the publication's routing key; ignored for queue targets
    pub routing_key: Option<String>,
    /// Overlaid on the publication's options
    pub options: PublishOptions,
}

impl PublishOverrides {
    pub fn routing_key<S: Into<String>>(mut self, routing_key: S) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn options(mut self, options: PublishOptions) -> Self {
        self.options = options;
        self
    }
}

/// What the broker confirmed for one publish
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishConfirmation {
    pub publication: String,
    pub vhost: String,
    pub message_id: String,
    /// Physical exchange name; empty for the default exchange
    pub exchange: String,
    pub routing_key: String,
    /// Publisher-confirm sequence number on the vhost's publish channel
    pub sequence: u64,
    /// Whether at least one queue received the message
    pub routed: bool,
}

/// Handle to a provisioned broker topology; clones share the same broker
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    id: Uuid,
    config: BrokerConfig,
    topology: ResolvedTopology,
    connections: Arc<ConnectionManager>,
    provisioner: TopologyProvisioner,
    publications: PublicationRegistry,
    subscriptions: Arc<SubscriptionRegistry>,
    sessions: SessionManager,
    metrics: Arc<BrokerMetrics>,
    lifecycle: Mutex<Lifecycle>,
}

impl Broker {
    /// Validate `config`, provision every vhost and return the ready broker
    ///
    /// The configuration is cloned and never modified.
    pub async fn create(
        config: &BrokerConfig,
        transport: Arc<dyn AmqpTransport>,
        management: Arc<dyn ManagementApi>,
    ) -> Result<Broker, InitializationError> {
        let resolved = config
            .validate()
            .and_then(|()| ResolvedTopology::resolve(config))
            .map_err(BrokerError::from);
        let (topology, invalid) = match resolved {
            Ok(topology) => (topology, None),
            Err(e) => (ResolvedTopology::default(), Some(e)),
        };

        let broker = Self::assemble(config.clone(), topology, transport, management);
        if let Some(error) = invalid {
            error!("Rejected broker configuration: {}", error);
            return Err(InitializationError::new(error, broker));
        }

        let span = broker_span!(broker = %broker.inner.id, operation = "create");
        let provisioned = broker
            .inner
            .provisioner
            .provision(&broker.inner.topology)
            .instrument(span)
            .await;

        match provisioned {
            Ok(()) => {
                info!(
                    "Broker {} ready with {} vhosts, {} publications, {} subscriptions",
                    broker.inner.id,
                    broker.inner.topology.vhosts().len(),
                    broker.inner.publications.len(),
                    broker.inner.subscriptions.len()
                );
                Ok(broker)
            }
            Err(e) => {
                error!("Broker {} failed to initialise: {}", broker.inner.id, e);
                Err(InitializationError::new(e, broker))
            }
        }
    }

    fn assemble(
        config: BrokerConfig,
        topology: ResolvedTopology,
        transport: Arc<dyn AmqpTransport>,
        management: Arc<dyn ManagementApi>,
    ) -> Self {
        let metrics = Arc::new(BrokerMetrics::new());
        let connections = Arc::new(ConnectionManager::new(
            transport,
            topology.vhosts(),
            Arc::clone(&metrics),
        ));
        let provisioner =
            TopologyProvisioner::new(Arc::clone(&connections), management, Arc::clone(&metrics));
        let publications = PublicationRegistry::build(&config, &topology);
        let subscriptions = Arc::new(SubscriptionRegistry::build(&config, &topology));
        let sessions = SessionManager::new(
            Arc::clone(&connections),
            Arc::clone(&subscriptions),
            Arc::clone(&metrics),
        );

        Self {
            inner: Arc::new(BrokerInner {
                id: Uuid::new_v4(),
                config,
                topology,
                connections,
                provisioner,
                publications,
                subscriptions,
                sessions,
                metrics,
                lifecycle: Mutex::new(Lifecycle::Running),
            }),
        }
    }

    async fn ensure_running(&self) -> BrokerResult<()> {
        match *self.inner.lifecycle.lock().await {
            Lifecycle::Running => Ok(()),
            _ => Err(BrokerError::ShutDown),
        }
    }

    /// Publish through the named publication with its configured options
    pub async fn publish<P: Into<Payload>>(
        &self,
        name: &str,
        payload: P,
    ) -> BrokerResult<PublishConfirmation> {
        self.publish_with(name, payload, PublishOverrides::default())
            .await
    }

    /// Publish with a per-call routing key and options overlaid on the publication's
    pub async fn publish_with<P: Into<Payload>>(
        &self,
        name: &str,
        payload: P,
        overrides: PublishOverrides,
    ) -> BrokerResult<PublishConfirmation> {
        self.ensure_running().await?;
        let publication = self.inner.publications.resolve(name)?;

        let result = self.send(publication, payload.into(), &overrides).await;
        if result.is_err() {
            self.inner.metrics.publish_failed();
        }
        result
    }

    async fn send(
        &self,
        publication: &ResolvedPublication,
        payload: Payload,
        overrides: &PublishOverrides,
    ) -> BrokerResult<PublishConfirmation> {
        let (exchange, routing_key) = publication.destination(overrides.routing_key.as_deref());
        let options = publication.options.merged_with(&overrides.options);
        let content_type = overrides
            .options
            .content_type
            .clone()
            .or_else(|| payload.content_type.clone())
            .or_else(|| publication.options.content_type.clone());
        let message_id = Uuid::new_v4().to_string();
        let properties = MessageProperties {
            content_type,
            content_encoding: None,
            headers: options.headers.clone(),
            delivery_mode: options.persistent.map(|persistent| if persistent { 2 } else { 1 }),
            priority: options.priority,
            correlation_id: options.correlation_id.clone(),
            reply_to: options.reply_to.clone(),
            expiration: options.expiration.clone(),
            message_id: Some(message_id.clone()),
            timestamp: Some(chrono::Utc::now().timestamp()),
        };

        let vhost = &publication.vhost;
        let timeout = self.inner.connections.timeout(vhost)?;
        let channel = self.inner.connections.publish_channel(vhost).await?;
        let target = format!("{} via publication {}", display_exchange(exchange), publication.name);

        let started = Instant::now();
        let confirmation = match tokio::time::timeout(
            timeout,
            channel.publish(exchange, &routing_key, payload.body, &properties, options.mandatory),
        )
        .await
        {
            Ok(Ok(confirmation)) => confirmation,
            Ok(Err(e)) => return Err(BrokerError::channel("publish to", target, e)),
            Err(_) => return Err(BrokerError::timeout("publish to", target, timeout)),
        };
        self.inner
            .metrics
            .message_published(started.elapsed(), confirmation.routed);

        if !confirmation.routed {
            warn!(
                "Message {} published via {} was not routed to any queue",
                message_id, publication.name
            );
        } else {
            debug!(
                "Published {} to {} with routing key {}",
                message_id,
                display_exchange(exchange),
                routing_key
            );
        }

        Ok(PublishConfirmation {
            publication: publication.name.clone(),
            vhost: vhost.clone(),
            message_id,
            exchange: exchange.to_string(),
            routing_key,
            sequence: confirmation.sequence,
            routed: confirmation.routed,
        })
    }

    /// Activate the named subscription
    pub async fn subscribe(&self, name: &str) -> BrokerResult<SubscriberSession> {
        self.ensure_running().await?;
        self.inner.sessions.subscribe(name).await
    }

    /// Activate every subscription: explicit ones first, then auto-created
    pub async fn subscribe_all(&self) -> BrokerResult<Vec<SubscriberSession>> {
        self.subscribe_all_where(|_| true).await
    }

    /// Activate the subscriptions accepted by `filter`, keeping activation order
    pub async fn subscribe_all_where<F>(&self, filter: F) -> BrokerResult<Vec<SubscriberSession>>
    where
        F: Fn(&ResolvedSubscription) -> bool,
    {
        self.ensure_running().await?;
        self.inner.sessions.subscribe_all(filter).await
    }

    /// Cancel every active session, resolving once the broker has acknowledged each cancel
    pub async fn unsubscribe_all(&self) -> BrokerResult<()> {
        self.inner.sessions.unsubscribe_all().await
    }

    pub fn active_sessions(&self) -> Vec<SubscriberSession> {
        self.inner.sessions.active_sessions()
    }

    /// Open a new connection to `vhost`; the caller owns it and must close it
    pub async fn connect(&self, vhost: &str) -> BrokerResult<Arc<dyn AmqpConnection>> {
        self.ensure_running().await?;
        self.inner.connections.open_dedicated(vhost).await
    }

    /// One entry per vhost, in declaration order, with passwords redacted
    pub fn get_connections(&self) -> Vec<ConnectionInfo> {
        self.inner.connections.connection_urls()
    }

    /// Physical name of `name` in `vhost`
    pub fn fully_qualified_name(&self, vhost: &str, name: &str) -> BrokerResult<String> {
        self.inner
            .topology
            .vhost(vhost)
            .map(|v| v.qualify(name))
            .ok_or_else(|| BrokerError::unknown_vhost(vhost))
    }

    /// Cancel all sessions, delete every asserted object and vhost, then close all connections
    ///
    /// Every stage runs even if an earlier one fails; the first failure is
    /// returned. Calling it again is a no-op.
    pub async fn nuke(&self) -> BrokerResult<()> {
        let span = broker_span!(broker = %self.inner.id, operation = "nuke");
        async {
            let mut lifecycle = self.inner.lifecycle.lock().await;
            if *lifecycle == Lifecycle::Nuked {
                debug!("Broker already nuked");
                return Ok(());
            }
            *lifecycle = Lifecycle::Nuked;

            let mut first_error = None;
            if let Err(e) = self.inner.sessions.close().await {
                warn!("Failed to cancel sessions: {}", e);
                first_error.get_or_insert(e);
            }
            if let Err(e) = self.inner.provisioner.teardown(&self.inner.topology).await {
                warn!("Failed to tear down topology: {}", e);
                first_error.get_or_insert(e);
            }
            if let Err(e) = self.inner.connections.close_all().await {
                warn!("Failed to close connections: {}", e);
                first_error.get_or_insert(e);
            }

            info!("Broker {} nuked", self.inner.id);
            first_error.map_or(Ok(()), Err)
        }
        .instrument(span)
        .await
    }

    /// Cancel all sessions and close all connections, leaving the topology in place
    pub async fn shutdown(&self) -> BrokerResult<()> {
        let span = broker_span!(broker = %self.inner.id, operation = "shutdown");
        async {
            let mut lifecycle = self.inner.lifecycle.lock().await;
            if *lifecycle != Lifecycle::Running {
                return Ok(());
            }
            *lifecycle = Lifecycle::ShutDown;

            let sessions = self.inner.sessions.close().await;
            let connections = self.inner.connections.close_all().await;
            info!("Broker {} shut down", self.inner.id);
            sessions.and(connections)
        }
        .instrument(span)
        .await
    }

    /// Purge every asserted queue, returning the number of messages removed
    pub async fn purge(&self) -> BrokerResult<u64> {
        self.ensure_running().await?;
        self.inner.provisioner.purge(&self.inner.topology).await
    }

    pub fn connection_state(&self, vhost: &str) -> BrokerResult<ConnectionState> {
        self.inner.connections.state(vhost)
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        *self.inner.lifecycle.lock().await
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn publications(&self) -> impl Iterator<Item = &ResolvedPublication> {
        self.inner.publications.iter()
    }

    pub fn subscriptions(&self) -> impl Iterator<Item = &ResolvedSubscription> {
        self.inner.subscriptions.iter()
    }

    /// The configuration this broker was created from
    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub fn topology(&self) -> &ResolvedTopology {
        &self.inner.topology
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("id", &self.inner.id)
            .field(
                "vhosts",
                &self
                    .inner
                    .topology
                    .vhosts()
                    .iter()
                    .map(|v| v.name.as_str())
                    .collect::<Vec<_>>(),
            )
            .field("active_sessions", &self.inner.sessions.active_count())
            .finish()
    }
}

fn display_exchange(exchange: &str) -> &str {
    if exchange.is_empty() {
        "(default exchange)"
    } else {
        exchange
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryBroker;
    use std::time::Duration;

    const CONFIG: &str = r#"
[[vhosts]]
name = "v1"
namespace = "ns"
assert = true

[[vhosts.exchanges]]
name = "e1"

[[vhosts.queues]]
name = "q1"

[[vhosts.bindings]]
name = "b1"
source = "e1"
destination = "q1"
binding_key = "orders.#"

[[vhosts.publications]]
name = "p1"
exchange = "e1"
routing_key = "orders.created"
[vhosts.publications.options]
persistent = true
"#;

    async fn broker(server: &InMemoryBroker) -> Broker {
        let config = BrokerConfig::from_toml_str(CONFIG).unwrap();
        Broker::create(&config, server.transport(), server.management())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_publish_sets_message_properties() {
        let server = InMemoryBroker::new();
        let broker = broker(&server).await;
        let session = broker.subscribe("q1").await.unwrap();
        let mut messages = session.messages();

        let confirmation = broker.publish("p1", "hello").await.unwrap();
        assert_eq!(confirmation.exchange, "ns:e1");
        assert_eq!(confirmation.routing_key, "orders.created");
        assert!(confirmation.routed);

        let message = tokio::time::timeout(Duration::from_secs(1), messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.message_id(), Some(confirmation.message_id.as_str()));
        assert_eq!(message.content_type(), Some("text/plain"));
        assert!(message.properties.is_persistent());
        assert!(message.properties.timestamp.is_some());
    }

    #[tokio::test]
    async fn test_routing_key_override() {
        let server = InMemoryBroker::new();
        let broker = broker(&server).await;

        let unrouted = broker
            .publish_with("p1", "x", PublishOverrides::default().routing_key("invoices.paid"))
            .await
            .unwrap();
        assert!(!unrouted.routed);
        assert_eq!(server.queue_depth("v1", "ns:q1"), Some(0));
        assert_eq!(broker.metrics().publishing.unroutable, 1);
    }

    #[tokio::test]
    async fn test_unknown_publication() {
        let server = InMemoryBroker::new();
        let broker = broker(&server).await;
        assert!(matches!(
            broker.publish("nope", "x").await,
            Err(BrokerError::UnknownPublication(_))
        ));
    }

    #[tokio::test]
    async fn test_operations_after_shutdown_are_rejected() {
        let server = InMemoryBroker::new();
        let broker = broker(&server).await;

        broker.shutdown().await.unwrap();
        broker.shutdown().await.unwrap();
        assert_eq!(broker.lifecycle().await, Lifecycle::ShutDown);
        assert!(matches!(
            broker.publish("p1", "x").await,
            Err(BrokerError::ShutDown)
        ));
        assert!(matches!(
            broker.subscribe("q1").await,
            Err(BrokerError::ShutDown)
        ));
        assert!(server.has_queue("v1", "ns:q1"));
        assert_eq!(server.open_connections("v1"), 0);

        // Topology survives shutdown, nuke still removes it
        broker.nuke().await.unwrap();
        assert!(!server.has_queue("v1", "ns:q1"));
        assert!(!server.has_vhost("v1"));
    }

    #[tokio::test]
    async fn test_fully_qualified_name() {
        let server = InMemoryBroker::new();
        let broker = broker(&server).await;
        assert_eq!(broker.fully_qualified_name("v1", "q1").unwrap(), "ns:q1");
        assert!(matches!(
            broker.fully_qualified_name("v9", "q1"),
            Err(BrokerError::UnknownVhost(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_still_yields_partial_broker() {
        let server = InMemoryBroker::new();
        let mut config = BrokerConfig::from_toml_str(CONFIG).unwrap();
        config.vhosts[0].subscriptions.push(crate::config::SubscriptionConfig {
            name: "s1".to_string(),
            queue: "missing".to_string(),
            prefetch: None,
            options: Default::default(),
            event_buffer: 16,
        });

        let error = Broker::create(&config, server.transport(), server.management())
            .await
            .unwrap_err();
        assert!(matches!(error.error(), BrokerError::Config(_)));
        error.broker().nuke().await.unwrap();
        assert!(server.management_calls().is_empty());
    }
}
