//! Burrow - declarative AMQP broker topology
//!
//! Describe vhosts, exchanges, queues, bindings, publications and
//! subscriptions in one configuration tree; [`Broker::create`] provisions
//! them and hands back a single object to publish and subscribe through.
//!
//! # Overview
//!
//! - [`config`] - the TOML configuration tree and its validation
//! - [`topology`] - resolved physical names, provisioning plans and the provisioner
//! - [`transport`] - the wire-protocol seam and per-vhost connection management
//! - [`management`] - the HTTP management API client used for vhost operations
//! - [`registry`] - named publications and subscriptions
//! - [`session`] - live subscriber sessions
//! - [`testing`] - an in-process broker implementing both seams
//!
//! # Quick Start
//!
//! ```rust
//! use burrow::config::BrokerConfig;
//! use burrow::testing::InMemoryBroker;
//! use burrow::Broker;
//!
//! # tokio_test::block_on(async {
//! let config = BrokerConfig::from_toml_str(r#"
//! [[vhosts]]
//! name = "v1"
//! namespace = "test"
//! assert = true
//!
//! [[vhosts.exchanges]]
//! name = "e1"
//!
//! [[vhosts.queues]]
//! name = "q1"
//!
//! [[vhosts.bindings]]
//! name = "b1"
//! source = "e1"
//! destination = "q1"
//! binding_key = "foo"
//!
//! [[vhosts.publications]]
//! name = "p1"
//! exchange = "e1"
//! routing_key = "foo"
//! "#).unwrap();
//!
//! let server = InMemoryBroker::new();
//! let broker = Broker::create(&config, server.transport(), server.management())
//!     .await
//!     .unwrap();
//! assert_eq!(broker.fully_qualified_name("v1", "q1").unwrap(), "test:q1");
//!
//! let session = broker.subscribe("q1").await.unwrap();
//! let mut messages = session.messages();
//! broker.publish("p1", "hello").await.unwrap();
//! assert_eq!(messages.recv().await.unwrap().text(), Some("hello"));
//!
//! broker.nuke().await.unwrap();
//! # });
//! ```

pub mod broker;
pub mod config;
pub mod error;
pub mod management;
pub mod message;
pub mod naming;
pub mod observability;
pub mod registry;
pub mod session;
pub mod testing;
pub mod topology;
pub mod transport;

pub use broker::{Broker, Lifecycle, PublishConfirmation, PublishOverrides};
pub use config::BrokerConfig;
pub use error::{BrokerError, BrokerResult, InitializationError, ObjectKind};
pub use message::{Message, Payload};
pub use session::SubscriberSession;
