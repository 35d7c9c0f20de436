//! Resolved broker topology
//!
//! [`ResolvedTopology::resolve`] turns a validated [`BrokerConfig`] into
//! per-vhost physical object specs with their provision modes. Namespaces
//! are resolved here, once, so the configuration itself is never touched.
//!
//! - [`plan`] - pure ordering of provisioning and teardown steps
//! - [`provisioner`] - executes plans against the broker

use crate::config::{
    Arguments, BrokerConfig, ConfigError, DestinationType, ExchangeType, ProvisionMode,
    VhostConfig,
};
use crate::management::ManagementEndpoint;
use crate::naming::Namespace;
use crate::transport::{ConnectionUrl, RetryPolicy};
use std::time::Duration;

pub mod plan;
pub mod provisioner;

pub use plan::{ProvisionStep, TeardownStep, TopologyPlan};
pub use provisioner::TopologyProvisioner;

/// Exchange as declared on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeType,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub arguments: Arguments,
}

impl ExchangeSpec {
    /// Describe the first setting that differs from `existing`, if any
    pub fn mismatch(&self, existing: &ExchangeSpec) -> Option<String> {
        if self.kind != existing.kind {
            return Some(format!(
                "inequivalent arg 'type' for exchange '{}': received '{}' but current is '{}'",
                self.name, self.kind, existing.kind
            ));
        }
        flag_mismatch("exchange", &self.name, "durable", self.durable, existing.durable)
            .or_else(|| {
                flag_mismatch(
                    "exchange",
                    &self.name,
                    "auto_delete",
                    self.auto_delete,
                    existing.auto_delete,
                )
            })
            .or_else(|| {
                flag_mismatch(
                    "exchange",
                    &self.name,
                    "internal",
                    self.internal,
                    existing.internal,
                )
            })
            .or_else(|| arguments_mismatch("exchange", &self.name, &self.arguments, &existing.arguments))
    }
}

/// Queue as declared on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: Arguments,
}

impl QueueSpec {
    /// Describe the first setting that differs from `existing`, if any
    pub fn mismatch(&self, existing: &QueueSpec) -> Option<String> {
        flag_mismatch("queue", &self.name, "durable", self.durable, existing.durable)
            .or_else(|| {
                flag_mismatch(
                    "queue",
                    &self.name,
                    "exclusive",
                    self.exclusive,
                    existing.exclusive,
                )
            })
            .or_else(|| {
                flag_mismatch(
                    "queue",
                    &self.name,
                    "auto_delete",
                    self.auto_delete,
                    existing.auto_delete,
                )
            })
            .or_else(|| arguments_mismatch("queue", &self.name, &self.arguments, &existing.arguments))
    }
}

/// Binding as declared on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct BindingSpec {
    pub source: String,
    pub destination: String,
    pub destination_type: DestinationType,
    pub binding_key: String,
    pub arguments: Arguments,
}

fn flag_mismatch(
    kind: &str,
    name: &str,
    flag: &str,
    requested: bool,
    current: bool,
) -> Option<String> {
    (requested != current).then(|| {
        format!(
            "inequivalent arg '{flag}' for {kind} '{name}': received '{requested}' but current is '{current}'"
        )
    })
}

fn arguments_mismatch(
    kind: &str,
    name: &str,
    requested: &Arguments,
    current: &Arguments,
) -> Option<String> {
    (requested != current).then(|| format!("inequivalent arguments for {kind} '{name}'"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeclaredExchange {
    pub logical_name: String,
    pub mode: ProvisionMode,
    pub spec: ExchangeSpec,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeclaredQueue {
    pub logical_name: String,
    pub mode: ProvisionMode,
    pub purge: bool,
    pub spec: QueueSpec,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeclaredBinding {
    pub name: String,
    pub mode: ProvisionMode,
    pub spec: BindingSpec,
}

/// Everything the engine needs to know about one vhost
#[derive(Debug, Clone)]
pub struct VhostTopology {
    pub name: String,
    pub namespace: Namespace,
    pub mode: ProvisionMode,
    pub connection_url: ConnectionUrl,
    pub management: ManagementEndpoint,
    pub retry: RetryPolicy,
    /// Bound for any single broker round-trip
    pub timeout: Duration,
    pub exchanges: Vec<DeclaredExchange>,
    pub queues: Vec<DeclaredQueue>,
    pub bindings: Vec<DeclaredBinding>,
}

impl VhostTopology {
    fn resolve(config: &VhostConfig) -> Result<Self, ConfigError> {
        let namespace = Namespace::resolve(config.namespace.as_ref());

        let exchanges = config
            .exchanges
            .iter()
            .map(|exchange| {
                Ok(DeclaredExchange {
                    logical_name: exchange.name.clone(),
                    mode: exchange.mode()?,
                    spec: ExchangeSpec {
                        name: namespace.qualify(&exchange.name),
                        kind: exchange.kind,
                        durable: exchange.options.durable,
                        auto_delete: exchange.options.auto_delete,
                        internal: exchange.options.internal,
                        arguments: exchange.options.arguments.clone(),
                    },
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let queues = config
            .queues
            .iter()
            .map(|queue| {
                Ok(DeclaredQueue {
                    logical_name: queue.name.clone(),
                    mode: queue.mode()?,
                    purge: queue.purge,
                    spec: QueueSpec {
                        name: namespace.qualify(&queue.name),
                        durable: queue.options.durable,
                        exclusive: queue.options.exclusive,
                        auto_delete: queue.options.auto_delete,
                        arguments: queue.options.arguments.clone(),
                    },
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let bindings = config
            .bindings
            .iter()
            .map(|binding| {
                Ok(DeclaredBinding {
                    name: binding.name.clone(),
                    mode: binding.mode()?,
                    spec: BindingSpec {
                        source: namespace.qualify(&binding.source),
                        destination: namespace.qualify(&binding.destination),
                        destination_type: binding.destination_type,
                        binding_key: binding.binding_key.clone(),
                        arguments: binding.arguments.clone(),
                    },
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Self {
            name: config.name.clone(),
            namespace,
            mode: config.mode()?,
            connection_url: ConnectionUrl::build(&config.name, &config.connection)?,
            management: ManagementEndpoint::from_config(&config.connection),
            retry: RetryPolicy::from(&config.connection.retry),
            timeout: Duration::from_millis(config.connection.timeout_ms),
            exchanges,
            queues,
            bindings,
        })
    }

    /// Physical name for a logical name in this vhost
    pub fn qualify(&self, name: &str) -> String {
        self.namespace.qualify(name)
    }

    pub fn exchange(&self, logical_name: &str) -> Option<&DeclaredExchange> {
        self.exchanges
            .iter()
            .find(|e| e.logical_name == logical_name)
    }

    pub fn queue(&self, logical_name: &str) -> Option<&DeclaredQueue> {
        self.queues.iter().find(|q| q.logical_name == logical_name)
    }
}

/// Topology of every configured vhost, in declaration order
#[derive(Debug, Clone, Default)]
pub struct ResolvedTopology {
    vhosts: Vec<VhostTopology>,
}

impl ResolvedTopology {
    pub fn resolve(config: &BrokerConfig) -> Result<Self, ConfigError> {
        let vhosts = config
            .vhosts
            .iter()
            .map(VhostTopology::resolve)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { vhosts })
    }

    pub fn vhosts(&self) -> &[VhostTopology] {
        &self.vhosts
    }

    pub fn vhost(&self, name: &str) -> Option<&VhostTopology> {
        self.vhosts.iter().find(|v| v.name == name)
    }
}
