use crate::config::{BrokerConfig, PublishOptions};
use crate::error::{BrokerError, BrokerResult};
use crate::topology::ResolvedTopology;
use serde::Serialize;
use std::collections::HashSet;

/// Where a publication sends messages, by physical name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "name", rename_all = "lowercase")]
pub enum PublicationTarget {
    Exchange(String),
    Queue(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedPublication {
    pub name: String,
    pub vhost: String,
    pub target: PublicationTarget,
    pub routing_key: String,
    pub options: PublishOptions,
    /// Synthesized for a declared exchange or queue rather than configured
    pub auto_created: bool,
}

impl ResolvedPublication {
    /// Exchange and routing key to publish with
    ///
    /// Queue targets go through the default exchange keyed by the queue
    /// name, so a routing key override only applies to exchange targets.
    pub fn destination(&self, routing_key: Option<&str>) -> (&str, String) {
        match &self.target {
            PublicationTarget::Exchange(exchange) => (
                exchange.as_str(),
                routing_key.unwrap_or(&self.routing_key).to_string(),
            ),
            PublicationTarget::Queue(queue) => ("", queue.clone()),
        }
    }
}

/// Publications by name, explicit entries first
#[derive(Debug, Clone, Default)]
pub struct PublicationRegistry {
    entries: Vec<ResolvedPublication>,
}

impl PublicationRegistry {
    pub fn build(config: &BrokerConfig, topology: &ResolvedTopology) -> Self {
        let mut entries = Vec::new();
        let mut taken = HashSet::new();

        for (vhost_config, vhost) in config.vhosts.iter().zip(topology.vhosts()) {
            for publication in &vhost_config.publications {
                let target = match (&publication.exchange, &publication.queue) {
                    (_, Some(queue)) => PublicationTarget::Queue(vhost.qualify(queue)),
                    (Some(exchange), None) => PublicationTarget::Exchange(vhost.qualify(exchange)),
                    (None, None) => continue,
                };
                taken.insert(publication.name.clone());
                entries.push(ResolvedPublication {
                    name: publication.name.clone(),
                    vhost: vhost.name.clone(),
                    target,
                    routing_key: publication.routing_key.clone(),
                    options: publication.options.clone(),
                    auto_created: false,
                });
            }
        }

        for vhost in topology.vhosts().iter().filter(|v| !v.mode.deletes()) {
            let exchanges = vhost
                .exchanges
                .iter()
                .filter(|e| !e.mode.deletes())
                .map(|e| (&e.logical_name, PublicationTarget::Exchange(e.spec.name.clone())));
            let queues = vhost
                .queues
                .iter()
                .filter(|q| !q.mode.deletes())
                .map(|q| (&q.logical_name, PublicationTarget::Queue(q.spec.name.clone())));

            for (logical_name, target) in exchanges.chain(queues) {
                let name = format!("{}/{}", vhost.name, logical_name);
                if !taken.insert(name.clone()) {
                    continue;
                }
                entries.push(ResolvedPublication {
                    name,
                    vhost: vhost.name.clone(),
                    target,
                    routing_key: String::new(),
                    options: PublishOptions::default(),
                    auto_created: true,
                });
            }
        }

        Self { entries }
    }

    pub fn resolve(&self, name: &str) -> BrokerResult<&ResolvedPublication> {
        self.entries
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| BrokerError::unknown_publication(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedPublication> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
