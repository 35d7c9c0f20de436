use crate::config::{BrokerConfig, SubscribeOptions};
use crate::error::{BrokerError, BrokerResult};
use crate::topology::ResolvedTopology;
use serde::Serialize;
use std::collections::HashSet;
use tracing::warn;

const AUTO_CREATED_EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedSubscription {
    pub name: String,
    pub vhost: String,
    /// Physical queue name
    pub queue: String,
    pub prefetch: Option<u16>,
    pub options: SubscribeOptions,
    pub event_buffer: usize,
    /// Synthesized for a queue that has no explicit subscription of the same name
    pub auto_created: bool,
}

/// Subscriptions in activation order
///
/// Explicit subscriptions come first, by vhost then declaration order,
/// followed by auto-created ones by vhost then queue order. An auto-created
/// subscription is named after its queue, or `<vhost>/<queue>` when that
/// name is already used by another vhost.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionRegistry {
    entries: Vec<ResolvedSubscription>,
}

impl SubscriptionRegistry {
    pub fn build(config: &BrokerConfig, topology: &ResolvedTopology) -> Self {
        let mut entries = Vec::new();
        let mut taken = HashSet::new();
        let mut declared = HashSet::new();

        for (vhost_config, vhost) in config.vhosts.iter().zip(topology.vhosts()) {
            for subscription in &vhost_config.subscriptions {
                taken.insert(subscription.name.clone());
                declared.insert((vhost.name.clone(), subscription.name.clone()));
                entries.push(ResolvedSubscription {
                    name: subscription.name.clone(),
                    vhost: vhost.name.clone(),
                    queue: vhost.qualify(&subscription.queue),
                    prefetch: subscription.prefetch,
                    options: subscription.options.clone(),
                    event_buffer: subscription.event_buffer,
                    auto_created: false,
                });
            }
        }

        for vhost in topology.vhosts().iter().filter(|v| !v.mode.deletes()) {
            for queue in vhost.queues.iter().filter(|q| !q.mode.deletes()) {
                if declared.contains(&(vhost.name.clone(), queue.logical_name.clone())) {
                    continue;
                }
                // Queue names repeat across vhosts; later ones are vhost-qualified
                let name = if taken.contains(&queue.logical_name) {
                    format!("{}/{}", vhost.name, queue.logical_name)
                } else {
                    queue.logical_name.clone()
                };
                if !taken.insert(name.clone()) {
                    warn!(
                        "No subscription created for queue {} on vhost {}: name {} is taken",
                        queue.logical_name, vhost.name, name
                    );
                    continue;
                }
                entries.push(ResolvedSubscription {
                    name,
                    vhost: vhost.name.clone(),
                    queue: queue.spec.name.clone(),
                    prefetch: None,
                    options: SubscribeOptions::default(),
                    event_buffer: AUTO_CREATED_EVENT_BUFFER,
                    auto_created: true,
                });
            }
        }

        Self { entries }
    }

    pub fn resolve(&self, name: &str) -> BrokerResult<&ResolvedSubscription> {
        self.entries
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| BrokerError::unknown_subscription(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedSubscription> {
        self.entries.iter()
    }

    /// Entries accepted by `filter`, in activation order
    pub fn select<F>(&self, filter: F) -> Vec<&ResolvedSubscription>
    where
        F: Fn(&ResolvedSubscription) -> bool,
    {
        self.entries.iter().filter(|s| filter(s)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(toml: &str) -> SubscriptionRegistry {
        let config = BrokerConfig::from_toml_str(toml).unwrap();
        let topology = ResolvedTopology::resolve(&config).unwrap();
        SubscriptionRegistry::build(&config, &topology)
    }

    const CONFIG: &str = r#"
[[vhosts]]
name = "v1"
namespace = "ns"

[[vhosts.queues]]
name = "q1"

[[vhosts.queues]]
name = "q2"

[[vhosts.queues]]
name = "gone"
assert = false
delete = true

[[vhosts.subscriptions]]
name = "s1"
queue = "q1"
prefetch = 10

[[vhosts.subscriptions]]
name = "q2"
queue = "q2"
[vhosts.subscriptions.options]
no_ack = true

[[vhosts]]
name = "v2"

[[vhosts.queues]]
name = "q1"

[[vhosts.queues]]
name = "q3"
"#;

    #[test]
    fn test_explicit_subscriptions_precede_auto_created() {
        let registry = registry(CONFIG);
        let order: Vec<_> = registry
            .iter()
            .map(|s| (s.name.as_str(), s.vhost.as_str(), s.auto_created))
            .collect();

        assert_eq!(
            order,
            vec![
                ("s1", "v1", false),
                ("q2", "v1", false),
                ("q1", "v1", true),
                ("v2/q1", "v2", true),
                ("q3", "v2", true),
            ]
        );
    }

    #[test]
    fn test_repeated_queue_names_each_get_a_subscription() {
        let registry = registry(
            r#"
[[vhosts]]
name = "v1"
namespace = "a"

[[vhosts.queues]]
name = "q1"

[[vhosts]]
name = "v2"
namespace = "b"

[[vhosts.queues]]
name = "q1"
"#,
        );

        let v1 = registry.resolve("q1").unwrap();
        assert_eq!((v1.vhost.as_str(), v1.queue.as_str()), ("v1", "a:q1"));
        let v2 = registry.resolve("v2/q1").unwrap();
        assert_eq!((v2.vhost.as_str(), v2.queue.as_str()), ("v2", "b:q1"));
        assert!(v2.auto_created);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_resolves_physical_queue() {
        let registry = registry(CONFIG);
        let s1 = registry.resolve("s1").unwrap();
        assert_eq!(s1.queue, "ns:q1");
        assert_eq!(s1.prefetch, Some(10));

        let q3 = registry.resolve("q3").unwrap();
        assert_eq!(q3.queue, "q3");
        assert_eq!(q3.event_buffer, 1024);
    }

    #[test]
    fn test_select_preserves_order() {
        let registry = registry(CONFIG);
        let auto: Vec<_> = registry
            .select(|s| s.auto_created)
            .into_iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(auto, vec!["q1", "v2/q1", "q3"]);

        let none = registry.select(|_| false);
        assert!(none.is_empty());
    }

    #[test]
    fn test_unknown_subscription() {
        let registry = registry(CONFIG);
        assert!(matches!(
            registry.resolve("gone"),
            Err(BrokerError::UnknownSubscription(_))
        ));
    }
}
