//! Pure provisioning and teardown ordering
//!
//! A [`TopologyPlan`] never touches the broker. It lists, for one vhost,
//! the steps the provisioner executes: vhost management operation, eager
//! connect, exchanges, queues, bindings. Teardown runs queues then
//! exchanges in reverse declaration order and finishes with the vhost.

use super::{DeclaredBinding, DeclaredExchange, DeclaredQueue, VhostTopology};
use crate::config::ProvisionMode;
use std::fmt;

/// One provisioning operation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProvisionStep<'a> {
    AssertVhost(&'a str),
    CheckVhost(&'a str),
    DeleteVhost(&'a str),
    Connect(&'a str),
    AssertExchange(&'a DeclaredExchange),
    CheckExchange(&'a DeclaredExchange),
    DeleteExchange(&'a DeclaredExchange),
    AssertQueue(&'a DeclaredQueue),
    CheckQueue(&'a DeclaredQueue),
    PurgeQueue(&'a DeclaredQueue),
    DeleteQueue(&'a DeclaredQueue),
    Bind(&'a DeclaredBinding),
    CheckBinding(&'a DeclaredBinding),
    Unbind(&'a DeclaredBinding),
}

impl fmt::Display for ProvisionStep<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisionStep::AssertVhost(name) => write!(f, "assert vhost {name}"),
            ProvisionStep::CheckVhost(name) => write!(f, "check vhost {name}"),
            ProvisionStep::DeleteVhost(name) => write!(f, "delete vhost {name}"),
            ProvisionStep::Connect(name) => write!(f, "connect {name}"),
            ProvisionStep::AssertExchange(e) => {
                write!(f, "assert exchange {} ({})", e.spec.name, e.spec.kind)
            }
            ProvisionStep::CheckExchange(e) => write!(f, "check exchange {}", e.spec.name),
            ProvisionStep::DeleteExchange(e) => write!(f, "delete exchange {}", e.spec.name),
            ProvisionStep::AssertQueue(q) => write!(f, "assert queue {}", q.spec.name),
            ProvisionStep::CheckQueue(q) => write!(f, "check queue {}", q.spec.name),
            ProvisionStep::PurgeQueue(q) => write!(f, "purge queue {}", q.spec.name),
            ProvisionStep::DeleteQueue(q) => write!(f, "delete queue {}", q.spec.name),
            ProvisionStep::Bind(b) => write!(
                f,
                "bind {} -> {} ({})",
                b.spec.source, b.spec.destination, b.spec.binding_key
            ),
            ProvisionStep::CheckBinding(b) => write!(
                f,
                "check binding {}: {} -> {}",
                b.name, b.spec.source, b.spec.destination
            ),
            ProvisionStep::Unbind(b) => write!(
                f,
                "unbind {} -> {} ({})",
                b.spec.source, b.spec.destination, b.spec.binding_key
            ),
        }
    }
}

/// One teardown operation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TeardownStep<'a> {
    DeleteQueue(&'a DeclaredQueue),
    DeleteExchange(&'a DeclaredExchange),
    DeleteVhost(&'a str),
}

impl fmt::Display for TeardownStep<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownStep::DeleteQueue(q) => write!(f, "delete queue {}", q.spec.name),
            TeardownStep::DeleteExchange(e) => write!(f, "delete exchange {}", e.spec.name),
            TeardownStep::DeleteVhost(name) => write!(f, "delete vhost {name}"),
        }
    }
}

/// Ordered steps for a single vhost
#[derive(Debug, Clone, Copy)]
pub struct TopologyPlan<'a> {
    vhost: &'a VhostTopology,
}

impl<'a> TopologyPlan<'a> {
    pub fn for_vhost(vhost: &'a VhostTopology) -> Self {
        Self { vhost }
    }

    pub fn vhost(&self) -> &'a VhostTopology {
        self.vhost
    }

    /// Steps executed by [`crate::topology::TopologyProvisioner::provision_vhost`]
    ///
    /// A vhost in delete mode yields only its deletion: there is nothing to
    /// connect to afterwards.
    pub fn provision_steps(&self) -> Vec<ProvisionStep<'a>> {
        let vhost = self.vhost;
        let mut steps = Vec::new();

        match vhost.mode {
            ProvisionMode::Delete => return vec![ProvisionStep::DeleteVhost(&vhost.name)],
            ProvisionMode::AssertOnly => steps.push(ProvisionStep::AssertVhost(&vhost.name)),
            ProvisionMode::CheckOnly => steps.push(ProvisionStep::CheckVhost(&vhost.name)),
            ProvisionMode::AssertAndCheck => {
                steps.push(ProvisionStep::AssertVhost(&vhost.name));
                steps.push(ProvisionStep::CheckVhost(&vhost.name));
            }
            ProvisionMode::None => {}
        }

        steps.push(ProvisionStep::Connect(&vhost.name));

        for exchange in &vhost.exchanges {
            match exchange.mode {
                ProvisionMode::AssertOnly => steps.push(ProvisionStep::AssertExchange(exchange)),
                ProvisionMode::CheckOnly => steps.push(ProvisionStep::CheckExchange(exchange)),
                ProvisionMode::AssertAndCheck => {
                    steps.push(ProvisionStep::AssertExchange(exchange));
                    steps.push(ProvisionStep::CheckExchange(exchange));
                }
                ProvisionMode::Delete => steps.push(ProvisionStep::DeleteExchange(exchange)),
                ProvisionMode::None => {}
            }
        }

        for queue in &vhost.queues {
            match queue.mode {
                ProvisionMode::AssertOnly => steps.push(ProvisionStep::AssertQueue(queue)),
                ProvisionMode::CheckOnly => steps.push(ProvisionStep::CheckQueue(queue)),
                ProvisionMode::AssertAndCheck => {
                    steps.push(ProvisionStep::AssertQueue(queue));
                    steps.push(ProvisionStep::CheckQueue(queue));
                }
                ProvisionMode::Delete => steps.push(ProvisionStep::DeleteQueue(queue)),
                ProvisionMode::None => {}
            }
            if queue.purge && (queue.mode.asserts() || queue.mode.checks()) {
                steps.push(ProvisionStep::PurgeQueue(queue));
            }
        }

        for binding in &vhost.bindings {
            match binding.mode {
                ProvisionMode::AssertOnly => steps.push(ProvisionStep::Bind(binding)),
                ProvisionMode::CheckOnly => steps.push(ProvisionStep::CheckBinding(binding)),
                ProvisionMode::AssertAndCheck => {
                    steps.push(ProvisionStep::Bind(binding));
                    steps.push(ProvisionStep::CheckBinding(binding));
                }
                ProvisionMode::Delete => steps.push(ProvisionStep::Unbind(binding)),
                ProvisionMode::None => {}
            }
        }

        steps
    }

    /// Steps executed by `nuke`: only objects this configuration asserts
    pub fn teardown_steps(&self) -> Vec<TeardownStep<'a>> {
        let vhost = self.vhost;
        if vhost.mode.deletes() {
            return Vec::new();
        }

        let queues = vhost
            .queues
            .iter()
            .rev()
            .filter(|q| q.mode.asserts())
            .map(TeardownStep::DeleteQueue);
        let exchanges = vhost
            .exchanges
            .iter()
            .rev()
            .filter(|e| e.mode.asserts())
            .map(TeardownStep::DeleteExchange);

        let mut steps: Vec<_> = queues.chain(exchanges).collect();
        if vhost.mode.asserts() {
            steps.push(TeardownStep::DeleteVhost(&vhost.name));
        }
        steps
    }

    /// Queues `Broker::purge` empties
    pub fn purgeable_queues(&self) -> impl Iterator<Item = &'a DeclaredQueue> {
        self.vhost.queues.iter().filter(|q| q.mode.asserts())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::topology::ResolvedTopology;

    fn topology(toml: &str) -> ResolvedTopology {
        ResolvedTopology::resolve(&BrokerConfig::from_toml_str(toml).unwrap()).unwrap()
    }

    fn render<T: fmt::Display>(steps: &[T]) -> Vec<String> {
        steps.iter().map(ToString::to_string).collect()
    }

    const FULL: &str = r#"
[[vhosts]]
name = "v1"
namespace = "ns"
assert = true
check = true

[[vhosts.exchanges]]
name = "e1"
type = "fanout"

[[vhosts.exchanges]]
name = "e2"
assert = false
check = true

[[vhosts.queues]]
name = "q1"
purge = true

[[vhosts.queues]]
name = "q2"

[[vhosts.queues]]
name = "q3"
assert = false
delete = true

[[vhosts.bindings]]
name = "b1"
source = "e1"
destination = "q1"

[[vhosts.bindings]]
name = "b2"
source = "e1"
destination = "q2"
assert = false
delete = true
"#;

    #[test]
    fn test_provision_order() {
        let topology = topology(FULL);
        let plan = TopologyPlan::for_vhost(topology.vhost("v1").unwrap());

        assert_eq!(
            render(&plan.provision_steps()),
            vec![
                "assert vhost v1",
                "check vhost v1",
                "connect v1",
                "assert exchange ns:e1 (fanout)",
                "check exchange ns:e2",
                "assert queue ns:q1",
                "purge queue ns:q1",
                "assert queue ns:q2",
                "delete queue ns:q3",
                "bind ns:e1 -> ns:q1 (#)",
                "unbind ns:e1 -> ns:q2 (#)",
            ]
        );
    }

    #[test]
    fn test_teardown_reverses_asserted_objects() {
        let topology = topology(FULL);
        let plan = TopologyPlan::for_vhost(topology.vhost("v1").unwrap());

        assert_eq!(
            render(&plan.teardown_steps()),
            vec![
                "delete queue ns:q2",
                "delete queue ns:q1",
                "delete exchange ns:e1",
                "delete vhost v1",
            ]
        );
    }

    #[test]
    fn test_deleted_vhost_skips_everything_else() {
        let topology = topology(
            r#"
[[vhosts]]
name = "v1"
delete = true

[[vhosts.queues]]
name = "q1"
"#,
        );
        let plan = TopologyPlan::for_vhost(topology.vhost("v1").unwrap());

        assert_eq!(
            plan.provision_steps(),
            vec![ProvisionStep::DeleteVhost("v1")]
        );
        assert!(plan.teardown_steps().is_empty());
    }

    #[test]
    fn test_unmanaged_vhost_still_connects() {
        let topology = topology(
            r#"
[[vhosts]]
name = "v1"
"#,
        );
        let plan = TopologyPlan::for_vhost(topology.vhost("v1").unwrap());
        assert_eq!(plan.provision_steps(), vec![ProvisionStep::Connect("v1")]);
        assert!(plan.teardown_steps().is_empty());
    }

    #[test]
    fn test_purgeable_queues_are_the_asserted_ones() {
        let topology = topology(FULL);
        let plan = TopologyPlan::for_vhost(topology.vhost("v1").unwrap());
        let names: Vec<_> = plan
            .purgeable_queues()
            .map(|q| q.logical_name.as_str())
            .collect();
        assert_eq!(names, vec!["q1", "q2"]);
    }
}
