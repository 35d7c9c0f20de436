//! Executes topology plans against the broker
//!
//! Every broker round-trip is bounded by the vhost's `timeout_ms`; a timeout
//! fails only the object it concerns. Vhosts are provisioned concurrently,
//! each in its fixed plan order.

use super::plan::{ProvisionStep, TeardownStep, TopologyPlan};
use super::{ResolvedTopology, VhostTopology};
use crate::error::{BrokerError, BrokerResult, ObjectKind};
use crate::management::{vhost_request, ManagementApi, VhostAction};
use crate::observability::BrokerMetrics;
use crate::transport::{AmqpChannel, ConnectionManager, ConnectionState, TransportError};
use crate::vhost_span;
use futures::future::{join_all, try_join_all};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Assert,
    Check,
    Delete,
    Purge,
    Bind,
    Unbind,
}

impl Operation {
    fn label(self) -> &'static str {
        match self {
            Operation::Assert => "assert",
            Operation::Check => "check",
            Operation::Delete => "delete",
            Operation::Purge => "purge",
            Operation::Bind => "bind",
            Operation::Unbind => "unbind",
        }
    }
}

/// Applies resolved topologies: vhosts through the management API, objects over AMQP
pub struct TopologyProvisioner {
    connections: Arc<ConnectionManager>,
    management: Arc<dyn ManagementApi>,
    metrics: Arc<BrokerMetrics>,
}

impl TopologyProvisioner {
    pub fn new(
        connections: Arc<ConnectionManager>,
        management: Arc<dyn ManagementApi>,
        metrics: Arc<BrokerMetrics>,
    ) -> Self {
        Self {
            connections,
            management,
            metrics,
        }
    }

    /// Provision every vhost, failing with the first error
    pub async fn provision(&self, topology: &ResolvedTopology) -> BrokerResult<()> {
        try_join_all(
            topology
                .vhosts()
                .iter()
                .map(|vhost| self.provision_vhost(vhost)),
        )
        .await?;
        Ok(())
    }

    pub async fn provision_vhost(&self, vhost: &VhostTopology) -> BrokerResult<()> {
        let span = vhost_span!(vhost = %vhost.name);
        async {
            let mut channel = None;
            let mut result = Ok(());

            for step in TopologyPlan::for_vhost(vhost).provision_steps() {
                debug!("Provisioning step: {}", step);
                if let Err(e) = self.execute(vhost, &mut channel, step).await {
                    self.metrics.provisioning_failed();
                    warn!("Provisioning of vhost {} failed: {}", vhost.name, e);
                    result = Err(e);
                    break;
                }
            }

            if let Some(channel) = channel {
                close_channel(channel.as_ref(), &vhost.name).await;
            }
            if result.is_ok() {
                info!("Provisioned vhost {}", vhost.name);
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        vhost: &VhostTopology,
        channel: &mut Option<Arc<dyn AmqpChannel>>,
        step: ProvisionStep<'_>,
    ) -> BrokerResult<()> {
        match step {
            ProvisionStep::AssertVhost(name) => {
                self.management_call(vhost, VhostAction::Assert, name).await
            }
            ProvisionStep::CheckVhost(name) => {
                self.management_call(vhost, VhostAction::Check, name).await
            }
            ProvisionStep::DeleteVhost(name) => {
                self.management_call(vhost, VhostAction::Delete, name).await
            }
            ProvisionStep::Connect(name) => {
                *channel = Some(self.connections.channel(name).await?);
                Ok(())
            }
            step => {
                let channel = match channel.as_ref() {
                    Some(channel) => Arc::clone(channel),
                    None => {
                        let opened = self.connections.channel(&vhost.name).await?;
                        *channel = Some(Arc::clone(&opened));
                        opened
                    }
                };
                self.execute_on_channel(vhost, channel.as_ref(), step).await
            }
        }
    }

    async fn execute_on_channel(
        &self,
        vhost: &VhostTopology,
        channel: &dyn AmqpChannel,
        step: ProvisionStep<'_>,
    ) -> BrokerResult<()> {
        match step {
            ProvisionStep::AssertExchange(exchange) => {
                let name = &exchange.spec.name;
                round_trip(vhost, Operation::Assert, ObjectKind::Exchange, name, async {
                    channel.assert_exchange(&exchange.spec).await
                })
                .await?;
                self.metrics.object_asserted();
            }
            ProvisionStep::CheckExchange(exchange) => {
                let name = &exchange.spec.name;
                round_trip(vhost, Operation::Check, ObjectKind::Exchange, name, async {
                    channel.check_exchange(name).await
                })
                .await?;
                self.metrics.object_checked();
            }
            ProvisionStep::DeleteExchange(exchange) => {
                delete_exchange(vhost, channel, &exchange.spec.name).await?;
                self.metrics.object_deleted();
            }
            ProvisionStep::AssertQueue(queue) => {
                let name = &queue.spec.name;
                round_trip(vhost, Operation::Assert, ObjectKind::Queue, name, async {
                    channel.assert_queue(&queue.spec).await
                })
                .await?;
                self.metrics.object_asserted();
            }
            ProvisionStep::CheckQueue(queue) => {
                let name = &queue.spec.name;
                round_trip(vhost, Operation::Check, ObjectKind::Queue, name, async {
                    channel.check_queue(name).await
                })
                .await?;
                self.metrics.object_checked();
            }
            ProvisionStep::PurgeQueue(queue) => {
                let purged = purge_queue(vhost, channel, &queue.spec.name).await?;
                self.metrics.queue_purged();
                debug!("Purged {} messages from {}", purged, queue.spec.name);
            }
            ProvisionStep::DeleteQueue(queue) => {
                delete_queue(vhost, channel, &queue.spec.name).await?;
                self.metrics.object_deleted();
            }
            ProvisionStep::Bind(binding) => {
                round_trip(vhost, Operation::Bind, ObjectKind::Binding, &binding.name, async {
                    channel.bind(&binding.spec).await
                })
                .await?;
                self.metrics.object_asserted();
            }
            ProvisionStep::CheckBinding(binding) => {
                let source = &binding.spec.source;
                round_trip(vhost, Operation::Check, ObjectKind::Exchange, source, async {
                    channel.check_exchange(source).await
                })
                .await?;

                let destination = &binding.spec.destination;
                match binding.spec.destination_type {
                    crate::config::DestinationType::Queue => {
                        round_trip(vhost, Operation::Check, ObjectKind::Queue, destination, async {
                            channel.check_queue(destination).await
                        })
                        .await?
                    }
                    crate::config::DestinationType::Exchange => {
                        round_trip(
                            vhost,
                            Operation::Check,
                            ObjectKind::Exchange,
                            destination,
                            async { channel.check_exchange(destination).await },
                        )
                        .await?
                    }
                }
                self.metrics.object_checked();
            }
            ProvisionStep::Unbind(binding) => {
                round_trip(
                    vhost,
                    Operation::Unbind,
                    ObjectKind::Binding,
                    &binding.name,
                    async { channel.unbind(&binding.spec).await },
                )
                .await?;
                self.metrics.object_deleted();
            }
            ProvisionStep::AssertVhost(_)
            | ProvisionStep::CheckVhost(_)
            | ProvisionStep::DeleteVhost(_)
            | ProvisionStep::Connect(_) => {}
        }
        Ok(())
    }

    async fn management_call(
        &self,
        vhost: &VhostTopology,
        action: VhostAction,
        name: &str,
    ) -> BrokerResult<()> {
        vhost_request(self.management.as_ref(), &vhost.management, action, name).await?;
        match action {
            VhostAction::Assert => {
                self.metrics.object_asserted();
                info!("Asserted vhost {}", name);
            }
            VhostAction::Check => self.metrics.object_checked(),
            VhostAction::Delete => {
                self.metrics.object_deleted();
                info!("Deleted vhost {}", name);
            }
        }
        Ok(())
    }

    /// Delete every asserted object on connected vhosts, then asserted vhosts
    ///
    /// Keeps going after a failure and returns the first one.
    pub async fn teardown(&self, topology: &ResolvedTopology) -> BrokerResult<()> {
        let results = join_all(
            topology
                .vhosts()
                .iter()
                .map(|vhost| self.teardown_vhost(vhost)),
        )
        .await;
        results.into_iter().collect()
    }

    pub async fn teardown_vhost(&self, vhost: &VhostTopology) -> BrokerResult<()> {
        let span = vhost_span!(vhost = %vhost.name);
        async {
            let steps = TopologyPlan::for_vhost(vhost).teardown_steps();
            if steps.is_empty() {
                return Ok(());
            }

            let mut first_error = None;
            let channel = match self.teardown_channel(vhost).await {
                Ok(channel) => channel,
                Err(e) => {
                    warn!("Cannot delete objects in vhost {}: {}", vhost.name, e);
                    first_error = Some(e);
                    None
                }
            };

            for step in steps {
                let result = match (step, channel.as_deref()) {
                    (TeardownStep::DeleteQueue(queue), Some(channel)) => {
                        delete_queue(vhost, channel, &queue.spec.name).await
                    }
                    (TeardownStep::DeleteExchange(exchange), Some(channel)) => {
                        delete_exchange(vhost, channel, &exchange.spec.name).await
                    }
                    (TeardownStep::DeleteVhost(name), _) => {
                        self.management_call(vhost, VhostAction::Delete, name).await
                    }
                    (step, None) => {
                        debug!("Skipping {}: vhost {} is not connected", step, vhost.name);
                        continue;
                    }
                };

                match result {
                    Ok(()) => {
                        if !matches!(step, TeardownStep::DeleteVhost(_)) {
                            self.metrics.object_deleted();
                        }
                        debug!("Teardown step done: {}", step);
                    }
                    Err(e) => {
                        warn!("Teardown step failed: {}: {}", step, e);
                        first_error.get_or_insert(e);
                    }
                }
            }

            if let Some(channel) = channel {
                close_channel(channel.as_ref(), &vhost.name).await;
            }
            first_error.map_or(Ok(()), Err)
        }
        .instrument(span)
        .await
    }

    /// Channel for deleting objects, if the vhost has been connected
    ///
    /// A live connection is reused and one closed by its owner is reopened.
    /// Vhosts that never connected, or whose connection was lost, are skipped.
    async fn teardown_channel(
        &self,
        vhost: &VhostTopology,
    ) -> BrokerResult<Option<Arc<dyn AmqpChannel>>> {
        let reopen = self.connections.existing(&vhost.name).await.is_some()
            || self.connections.state(&vhost.name)? == ConnectionState::Closed;
        if !reopen {
            return Ok(None);
        }
        self.connections.channel(&vhost.name).await.map(Some)
    }

    /// Purge every asserted queue; returns the number of messages removed
    pub async fn purge(&self, topology: &ResolvedTopology) -> BrokerResult<u64> {
        let mut total = 0u64;
        for vhost in topology.vhosts() {
            let plan = TopologyPlan::for_vhost(vhost);
            if vhost.mode.deletes() || plan.purgeable_queues().next().is_none() {
                continue;
            }

            let channel = self.connections.channel(&vhost.name).await?;
            for queue in plan.purgeable_queues() {
                let purged = purge_queue(vhost, channel.as_ref(), &queue.spec.name).await;
                match purged {
                    Ok(count) => {
                        total += u64::from(count);
                        self.metrics.queue_purged();
                    }
                    Err(e) => {
                        close_channel(channel.as_ref(), &vhost.name).await;
                        return Err(e);
                    }
                }
            }
            close_channel(channel.as_ref(), &vhost.name).await;
        }
        Ok(total)
    }
}

async fn delete_queue(vhost: &VhostTopology, channel: &dyn AmqpChannel, name: &str) -> BrokerResult<()> {
    tolerate_absent(
        round_trip(vhost, Operation::Delete, ObjectKind::Queue, name, async {
            channel.delete_queue(name).await
        })
        .await,
    )
}

async fn delete_exchange(
    vhost: &VhostTopology,
    channel: &dyn AmqpChannel,
    name: &str,
) -> BrokerResult<()> {
    tolerate_absent(
        round_trip(vhost, Operation::Delete, ObjectKind::Exchange, name, async {
            channel.delete_exchange(name).await
        })
        .await,
    )
}

async fn purge_queue(vhost: &VhostTopology, channel: &dyn AmqpChannel, name: &str) -> BrokerResult<u32> {
    round_trip(vhost, Operation::Purge, ObjectKind::Queue, name, async {
        channel.purge_queue(name).await
    })
    .await
}

fn tolerate_absent(result: BrokerResult<()>) -> BrokerResult<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Bound one broker round-trip and translate its failure
async fn round_trip<T, F>(
    vhost: &VhostTopology,
    operation: Operation,
    kind: ObjectKind,
    name: &str,
    call: F,
) -> BrokerResult<T>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match tokio::time::timeout(vhost.timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(translate(vhost, operation, kind, name, e)),
        Err(_) => Err(timeout_error(vhost, operation, kind, name, vhost.timeout)),
    }
}

fn timeout_error(
    vhost: &VhostTopology,
    operation: Operation,
    kind: ObjectKind,
    name: &str,
    timeout: Duration,
) -> BrokerError {
    BrokerError::timeout(
        format!("{} {}", operation.label(), kind),
        format!("{}/{}", vhost.name, name),
        timeout,
    )
}

fn translate(
    vhost: &VhostTopology,
    operation: Operation,
    kind: ObjectKind,
    name: &str,
    error: TransportError,
) -> BrokerError {
    match error {
        TransportError::NotFound {
            kind: missing_kind,
            name: missing,
        } if operation == Operation::Check => BrokerError::CheckFailed {
            kind: missing_kind,
            name: missing,
            url: vhost.connection_url.redacted().to_string(),
            status: 404,
        },
        TransportError::PreconditionFailed {
            kind: conflict_kind,
            name: conflicting,
            reason,
        } => BrokerError::TopologyConflict {
            kind: conflict_kind,
            name: conflicting,
            vhost: vhost.name.clone(),
            reason,
        },
        other => BrokerError::channel(operation.label(), format!("{kind} {name}"), other),
    }
}

/// Close a provisioning channel; failures only matter for diagnostics
async fn close_channel(channel: &dyn AmqpChannel, vhost: &str) {
    if let Err(e) = channel.close().await {
        debug!("Failed to close provisioning channel on vhost {}: {}", vhost, e);
    }
}
