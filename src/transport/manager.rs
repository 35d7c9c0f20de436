//! Per-vhost connection ownership
//!
//! The [`ConnectionManager`] is the only component allowed to open or close
//! the shared connection of a vhost. Connecting is single-flight: callers
//! racing on the same vhost wait for one attempt sequence and then share its
//! result.

use super::connection::{ConnectionState, ConnectionUrl, RetryDecision, RetryPolicy};
use super::{AmqpChannel, AmqpConnection, AmqpTransport, TransportError};
use crate::error::{BrokerError, BrokerResult};
use crate::observability::BrokerMetrics;
use crate::topology::VhostTopology;
use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// A vhost and its connection URL with the password redacted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub vhost: String,
    pub connection_url: String,
}

struct VhostSlot {
    vhost: String,
    url: ConnectionUrl,
    retry: RetryPolicy,
    timeout: Duration,
    connection: Mutex<Option<Arc<dyn AmqpConnection>>>,
    publish_channel: Mutex<Option<Arc<dyn AmqpChannel>>>,
    state: StdMutex<ConnectionState>,
}

impl VhostSlot {
    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|_| ConnectionState::Failed("state unavailable".to_string()))
    }
}

/// Owns one shared connection per vhost
pub struct ConnectionManager {
    transport: Arc<dyn AmqpTransport>,
    slots: Vec<VhostSlot>,
    metrics: Arc<BrokerMetrics>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn AmqpTransport>,
        vhosts: &[VhostTopology],
        metrics: Arc<BrokerMetrics>,
    ) -> Self {
        let slots = vhosts
            .iter()
            .map(|vhost| VhostSlot {
                vhost: vhost.name.clone(),
                url: vhost.connection_url.clone(),
                retry: vhost.retry.clone(),
                timeout: vhost.timeout,
                connection: Mutex::new(None),
                publish_channel: Mutex::new(None),
                state: StdMutex::new(ConnectionState::Idle),
            })
            .collect();

        Self {
            transport,
            slots,
            metrics,
        }
    }

    fn slot(&self, vhost: &str) -> BrokerResult<&VhostSlot> {
        self.slots
            .iter()
            .find(|slot| slot.vhost == vhost)
            .ok_or_else(|| BrokerError::unknown_vhost(vhost))
    }

    /// Return the live shared connection for `vhost`, establishing it if needed
    pub async fn connect(&self, vhost: &str) -> BrokerResult<Arc<dyn AmqpConnection>> {
        let slot = self.slot(vhost)?;
        let mut current = slot.connection.lock().await;

        if let Some(connection) = current.as_ref() {
            if !connection.is_closed() {
                return Ok(Arc::clone(connection));
            }
            debug!("Connection to vhost {} was closed, reconnecting", vhost);
        }

        let connection = self.establish(slot).await?;
        *current = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Open a connection the caller owns and must close
    pub async fn open_dedicated(&self, vhost: &str) -> BrokerResult<Arc<dyn AmqpConnection>> {
        let slot = self.slot(vhost)?;
        self.establish(slot).await
    }

    async fn establish(&self, slot: &VhostSlot) -> BrokerResult<Arc<dyn AmqpConnection>> {
        let mut attempts_made = 0;
        slot.set_state(ConnectionState::Connecting);

        loop {
            attempts_made += 1;
            self.metrics.connection_attempt();

            let result = match tokio::time::timeout(slot.timeout, self.transport.connect(&slot.url))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::TimedOut {
                    after_ms: slot.timeout.as_millis() as u64,
                }),
            };

            let error = match result {
                Ok(connection) => {
                    self.metrics.connection_established();
                    slot.set_state(ConnectionState::Connected);
                    info!("Connected to {}", slot.url);
                    return Ok(connection);
                }
                Err(error) => error,
            };

            self.metrics.connection_failed();
            match slot.retry.decide(attempts_made, &error) {
                RetryDecision::Proceed { attempt, delay_ms } => {
                    warn!(
                        "Connection to {} failed: {}. Attempt {}/{} in {}ms",
                        slot.url, error, attempt, slot.retry.attempts, delay_ms
                    );
                    slot.set_state(ConnectionState::Retrying(attempts_made));
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                RetryDecision::AbortUnrecoverable => {
                    error!("Connection to {} refused: {}", slot.url, error);
                    slot.set_state(ConnectionState::Failed(error.to_string()));
                    return Err(BrokerError::Connection {
                        vhost: slot.vhost.clone(),
                        source: error,
                    });
                }
                RetryDecision::AbortAttemptsExhausted => {
                    error!(
                        "Giving up on {} after {} attempts: {}",
                        slot.url, attempts_made, error
                    );
                    slot.set_state(ConnectionState::Failed(error.to_string()));
                    return Err(BrokerError::Connection {
                        vhost: slot.vhost.clone(),
                        source: error,
                    });
                }
            }
        }
    }

    /// Open a fresh channel on the shared connection
    pub async fn channel(&self, vhost: &str) -> BrokerResult<Arc<dyn AmqpChannel>> {
        let slot = self.slot(vhost)?;
        let connection = self.connect(vhost).await?;

        match tokio::time::timeout(slot.timeout, connection.open_channel()).await {
            Ok(Ok(channel)) => Ok(channel),
            Ok(Err(e)) => Err(BrokerError::channel("open channel on vhost", vhost, e)),
            Err(_) => Err(BrokerError::timeout(
                "open channel on vhost",
                vhost,
                slot.timeout,
            )),
        }
    }

    /// The channel shared by all publishes to `vhost`
    pub async fn publish_channel(&self, vhost: &str) -> BrokerResult<Arc<dyn AmqpChannel>> {
        let slot = self.slot(vhost)?;
        let mut current = slot.publish_channel.lock().await;

        if let Some(channel) = current.as_ref() {
            if !channel.is_closed() {
                return Ok(Arc::clone(channel));
            }
        }

        let channel = self.channel(vhost).await?;
        *current = Some(Arc::clone(&channel));
        Ok(channel)
    }

    /// The live shared connection, without connecting
    pub async fn existing(&self, vhost: &str) -> Option<Arc<dyn AmqpConnection>> {
        let slot = self.slot(vhost).ok()?;
        let current = slot.connection.lock().await;
        current
            .as_ref()
            .filter(|connection| !connection.is_closed())
            .cloned()
    }

    /// Close the shared connection of `vhost`; closing an absent or closed connection is not an error
    pub async fn close(&self, vhost: &str) -> BrokerResult<()> {
        let slot = self.slot(vhost)?;
        slot.publish_channel.lock().await.take();
        let connection = slot.connection.lock().await.take();

        let Some(connection) = connection else {
            return Ok(());
        };
        slot.set_state(ConnectionState::Closed);
        if connection.is_closed() {
            return Ok(());
        }

        let result = match tokio::time::timeout(slot.timeout, connection.close()).await {
            Ok(Ok(())) | Ok(Err(TransportError::ConnectionClosed)) => Ok(()),
            Ok(Err(e)) => Err(BrokerError::Connection {
                vhost: vhost.to_string(),
                source: e,
            }),
            Err(_) => Err(BrokerError::timeout(
                "close connection to vhost",
                vhost,
                slot.timeout,
            )),
        };

        if result.is_ok() {
            self.metrics.connection_closed();
            info!("Closed connection to {}", slot.url);
        }
        result
    }

    /// Close every connection, returning the first failure after attempting all
    pub async fn close_all(&self) -> BrokerResult<()> {
        let mut first_error = None;
        for slot in &self.slots {
            if let Err(e) = self.close(&slot.vhost).await {
                warn!("Failed to close connection to vhost {}: {}", slot.vhost, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// One entry per vhost, in declaration order
    pub fn connection_urls(&self) -> Vec<ConnectionInfo> {
        self.slots
            .iter()
            .map(|slot| ConnectionInfo {
                vhost: slot.vhost.clone(),
                connection_url: slot.url.redacted().to_string(),
            })
            .collect()
    }

    pub fn state(&self, vhost: &str) -> BrokerResult<ConnectionState> {
        Ok(self.slot(vhost)?.state())
    }

    /// Round-trip bound configured for `vhost`
    pub fn timeout(&self, vhost: &str) -> BrokerResult<Duration> {
        Ok(self.slot(vhost)?.timeout)
    }
}
