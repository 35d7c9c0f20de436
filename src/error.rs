//! Error taxonomy for topology provisioning, publishing and subscriber sessions
//!
//! Callers branch on these variants and, for check failures, on the exact
//! message text. The `#[error]` strings on [`BrokerError::CheckFailed`] are
//! therefore part of the public contract and must not change.

use crate::broker::Broker;
use crate::config::ConfigError;
use crate::transport::TransportError;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Broker object kinds that can be asserted, checked or deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Vhost,
    Exchange,
    Queue,
    Binding,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ObjectKind::Vhost => "vhost",
            ObjectKind::Exchange => "exchange",
            ObjectKind::Queue => "queue",
            ObjectKind::Binding => "binding",
        };
        f.write_str(label)
    }
}

/// Main error type for broker operations
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Failed to connect to vhost: {vhost}. {source}")]
    Connection {
        vhost: String,
        #[source]
        source: TransportError,
    },

    #[error("Failed to check {kind}: {name}. {url} returned status {status}")]
    CheckFailed {
        kind: ObjectKind,
        name: String,
        url: String,
        status: u16,
    },

    #[error("Failed to assert {kind}: {name} in vhost: {vhost}. {reason}")]
    TopologyConflict {
        kind: ObjectKind,
        name: String,
        vhost: String,
        reason: String,
    },

    #[error("Timed out after {timeout_ms}ms waiting to {operation} {target}")]
    Timeout {
        operation: String,
        target: String,
        timeout_ms: u64,
    },

    #[error("Unknown publication: {0}")]
    UnknownPublication(String),

    #[error("Unknown subscription: {0}")]
    UnknownSubscription(String),

    #[error("Unknown vhost: {0}")]
    UnknownVhost(String),

    #[error("Failed to {action} vhost: {vhost}. {url} returned status {status}")]
    ManagementRequestFailed {
        action: &'static str,
        vhost: String,
        url: String,
        status: u16,
    },

    #[error("Failed to {action} vhost: {vhost}. {url} is unavailable: {reason}")]
    ManagementUnavailable {
        action: &'static str,
        vhost: String,
        url: String,
        reason: String,
    },

    #[error("Failed to {operation} {target}: {source}")]
    Channel {
        operation: &'static str,
        target: String,
        #[source]
        source: TransportError,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker has been shut down")]
    ShutDown,
}

impl BrokerError {
    /// Create a timeout error scoped to a single object or vhost
    pub fn timeout<O: Into<String>, T: Into<String>>(
        operation: O,
        target: T,
        timeout: Duration,
    ) -> Self {
        Self::Timeout {
            operation: operation.into(),
            target: target.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Create a channel-level failure for the given target
    pub fn channel<T: Into<String>>(
        operation: &'static str,
        target: T,
        source: TransportError,
    ) -> Self {
        Self::Channel {
            operation,
            target: target.into(),
            source,
        }
    }

    /// Create unknown publication error
    pub fn unknown_publication<S: Into<String>>(name: S) -> Self {
        Self::UnknownPublication(name.into())
    }

    /// Create unknown subscription error
    pub fn unknown_subscription<S: Into<String>>(name: S) -> Self {
        Self::UnknownSubscription(name.into())
    }

    /// Create unknown vhost error
    pub fn unknown_vhost<S: Into<String>>(name: S) -> Self {
        Self::UnknownVhost(name.into())
    }

    /// HTTP-style status associated with this failure, when there is one
    pub fn status(&self) -> Option<u16> {
        match self {
            BrokerError::CheckFailed { status, .. }
            | BrokerError::ManagementRequestFailed { status, .. } => Some(*status),
            BrokerError::TopologyConflict { .. } => Some(406),
            BrokerError::Channel { source, .. } | BrokerError::Connection { source, .. } => {
                source.reply_code()
            }
            _ => None,
        }
    }

    /// Whether the failure means the target object does not exist
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

/// Failure of [`Broker::create`]
///
/// Carries the first fatal error together with the partially initialised
/// broker so the caller can still run [`Broker::nuke`] or
/// [`Broker::shutdown`] against whatever was provisioned.
#[derive(Debug, Error)]
#[error("Failed to initialise broker: {source}")]
pub struct InitializationError {
    #[source]
    source: BrokerError,
    broker: Broker,
}

impl InitializationError {
    pub(crate) fn new(source: BrokerError, broker: Broker) -> Self {
        Self { source, broker }
    }

    /// The first fatal error raised during initialisation
    pub fn error(&self) -> &BrokerError {
        &self.source
    }

    /// The partially constructed broker
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Split into the underlying error and the partial broker
    pub fn into_parts(self) -> (BrokerError, Broker) {
        (self.source, self.broker)
    }
}

static URL_CREDENTIALS: Lazy<regex::Regex> = Lazy::new(|| {
    regex::Regex::new(r"(?i)([a-z][a-z0-9+.-]*://[^:/@\s]+):[^@/\s]+@").expect("valid regex")
});

static KEY_VALUE_SECRETS: Lazy<regex::Regex> = Lazy::new(|| {
    regex::Regex::new(r"(?i)(password|token|key|secret)[=:]\s*[^\s&]+").expect("valid regex")
});

const MAX_MESSAGE_LEN: usize = 500;

/// Redact credentials from a message that may embed URLs or key/value pairs
///
/// Used on every string taken from an underlying transport or HTTP error
/// before it is stored in a [`BrokerError`].
pub fn redact_credentials(message: &str) -> String {
    let sanitized = URL_CREDENTIALS.replace_all(message, "${1}:***@");
    let mut sanitized = KEY_VALUE_SECRETS
        .replace_all(&sanitized, "${1}=***")
        .to_string();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(truncate_suffix);
    }

    sanitized
}

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;
