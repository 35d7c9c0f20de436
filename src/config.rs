//! Declarative broker topology configuration
//!
//! The configuration tree describes, per vhost, the connection to use and the
//! exchanges, queues, bindings, publications and subscriptions to provision.
//! Collections are ordered arrays keyed by `name` because declaration order
//! drives provisioning and `subscribe_all` ordering.
//!
//! ```toml
//! [[vhosts]]
//! name = "v1"
//! namespace = "test"
//! assert = true
//!
//! [vhosts.connection]
//! hostname = "localhost"
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
//! ```
//!
//! The engine never mutates a loaded configuration; everything derived from
//! it (namespaces, physical names, provision modes) lives in
//! [`crate::topology::ResolvedTopology`].

use crate::error::ObjectKind;
use crate::transport::connection::ConnectionUrl;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Free-form AMQP arguments (`x-message-ttl`, `alternate-exchange`, ...)
pub type Arguments = BTreeMap<String, serde_json::Value>;

/// Root of the configuration tree
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BrokerConfig {
    #[serde(default)]
    pub vhosts: Vec<VhostConfig>,
}

/// A single vhost and everything provisioned inside it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VhostConfig {
    /// Vhost name as known to the broker
    pub name: String,
    /// Prefix applied to every physical exchange and queue name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<NamespaceSetting>,
    /// Create the vhost through the management API
    #[serde(default)]
    pub assert: bool,
    /// Verify the vhost exists through the management API
    #[serde(default)]
    pub check: bool,
    /// Delete the vhost through the management API
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub exchanges: Vec<ExchangeConfig>,
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
    #[serde(default)]
    pub bindings: Vec<BindingConfig>,
    #[serde(default)]
    pub publications: Vec<PublicationConfig>,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

/// Namespace configuration: a fixed prefix, or `true` for a generated one
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum NamespaceSetting {
    Generated(bool),
    Fixed(String),
}

/// Connection options for a vhost
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_amqp_port")]
    pub port: u16,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_password")]
    pub password: String,
    /// Query parameters appended to the connection URL (heartbeat, frame_max, ...)
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
    /// Upper bound for any single broker round-trip, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub management: ManagementConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            hostname: default_hostname(),
            port: default_amqp_port(),
            user: default_user(),
            password: default_password(),
            options: BTreeMap::new(),
            timeout_ms: default_timeout_ms(),
            retry: RetryConfig::default(),
            management: ManagementConfig::default(),
        }
    }
}

/// Connection retry policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Total connection attempts before giving up (at least 1)
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,
    /// Delay before each retry in milliseconds; the last entry is reused via `sustained_delay_ms`
    #[serde(default = "default_backoff_pattern")]
    pub backoff_pattern: Vec<u64>,
    /// Delay once the pattern is exhausted
    #[serde(default = "default_sustained_delay")]
    pub sustained_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            backoff_pattern: default_backoff_pattern(),
            sustained_delay_ms: default_sustained_delay(),
        }
    }
}

/// HTTP management API endpoint for a vhost
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagementConfig {
    #[serde(default = "default_management_protocol")]
    pub protocol: String,
    /// Defaults to the connection hostname
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default = "default_management_port")]
    pub port: u16,
    /// Defaults to the connection user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Defaults to the connection password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default = "default_management_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            protocol: default_management_protocol(),
            hostname: None,
            port: default_management_port(),
            user: None,
            password: None,
            timeout_ms: default_management_timeout_ms(),
        }
    }
}

/// Exchange routing type
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    Direct,
    Fanout,
    #[default]
    Topic,
    Headers,
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Topic => "topic",
            ExchangeType::Headers => "headers",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExchangeConfig {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ExchangeType,
    #[serde(default = "default_true")]
    pub assert: bool,
    #[serde(default)]
    pub check: bool,
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub options: ExchangeOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExchangeOptions {
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub arguments: Arguments,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
            internal: false,
            arguments: Arguments::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub assert: bool,
    #[serde(default)]
    pub check: bool,
    #[serde(default)]
    pub delete: bool,
    /// Purge the queue once it has been asserted during initialisation
    #[serde(default)]
    pub purge: bool,
    #[serde(default)]
    pub options: QueueOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueOptions {
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub arguments: Arguments,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: Arguments::new(),
        }
    }
}

/// What a binding routes to
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DestinationType {
    #[default]
    Queue,
    Exchange,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BindingConfig {
    pub name: String,
    /// Source exchange (logical name)
    pub source: String,
    /// Destination queue or exchange (logical name)
    pub destination: String,
    #[serde(default)]
    pub destination_type: DestinationType,
    #[serde(default = "default_binding_key")]
    pub binding_key: String,
    #[serde(default)]
    pub arguments: Arguments,
    #[serde(default = "default_true")]
    pub assert: bool,
    /// Verify both endpoints exist
    #[serde(default)]
    pub check: bool,
    /// Remove the binding
    #[serde(default)]
    pub delete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublicationConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default)]
    pub routing_key: String,
    #[serde(default)]
    pub options: PublishOptions,
}

/// Message options applied to every publish through a publication
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PublishOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    /// Per-message TTL in milliseconds, as a string per AMQP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub mandatory: bool,
}

impl PublishOptions {
    /// Overlay `overrides` on top of these options; headers are merged key by key
    pub fn merged_with(&self, overrides: &PublishOptions) -> PublishOptions {
        let mut headers = self.headers.clone();
        headers.extend(
            overrides
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        PublishOptions {
            persistent: overrides.persistent.or(self.persistent),
            content_type: overrides
                .content_type
                .clone()
                .or_else(|| self.content_type.clone()),
            priority: overrides.priority.or(self.priority),
            expiration: overrides
                .expiration
                .clone()
                .or_else(|| self.expiration.clone()),
            correlation_id: overrides
                .correlation_id
                .clone()
                .or_else(|| self.correlation_id.clone()),
            reply_to: overrides.reply_to.clone().or_else(|| self.reply_to.clone()),
            headers,
            mandatory: overrides.mandatory || self.mandatory,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionConfig {
    pub name: String,
    /// Source queue (logical name)
    pub queue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefetch: Option<u16>,
    #[serde(default)]
    pub options: SubscribeOptions,
    /// Capacity of the session's message stream
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SubscribeOptions {
    #[serde(default)]
    pub no_ack: bool,
    #[serde(default)]
    pub exclusive: bool,
}

/// Provisioning behaviour for one object, resolved once from its flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProvisionMode {
    None,
    AssertOnly,
    CheckOnly,
    AssertAndCheck,
    Delete,
}

impl ProvisionMode {
    /// Resolve the assert/check/delete flags of an object
    pub fn from_flags(
        kind: ObjectKind,
        name: &str,
        assert: bool,
        check: bool,
        delete: bool,
    ) -> Result<Self, ConfigError> {
        match (assert, check, delete) {
            (false, false, false) => Ok(ProvisionMode::None),
            (true, false, false) => Ok(ProvisionMode::AssertOnly),
            (false, true, false) => Ok(ProvisionMode::CheckOnly),
            (true, true, false) => Ok(ProvisionMode::AssertAndCheck),
            (false, false, true) => Ok(ProvisionMode::Delete),
            _ => Err(ConfigError::ConflictingFlags {
                kind,
                name: name.to_string(),
            }),
        }
    }

    pub fn asserts(&self) -> bool {
        matches!(self, ProvisionMode::AssertOnly | ProvisionMode::AssertAndCheck)
    }

    pub fn checks(&self) -> bool {
        matches!(self, ProvisionMode::CheckOnly | ProvisionMode::AssertAndCheck)
    }

    pub fn deletes(&self) -> bool {
        matches!(self, ProvisionMode::Delete)
    }
}

impl VhostConfig {
    pub fn mode(&self) -> Result<ProvisionMode, ConfigError> {
        ProvisionMode::from_flags(
            ObjectKind::Vhost,
            &self.name,
            self.assert,
            self.check,
            self.delete,
        )
    }
}

impl ExchangeConfig {
    pub fn mode(&self) -> Result<ProvisionMode, ConfigError> {
        ProvisionMode::from_flags(
            ObjectKind::Exchange,
            &self.name,
            self.assert,
            self.check,
            self.delete,
        )
    }
}

impl QueueConfig {
    pub fn mode(&self) -> Result<ProvisionMode, ConfigError> {
        ProvisionMode::from_flags(
            ObjectKind::Queue,
            &self.name,
            self.assert,
            self.check,
            self.delete,
        )
    }
}

impl BindingConfig {
    pub fn mode(&self) -> Result<ProvisionMode, ConfigError> {
        ProvisionMode::from_flags(
            ObjectKind::Binding,
            &self.name,
            self.assert,
            self.check,
            self.delete,
        )
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Duplicate {kind} name: {name}")]
    DuplicateName { kind: &'static str, name: String },
    #[error("{kind} {name} references unknown {referenced_kind} {referenced}")]
    UnknownReference {
        kind: &'static str,
        name: String,
        referenced_kind: &'static str,
        referenced: String,
    },
    #[error("{kind} {name} combines delete with assert or check")]
    ConflictingFlags { kind: ObjectKind, name: String },
    #[error("Invalid connection URL for vhost {vhost}: {reason}")]
    InvalidUrl { vhost: String, reason: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BrokerConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text and validate it
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BrokerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a vhost by name
    pub fn vhost(&self, name: &str) -> Option<&VhostConfig> {
        self.vhosts.iter().find(|v| v.name == name)
    }

    /// Validate names, references and flag combinations
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut vhost_names = HashSet::new();
        let mut publication_names = HashSet::new();
        let mut subscription_names = HashSet::new();

        for vhost in &self.vhosts {
            if vhost.name.is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "vhost name cannot be empty".to_string(),
                ));
            }
            if !vhost_names.insert(vhost.name.as_str()) {
                return Err(duplicate("vhost", &vhost.name));
            }
            vhost.validate()?;

            for publication in &vhost.publications {
                if !publication_names.insert(publication.name.as_str()) {
                    return Err(duplicate("publication", &publication.name));
                }
            }
            for subscription in &vhost.subscriptions {
                if !subscription_names.insert(subscription.name.as_str()) {
                    return Err(duplicate("subscription", &subscription.name));
                }
            }
        }

        Ok(())
    }
}

impl VhostConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.mode()?;

        if let Some(NamespaceSetting::Fixed(namespace)) = &self.namespace {
            if namespace.is_empty() {
                return Err(ConfigError::InvalidConfig(format!(
                    "vhost {} has an empty namespace",
                    self.name
                )));
            }
        }

        if self.connection.retry.attempts == 0 {
            return Err(ConfigError::InvalidConfig(format!(
                "vhost {} must allow at least one connection attempt",
                self.name
            )));
        }

        ConnectionUrl::build(&self.name, &self.connection)?;

        // The empty name is the broker's default exchange, which cannot be declared
        if self.exchanges.iter().any(|e| e.name.is_empty()) {
            return Err(ConfigError::InvalidConfig(format!(
                "vhost {} declares an exchange with an empty name",
                self.name
            )));
        }
        if self.queues.iter().any(|q| q.name.is_empty()) {
            return Err(ConfigError::InvalidConfig(format!(
                "vhost {} declares a queue with an empty name",
                self.name
            )));
        }

        let exchanges = unique_names("exchange", self.exchanges.iter().map(|e| &e.name))?;
        let queues = unique_names("queue", self.queues.iter().map(|q| &q.name))?;
        unique_names("binding", self.bindings.iter().map(|b| &b.name))?;

        for exchange in &self.exchanges {
            exchange.mode()?;
        }
        for queue in &self.queues {
            queue.mode()?;
        }

        for binding in &self.bindings {
            binding.mode()?;
            if !exchanges.contains(binding.source.as_str()) {
                return Err(unknown_reference(
                    "binding",
                    &binding.name,
                    "exchange",
                    &binding.source,
                ));
            }
            let (destination_kind, known) = match binding.destination_type {
                DestinationType::Queue => ("queue", &queues),
                DestinationType::Exchange => ("exchange", &exchanges),
            };
            if !known.contains(binding.destination.as_str()) {
                return Err(unknown_reference(
                    "binding",
                    &binding.name,
                    destination_kind,
                    &binding.destination,
                ));
            }
        }

        for publication in &self.publications {
            match (&publication.exchange, &publication.queue) {
                (Some(exchange), None) => {
                    // The default exchange is addressed by the empty name
                    if !exchange.is_empty() && !exchanges.contains(exchange.as_str()) {
                        return Err(unknown_reference(
                            "publication",
                            &publication.name,
                            "exchange",
                            exchange,
                        ));
                    }
                }
                (None, Some(queue)) => {
                    if !queues.contains(queue.as_str()) {
                        return Err(unknown_reference(
                            "publication",
                            &publication.name,
                            "queue",
                            queue,
                        ));
                    }
                }
                _ => {
                    return Err(ConfigError::InvalidConfig(format!(
                        "publication {} must name exactly one of exchange or queue",
                        publication.name
                    )));
                }
            }
        }

        for subscription in &self.subscriptions {
            if !queues.contains(subscription.queue.as_str()) {
                return Err(unknown_reference(
                    "subscription",
                    &subscription.name,
                    "queue",
                    &subscription.queue,
                ));
            }
            if subscription.event_buffer == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "subscription {} must have a non-zero event_buffer",
                    subscription.name
                )));
            }
        }

        Ok(())
    }
}

fn unique_names<'a>(
    kind: &'static str,
    names: impl Iterator<Item = &'a String>,
) -> Result<HashSet<&'a str>, ConfigError> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name.as_str()) {
            return Err(duplicate(kind, name));
        }
    }
    Ok(seen)
}

fn duplicate(kind: &'static str, name: &str) -> ConfigError {
    ConfigError::DuplicateName {
        kind,
        name: name.to_string(),
    }
}

fn unknown_reference(
    kind: &'static str,
    name: &str,
    referenced_kind: &'static str,
    referenced: &str,
) -> ConfigError {
    ConfigError::UnknownReference {
        kind,
        name: name.to_string(),
        referenced_kind,
        referenced: referenced.to_string(),
    }
}

fn default_true() -> bool {
    true
}

fn default_protocol() -> String {
    "amqp".to_string()
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_amqp_port() -> u16 {
    5672
}

fn default_user() -> String {
    "guest".to_string()
}

fn default_password() -> String {
    "guest".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_backoff_pattern() -> Vec<u64> {
    vec![25, 50, 100, 250]
}

fn default_sustained_delay() -> u64 {
    250
}

fn default_management_protocol() -> String {
    "http".to_string()
}

fn default_management_port() -> u16 {
    15672
}

fn default_management_timeout_ms() -> u64 {
    5_000
}

fn default_binding_key() -> String {
    "#".to_string()
}

fn default_event_buffer() -> usize {
    1024
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[[vhosts]]
name = "v1"
namespace = "ns"

[[vhosts.exchanges]]
name = "e1"

[[vhosts.queues]]
name = "q1"

[[vhosts.bindings]]
name = "b1"
source = "e1"
destination = "q1"

[[vhosts.publications]]
name = "p1"
exchange = "e1"
routing_key = "foo"

[[vhosts.subscriptions]]
name = "s1"
queue = "q1"
"#;

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config = BrokerConfig::from_toml_str(MINIMAL).unwrap();
        let vhost = &config.vhosts[0];

        assert_eq!(vhost.name, "v1");
        assert_eq!(
            vhost.namespace,
            Some(NamespaceSetting::Fixed("ns".to_string()))
        );
        assert_eq!(vhost.mode().unwrap(), ProvisionMode::None);
        assert_eq!(vhost.connection.hostname, "localhost");
        assert_eq!(vhost.connection.port, 5672);
        assert_eq!(vhost.connection.retry.attempts, 5);
        assert_eq!(vhost.connection.management.port, 15672);

        assert_eq!(vhost.exchanges[0].kind, ExchangeType::Topic);
        assert_eq!(vhost.exchanges[0].mode().unwrap(), ProvisionMode::AssertOnly);
        assert!(vhost.queues[0].options.durable);
        assert_eq!(vhost.bindings[0].binding_key, "#");
        assert_eq!(vhost.bindings[0].destination_type, DestinationType::Queue);
        assert_eq!(vhost.subscriptions[0].event_buffer, 1024);
    }

    #[test]
    fn test_generated_namespace_setting() {
        let config = BrokerConfig::from_toml_str(
            r#"
[[vhosts]]
name = "v1"
namespace = true
"#,
        )
        .unwrap();
        assert_eq!(
            config.vhosts[0].namespace,
            Some(NamespaceSetting::Generated(true))
        );
    }

    #[test]
    fn test_provision_mode_resolution() {
        let cases = [
            ((false, false, false), ProvisionMode::None),
            ((true, false, false), ProvisionMode::AssertOnly),
            ((false, true, false), ProvisionMode::CheckOnly),
            ((true, true, false), ProvisionMode::AssertAndCheck),
            ((false, false, true), ProvisionMode::Delete),
        ];
        for ((assert, check, delete), expected) in cases {
            let mode =
                ProvisionMode::from_flags(ObjectKind::Queue, "q", assert, check, delete).unwrap();
            assert_eq!(mode, expected);
        }

        let conflict = ProvisionMode::from_flags(ObjectKind::Vhost, "v1", true, false, true);
        assert!(matches!(conflict, Err(ConfigError::ConflictingFlags { .. })));
    }

    #[test]
    fn test_rejects_duplicate_vhosts() {
        let result = BrokerConfig::from_toml_str(
            r#"
[[vhosts]]
name = "v1"

[[vhosts]]
name = "v1"
"#,
        );
        assert!(matches!(
            result,
            Err(ConfigError::DuplicateName { kind: "vhost", .. })
        ));
    }

    #[test]
    fn test_rejects_duplicate_subscriptions_across_vhosts() {
        let result = BrokerConfig::from_toml_str(
            r#"
[[vhosts]]
name = "v1"
[[vhosts.queues]]
name = "q1"
[[vhosts.subscriptions]]
name = "s1"
queue = "q1"

[[vhosts]]
name = "v2"
[[vhosts.queues]]
name = "q1"
[[vhosts.subscriptions]]
name = "s1"
queue = "q1"
"#,
        );
        assert!(matches!(
            result,
            Err(ConfigError::DuplicateName {
                kind: "subscription",
                ..
            })
        ));
    }

    #[test]
    fn test_rejects_binding_to_unknown_queue() {
        let result = BrokerConfig::from_toml_str(
            r#"
[[vhosts]]
name = "v1"
[[vhosts.exchanges]]
name = "e1"
[[vhosts.bindings]]
name = "b1"
source = "e1"
destination = "missing"
"#,
        );
        match result {
            Err(ConfigError::UnknownReference {
                referenced_kind,
                referenced,
                ..
            }) => {
                assert_eq!(referenced_kind, "queue");
                assert_eq!(referenced, "missing");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_publication_with_two_targets() {
        let result = BrokerConfig::from_toml_str(
            r#"
[[vhosts]]
name = "v1"
[[vhosts.exchanges]]
name = "e1"
[[vhosts.queues]]
name = "q1"
[[vhosts.publications]]
name = "p1"
exchange = "e1"
queue = "q1"
"#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_allows_default_exchange_publication() {
        let result = BrokerConfig::from_toml_str(
            r#"
[[vhosts]]
name = "v1"
[[vhosts.publications]]
name = "p1"
exchange = ""
routing_key = "somewhere"
"#,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_rejects_zero_retry_attempts() {
        let result = BrokerConfig::from_toml_str(
            r#"
[[vhosts]]
name = "v1"
[vhosts.connection.retry]
attempts = 0
"#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_delete_with_assert() {
        let result = BrokerConfig::from_toml_str(
            r#"
[[vhosts]]
name = "v1"
assert = true
delete = true
"#,
        );
        assert!(matches!(result, Err(ConfigError::ConflictingFlags { .. })));
    }

    #[test]
    fn test_publish_options_merge() {
        let base = PublishOptions {
            persistent: Some(true),
            content_type: Some("application/json".to_string()),
            headers: BTreeMap::from([
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ]),
            ..Default::default()
        };
        let overrides = PublishOptions {
            priority: Some(5),
            headers: BTreeMap::from([("b".to_string(), "3".to_string())]),
            ..Default::default()
        };

        let merged = base.merged_with(&overrides);
        assert_eq!(merged.persistent, Some(true));
        assert_eq!(merged.priority, Some(5));
        assert_eq!(merged.content_type.as_deref(), Some("application/json"));
        assert_eq!(merged.headers.get("a").map(String::as_str), Some("1"));
        assert_eq!(merged.headers.get("b").map(String::as_str), Some("3"));
    }
}
