//! Physical naming of broker objects
//!
//! Every exchange and queue presented to the broker is named
//! `namespace:logicalName`. The qualification is a pure function of its
//! inputs and is passed by value to the components that need it.

use crate::config::NamespaceSetting;

/// Separator between namespace and logical name
pub const NAMESPACE_SEPARATOR: char = ':';

/// Qualify a logical name with an optional namespace
///
/// The empty name addresses the AMQP default exchange and is never
/// qualified.
pub fn qualify(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(namespace) if !name.is_empty() => {
            format!("{namespace}{NAMESPACE_SEPARATOR}{name}")
        }
        _ => name.to_string(),
    }
}

/// Namespace resolved for a single vhost
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Namespace(Option<String>);

impl Namespace {
    /// No prefix: physical names equal logical names
    pub fn none() -> Self {
        Self(None)
    }

    pub fn fixed<S: Into<String>>(namespace: S) -> Self {
        Self(Some(namespace.into()))
    }

    /// Resolve a configured namespace; `true` yields a fresh UUID
    pub fn resolve(setting: Option<&NamespaceSetting>) -> Self {
        match setting {
            Some(NamespaceSetting::Fixed(namespace)) => Self::fixed(namespace.clone()),
            Some(NamespaceSetting::Generated(true)) => Self::fixed(uuid::Uuid::new_v4().to_string()),
            Some(NamespaceSetting::Generated(false)) | None => Self::none(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn qualify(&self, name: &str) -> String {
        qualify(self.as_str(), name)
    }
}
