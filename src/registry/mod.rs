//! Named publication and subscription entries
//!
//! Both registries are built once from the configuration and the resolved
//! topology, and are immutable afterwards. Lookups are pure.
//!
//! Besides explicitly declared entries, each registry synthesizes
//! auto-created entries so every declared queue can be consumed, and every
//! declared exchange or queue published to, without extra configuration.

pub mod publications;
pub mod subscriptions;

pub use publications::{PublicationRegistry, PublicationTarget, ResolvedPublication};
pub use subscriptions::{ResolvedSubscription, SubscriptionRegistry};
