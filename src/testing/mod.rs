//! Test doubles
//!
//! [`InMemoryBroker`] stands in for both a real AMQP broker and its
//! management API, so the whole engine can be exercised without external
//! services.

pub mod in_memory;

pub use in_memory::InMemoryBroker;
