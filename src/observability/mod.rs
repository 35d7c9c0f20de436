//! Observability: structured logging and per-broker metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
pub use metrics::{BrokerMetrics, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{broker_span, session_span, vhost_span};
