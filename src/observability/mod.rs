//! Observability: structured logging and delivery counters

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
pub use metrics::{DeliveryStats, StatsSnapshot};

// Span macros for structured logging
pub use logging::{lifecycle_span, mqtt_span, publish_span};
