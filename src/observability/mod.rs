//! Observability: structured logging and in-process metrics
//!
//! The HTTP probes that expose these live in [`crate::http`].

pub mod logging;
pub mod metrics;

pub use logging::{LogFormat, init_default_logging, init_logging};
pub use metrics::{MetricsCollector, MetricsSnapshot, metrics};

// Span macros for structured logging
pub use logging::{lifecycle_span, mqtt_span, worker_span};
