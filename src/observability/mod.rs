//! Observability: structured logging, process-wide metrics and the optional
//! HTTP health endpoint.

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::HealthServer;
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

pub use logging::{rpc_span, session_span, telemetry_span};
