//! VITALS Telemetry - Observability Infrastructure
//!
//! Structured logging with optional OTLP trace export, Prometheus metrics
//! and the request middleware that ties them together.

pub mod metrics;
pub mod middleware;
pub mod tracer;
pub mod upstream;

pub use metrics::{metrics, metrics_handler, VitalsMetrics, METRICS};
pub use middleware::observability_middleware;
pub use tracer::{init_tracer, shutdown_tracer, TelemetryConfig};
pub use upstream::MeteredUpstream;
