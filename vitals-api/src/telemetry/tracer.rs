//! Tracing Subscriber and OpenTelemetry Initialization
//!
//! Structured logs always go to stdout (JSON or pretty). Spans are exported
//! over OTLP/HTTP only when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.

use once_cell::sync::OnceCell;
use opentelemetry::{global, trace::TracerProvider as _, KeyValue};
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
    Resource,
};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vitals_core::env_or;

use crate::config::LogFormat;
use crate::error::{ApiError, ApiResult};

static TRACER_PROVIDER: OnceCell<SdkTracerProvider> = OnceCell::new();

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// OTLP/HTTP collector base URL, e.g. `http://localhost:4318`
    pub otlp_endpoint: Option<String>,
    pub service_name: String,
    pub service_version: String,
    /// production, staging, development
    pub environment: String,
    /// Fraction of traces kept, 0.0 to 1.0
    pub trace_sample_rate: f64,
    pub log_format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            service_name: env_or("OTEL_SERVICE_NAME", "vitals-api".to_string()),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: env_or("VITALS_ENVIRONMENT", "development".to_string()),
            trace_sample_rate: env_or("VITALS_TRACE_SAMPLE_RATE", 1.0),
            log_format: LogFormat::from_env(),
        }
    }
}

impl TelemetryConfig {
    fn sampler(&self) -> Sampler {
        if self.trace_sample_rate >= 1.0 {
            Sampler::AlwaysOn
        } else if self.trace_sample_rate <= 0.0 {
            Sampler::AlwaysOff
        } else {
            Sampler::TraceIdRatioBased(self.trace_sample_rate)
        }
    }
}

/// The HTTP exporter wants the full signal URL.
fn traces_endpoint(base: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.ends_with("/v1/traces") {
        base.to_string()
    } else {
        format!("{}/v1/traces", base)
    }
}

fn build_provider(config: &TelemetryConfig, endpoint: &str) -> ApiResult<SdkTracerProvider> {
    let exporter = SpanExporter::builder()
        .with_http()
        .with_endpoint(traces_endpoint(endpoint))
        .build()
        .map_err(|e| ApiError::internal_error(format!("Failed to create OTLP exporter: {}", e)))?;

    let resource = Resource::builder()
        .with_service_name(config.service_name.clone())
        .with_attributes([
            KeyValue::new("service.version", config.service_version.clone()),
            KeyValue::new("deployment.environment", config.environment.clone()),
        ])
        .build();

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(config.sampler())
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource)
        .build())
}

/// Install the global subscriber. Call once, before anything logs.
pub fn init_tracer(config: &TelemetryConfig) -> ApiResult<()> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            let provider = build_provider(config, endpoint)?;
            let tracer = provider.tracer("vitals-api");
            global::set_tracer_provider(provider.clone());
            let _ = TRACER_PROVIDER.set(provider);
            Some(OpenTelemetryLayer::new(tracer))
        }
        None => None,
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json_layer = (config.log_format == LogFormat::Json)
        .then(|| tracing_subscriber::fmt::layer().json().with_current_span(true));
    let pretty_layer =
        (config.log_format == LogFormat::Pretty).then(|| tracing_subscriber::fmt::layer().pretty());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| ApiError::internal_error(format!("Failed to init subscriber: {}", e)))?;

    tracing::info!(
        service_name = %config.service_name,
        environment = %config.environment,
        otlp_endpoint = ?config.otlp_endpoint,
        log_format = ?config.log_format,
        "Telemetry initialized"
    );
    Ok(())
}

/// Flush pending spans. Call before exit.
pub fn shutdown_tracer() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            tracing::warn!(error = %e, "Tracer shutdown failed");
            return;
        }
    }
    tracing::info!("Tracer shutdown complete");
}
