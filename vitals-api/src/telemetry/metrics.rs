//! Prometheus Metrics Definitions
//!
//! Every VITALS metric, registered once in the default registry, and the
//! `/metrics` scrape handler.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge_vec, CounterVec, Encoder,
    HistogramVec, IntGaugeVec, TextEncoder,
};
use vitals_core::JobStatus;
use vitals_storage::cache::{CacheStats, TieredStats};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// HTTP request latency buckets (seconds)
const HTTP_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Upstream page latency buckets (seconds); pages are slow and retried.
const UPSTREAM_LATENCY_BUCKETS: &[f64] =
    &[0.010, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Global metrics instance - initialized on first use
pub static METRICS: Lazy<ApiResult<VitalsMetrics>> = Lazy::new(VitalsMetrics::new);

/// The registered metrics, if registration succeeded.
pub fn metrics() -> Option<&'static VitalsMetrics> {
    METRICS.as_ref().ok()
}

fn registration_error(name: &str, err: prometheus::Error) -> ApiError {
    ApiError::internal_error(format!("Failed to register {}: {}", name, err))
}

#[derive(Clone)]
pub struct VitalsMetrics {
    /// labels: method, path, status
    pub http_requests_total: CounterVec,

    /// labels: method, path
    pub http_request_duration_seconds: HistogramVec,

    /// labels: operation (page, sites), tier, outcome
    pub upstream_requests_total: CounterVec,

    /// labels: operation, tier
    pub upstream_request_duration_seconds: HistogramVec,

    /// Cumulative cache counters, refreshed from the cache at scrape time.
    /// labels: level (l1, l2), outcome (hit, miss, eviction, expired)
    pub cache_lookups: IntGaugeVec,

    /// labels: level, kind (entries, bytes)
    pub cache_size: IntGaugeVec,

    /// labels: status
    pub job_transitions_total: CounterVec,

    /// labels: source (sync, query)
    pub samples_ingested_total: CounterVec,

    /// labels: source
    pub samples_dropped_total: CounterVec,
}

impl VitalsMetrics {
    pub fn new() -> ApiResult<Self> {
        Ok(Self {
            http_requests_total: register_counter_vec!(
                "vitals_http_requests_total",
                "Total number of HTTP requests",
                &["method", "path", "status"]
            )
            .map_err(|e| registration_error("http_requests_total", e))?,

            http_request_duration_seconds: register_histogram_vec!(
                "vitals_http_request_duration_seconds",
                "HTTP request duration in seconds",
                &["method", "path"],
                HTTP_LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| registration_error("http_request_duration_seconds", e))?,

            upstream_requests_total: register_counter_vec!(
                "vitals_upstream_requests_total",
                "Upstream API requests by outcome",
                &["operation", "tier", "outcome"]
            )
            .map_err(|e| registration_error("upstream_requests_total", e))?,

            upstream_request_duration_seconds: register_histogram_vec!(
                "vitals_upstream_request_duration_seconds",
                "Upstream API request duration in seconds, retries included",
                &["operation", "tier"],
                UPSTREAM_LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| registration_error("upstream_request_duration_seconds", e))?,

            cache_lookups: register_int_gauge_vec!(
                "vitals_cache_lookups",
                "Cache lookups and removals since start, by level and outcome",
                &["level", "outcome"]
            )
            .map_err(|e| registration_error("cache_lookups", e))?,

            cache_size: register_int_gauge_vec!(
                "vitals_cache_size",
                "Current cache entries and bytes by level",
                &["level", "kind"]
            )
            .map_err(|e| registration_error("cache_size", e))?,

            job_transitions_total: register_counter_vec!(
                "vitals_job_transitions_total",
                "Job state transitions by resulting status",
                &["status"]
            )
            .map_err(|e| registration_error("job_transitions_total", e))?,

            samples_ingested_total: register_counter_vec!(
                "vitals_samples_ingested_total",
                "Samples written to storage",
                &["source"]
            )
            .map_err(|e| registration_error("samples_ingested_total", e))?,

            samples_dropped_total: register_counter_vec!(
                "vitals_samples_dropped_total",
                "Upstream samples dropped during normalization",
                &["source"]
            )
            .map_err(|e| registration_error("samples_dropped_total", e))?,
        })
    }

    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let status_str = status.to_string();
        self.http_requests_total
            .with_label_values(&[method, path, &status_str])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, path])
            .observe(duration_secs);
    }

    pub fn record_upstream_request(
        &self,
        operation: &str,
        tier: &str,
        outcome: &str,
        duration_secs: f64,
    ) {
        self.upstream_requests_total
            .with_label_values(&[operation, tier, outcome])
            .inc();
        self.upstream_request_duration_seconds
            .with_label_values(&[operation, tier])
            .observe(duration_secs);
    }

    pub fn record_job_transition(&self, status: JobStatus) {
        self.job_transitions_total
            .with_label_values(&[status.as_db_str()])
            .inc();
    }

    pub fn record_samples(&self, source: &str, written: u64, dropped: u64) {
        if written > 0 {
            self.samples_ingested_total
                .with_label_values(&[source])
                .inc_by(written as f64);
        }
        if dropped > 0 {
            self.samples_dropped_total
                .with_label_values(&[source])
                .inc_by(dropped as f64);
        }
    }

    /// Copy cache statistics into the cache gauges.
    pub fn observe_cache(&self, stats: &TieredStats) {
        self.observe_level("l1", &stats.l1);
        if let Some(l2) = &stats.l2 {
            self.observe_level("l2", l2);
        }
    }

    fn observe_level(&self, level: &str, stats: &CacheStats) {
        for (outcome, value) in [
            ("hit", stats.hits),
            ("miss", stats.misses),
            ("eviction", stats.evictions),
            ("expired", stats.expired),
        ] {
            self.cache_lookups
                .with_label_values(&[level, outcome])
                .set(gauge_value(value));
        }
        self.cache_size
            .with_label_values(&[level, "entries"])
            .set(gauge_value(stats.entries));
        self.cache_size
            .with_label_values(&[level, "bytes"])
            .set(gauge_value(stats.bytes));
    }
}

fn gauge_value(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Handler for GET /metrics.
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    if let Some(m) = metrics() {
        match state.cache.stats().await {
            Ok(stats) => m.observe_cache(&stats),
            Err(e) => tracing::warn!(error = %e, "Cache stats unavailable for scrape"),
        }
    }

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [(
                axum::http::header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            buffer,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            ApiError::internal_error("Failed to encode metrics").into_response()
        }
    }
}
