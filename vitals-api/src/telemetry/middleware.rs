//! Axum Middleware for HTTP Request Tracing and Metrics
//!
//! Every request gets a server span (continuing a W3C `traceparent` when the
//! caller sent one), a Prometheus observation and a completion log line.

use axum::{extract::Request, http::HeaderMap, middleware::Next, response::Response};
use once_cell::sync::Lazy;
use opentelemetry::{global, Context};
use opentelemetry_http::HeaderExtractor;
use regex::Regex;
use std::time::Instant;
use tracing::{info_span, Instrument};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use super::metrics::metrics;

static UUID_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}").ok()
});

static NUMERIC_ID_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"/\d+(/|$)").ok());

fn extract_trace_context(headers: &HeaderMap) -> Context {
    global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor(headers)))
}

/// Replace UUIDs and numeric ids with `{id}` to keep label cardinality bounded.
fn normalize_path(path: &str) -> String {
    let mut result = path.to_string();
    if let Some(re) = UUID_PATTERN.as_ref() {
        result = re.replace_all(&result, "{id}").into_owned();
    }
    if let Some(re) = NUMERIC_ID_PATTERN.as_ref() {
        result = re.replace_all(&result, "/{id}$1").into_owned();
    }
    result
}

pub async fn observability_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let normalized_path = normalize_path(&path);

    let span = info_span!(
        "http_request",
        otel.name = %format!("{} {}", method, normalized_path),
        otel.kind = "server",
        http.method = %method,
        http.target = %path,
        http.route = %normalized_path,
        http.status_code = tracing::field::Empty,
    );
    // Continue the caller's trace; a missing or invalid header starts a new one.
    let _ = span.set_parent(extract_trace_context(request.headers()));

    let response = next.run(request).instrument(span.clone()).await;

    let duration = start.elapsed();
    let status = response.status();
    span.record("http.status_code", status.as_u16());

    if let Some(m) = metrics() {
        m.record_http_request(
            method.as_str(),
            &normalized_path,
            status.as_u16(),
            duration.as_secs_f64(),
        );
    }

    tracing::info!(
        parent: &span,
        method = %method,
        path = %path,
        status = status.as_u16(),
        duration_ms = duration.as_millis() as u64,
        "Request completed"
    );

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_uuid() {
        let path = "/api/v1/jobs/0190a5d2-7c4e-7b3a-9f1e-2d4c6b8a0e1f";
        assert_eq!(normalize_path(path), "/api/v1/jobs/{id}");
    }

    #[test]
    fn test_normalize_path_uuid_with_suffix() {
        let path = "/api/v1/jobs/0190a5d2-7c4e-7b3a-9f1e-2d4c6b8a0e1f/cancel";
        assert_eq!(normalize_path(path), "/api/v1/jobs/{id}/cancel");
    }

    #[test]
    fn test_normalize_path_numeric_id() {
        assert_eq!(normalize_path("/api/v1/items/12345"), "/api/v1/items/{id}");
    }

    #[test]
    fn test_normalize_path_no_ids() {
        assert_eq!(normalize_path("/api/v1/query"), "/api/v1/query");
        assert_eq!(normalize_path("/health/ready"), "/health/ready");
    }

    proptest::proptest! {
        #[test]
        fn prop_job_ids_collapse_to_one_label(id in proptest::num::u128::ANY, cancel in proptest::bool::ANY) {
            let uuid = uuid::Uuid::from_u128(id);
            let suffix = if cancel { "/cancel" } else { "" };
            let path = format!("/api/v1/jobs/{}{}", uuid, suffix);
            proptest::prop_assert_eq!(normalize_path(&path), format!("/api/v1/jobs/{{id}}{}", suffix));
        }
    }
}
