//! REST API Routes Module
//!
//! - `/api/v1/query` - range queries across the raw and aggregated tiers
//! - `/api/v1/backfill` - queue historical ingestion
//! - `/api/v1/jobs/*` - job status, cancellation and dead letters
//! - `/api/v1/cache/*` - invalidation and statistics
//! - `/api/v1/sites/{site}/*` - point registry seeding, listing and coverage
//! - `/health/*` - Kubernetes-compatible probes
//! - `/metrics` - Prometheus scrape endpoint

pub mod backfill;
pub mod cache;
pub mod health;
pub mod jobs;
pub mod points;
pub mod query;

use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit},
    http::{header, HeaderValue, Method, Uri},
    middleware,
    routing::get,
    Json, Router,
};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;

use crate::config::ApiConfig;
use crate::error::{ApiError, ApiResult, ErrorCode};
use crate::state::AppState;
use crate::telemetry::{metrics_handler, observability_middleware};

/// Unwrap a JSON body, turning axum's rejection into our error envelope.
pub(crate) fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => Err(ApiError::invalid_input(rejection.body_text())),
    }
}

async fn route_not_found(uri: Uri) -> ApiError {
    ApiError::new(ErrorCode::EntityNotFound, format!("No route for {}", uri.path()))
}

fn build_cors_layer(config: &ApiConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .max_age(Duration::from_secs(config.cors_max_age_secs));

    if config.cors_origins.is_empty() {
        tracing::info!("CORS: allowing all origins");
        cors.allow_origin(Any)
    } else {
        tracing::info!("CORS: allowing origins: {:?}", config.cors_origins);
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        cors.allow_origin(origins)
    }
}

/// Versioned API routes, state not yet attached.
pub fn api_v1_router() -> Router<AppState> {
    Router::new()
        .merge(query::create_router())
        .merge(backfill::create_router())
        .merge(jobs::create_router())
        .merge(cache::create_router())
        .merge(points::create_router())
}

/// Full application router with middleware and state.
pub fn create_api_router(state: AppState, config: &ApiConfig) -> Router {
    Router::new()
        .nest("/api/v1", api_v1_router())
        .nest("/health", health::create_router())
        .route("/metrics", get(metrics_handler))
        .fallback(route_not_found)
        .layer(
            ServiceBuilder::new()
                .layer(build_cors_layer(config))
                .layer(middleware::from_fn(observability_middleware))
                .layer(TimeoutLayer::new(config.request_timeout))
                .layer(DefaultBodyLimit::max(config.max_body_bytes)),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cors_layer_builds_for_both_modes() {
        let mut config = ApiConfig::default();
        let _ = build_cors_layer(&config);
        config.cors_origins = vec!["https://ops.example.com".into(), "not a header\n".into()];
        let _ = build_cors_layer(&config);
    }
}
