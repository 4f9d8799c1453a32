//! Point registry endpoints.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use vitals_core::{CoverageReport, PointRecord};
use vitals_pipeline::{PointRegistry, SeedReport};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageQuery {
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
}

/// POST /api/v1/sites/{site}/points/seed
///
/// Registers every point the upstream has configured for the site.
pub async fn seed_points(
    State(registry): State<Arc<PointRegistry>>,
    Path(site): Path<String>,
) -> ApiResult<Json<SeedReport>> {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    Ok(Json(registry.seed(&site, &cancel).await?))
}

/// GET /api/v1/sites/{site}/points
pub async fn list_points(
    State(registry): State<Arc<PointRegistry>>,
    Path(site): Path<String>,
) -> ApiResult<Json<Vec<PointRecord>>> {
    Ok(Json(registry.list(&site).await?))
}

/// GET /api/v1/sites/{site}/coverage?startMs=..&endMs=..
pub async fn coverage(
    State(registry): State<Arc<PointRegistry>>,
    Path(site): Path<String>,
    Query(query): Query<CoverageQuery>,
) -> ApiResult<Json<CoverageReport>> {
    let start_ms = query.start_ms.ok_or_else(|| ApiError::missing_field("startMs"))?;
    let end_ms = query.end_ms.ok_or_else(|| ApiError::missing_field("endMs"))?;
    Ok(Json(registry.coverage(&site, start_ms, end_ms).await?))
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/sites/:site/points", get(list_points))
        .route("/sites/:site/points/seed", post(seed_points))
        .route("/sites/:site/coverage", get(coverage))
}
