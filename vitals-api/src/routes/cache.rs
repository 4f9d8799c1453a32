//! Cache administration endpoints.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use vitals_pipeline::QueryService;
use vitals_storage::{cache::TieredStats, TieredCache};

use super::json_body;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateRequest {
    pub site: String,
    /// Only entries covering a point with this prefix; absent clears the site.
    #[serde(default)]
    pub point_prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvalidateResponse {
    pub removed: u64,
}

/// POST /api/v1/cache/invalidate
pub async fn invalidate(
    State(service): State<Arc<QueryService>>,
    body: Result<Json<InvalidateRequest>, JsonRejection>,
) -> ApiResult<Json<InvalidateResponse>> {
    let request = json_body(body)?;
    let site = request.site.trim();
    if site.is_empty() {
        return Err(ApiError::missing_field("site"));
    }
    let prefix = request.point_prefix.as_deref().map(str::trim);
    let removed = service.invalidate(site, prefix).await?;
    tracing::info!(site, point_prefix = ?prefix, removed, "Cache invalidated");
    Ok(Json(InvalidateResponse { removed }))
}

/// GET /api/v1/cache/stats
pub async fn stats(State(cache): State<Arc<TieredCache>>) -> ApiResult<Json<TieredStats>> {
    Ok(Json(cache.stats().await?))
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/cache/invalidate", post(invalidate))
        .route("/cache/stats", get(stats))
}
