//! Historical backfill through the job queue.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use vitals_core::{JobId, QueryParams};
use vitals_pipeline::QueryService;

use super::json_body;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillRequest {
    pub site: String,
    /// Empty backfills every point of the site.
    #[serde(default)]
    pub points: Vec<String>,
    pub start_ms: i64,
    pub end_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackfillResponse {
    pub job_id: JobId,
    pub status: String,
}

/// POST /api/v1/backfill
pub async fn start_backfill(
    State(service): State<Arc<QueryService>>,
    body: Result<Json<BackfillRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let request = json_body(body)?;
    let params = QueryParams::new(request.site, request.points, request.start_ms, request.end_ms);
    let job_id = service.backfill(params).await?;
    let status = service
        .job_status(job_id)
        .await?
        .map(|v| v.status.to_string())
        .unwrap_or_else(|| "queued".to_string());
    Ok((StatusCode::ACCEPTED, Json(BackfillResponse { job_id, status })))
}

pub fn create_router() -> Router<AppState> {
    Router::new().route("/backfill", post(start_backfill))
}
