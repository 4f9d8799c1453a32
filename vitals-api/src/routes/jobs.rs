//! Job status, cancellation and dead-letter endpoints.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use uuid::Uuid;
use vitals_core::DeadLetterRecord;
use vitals_pipeline::{JobStatusView, QueryService};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const DEFAULT_DEAD_LETTER_LIMIT: usize = 100;
const MAX_DEAD_LETTER_LIMIT: usize = 1_000;

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub limit: Option<usize>,
}

/// GET /api/v1/jobs/{id}
pub async fn get_job(
    State(service): State<Arc<QueryService>>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobStatusView>> {
    let id = Uuid::parse_str(&id)?;
    service
        .job_status(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::job_not_found(id))
}

/// POST /api/v1/jobs/{id}/cancel
///
/// Cancellation is cooperative: the worker notices the flag at its next
/// checkpoint, so the job may still read `processing` for a moment.
pub async fn cancel_job(
    State(service): State<Arc<QueryService>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let id = Uuid::parse_str(&id)?;
    let Some(current) = service.job_status(id).await? else {
        return Err(ApiError::job_not_found(id));
    };
    if !service.cancel_job(id).await? {
        return Err(ApiError::state_conflict(format!(
            "Job {} is already {}",
            id, current.status
        )));
    }
    let view = service
        .job_status(id)
        .await?
        .ok_or_else(|| ApiError::job_not_found(id))?;
    Ok((StatusCode::ACCEPTED, Json(view)))
}

/// GET /api/v1/jobs/dead-letters?limit=N
pub async fn list_dead_letters(
    State(service): State<Arc<QueryService>>,
    Query(query): Query<DeadLetterQuery>,
) -> ApiResult<Json<Vec<DeadLetterRecord>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_DEAD_LETTER_LIMIT)
        .clamp(1, MAX_DEAD_LETTER_LIMIT);
    Ok(Json(service.dead_letters(limit).await?))
}

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/jobs/dead-letters", get(list_dead_letters))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/cancel", post(cancel_job))
}
