//! Query endpoint.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use tokio_util::sync::CancellationToken;
use vitals_pipeline::{QueryRequest, QueryService, QueryStatus};

use super::json_body;
use crate::error::ApiResult;
use crate::state::AppState;

/// POST /api/v1/query
///
/// 200 with series when the data could be served inline, 202 with a job id
/// when the request was queued.
pub async fn run_query(
    State(service): State<Arc<QueryService>>,
    body: Result<Json<QueryRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let request = json_body(body)?;

    // A dropped request (client gone, timeout layer) cancels upstream work.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let response = service.query(&request, &cancel).await?;
    tracing::debug!(
        site = %request.site,
        points = request.points.len(),
        source = ?response.source,
        samples = response.sample_count(),
        "Query answered"
    );

    let status = match response.status {
        QueryStatus::Complete => StatusCode::OK,
        QueryStatus::Processing => StatusCode::ACCEPTED,
    };
    Ok((status, Json(response)).into_response())
}

pub fn create_router() -> Router<AppState> {
    Router::new().route("/query", post(run_query))
}
