use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use tracing::info;

use crate::queue::{FailedJob, Stage};
use crate::state::AppState;
use crate::utils::error::ApiError;
use crate::vault::secrets_match;

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";
const MAX_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct FailedJobsQuery {
    pub stage: Option<String>,
    pub limit: Option<usize>,
}

/// Dead-lettered jobs, newest first, for one stage or all of them.
pub async fn failed_jobs_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<FailedJobsQuery>,
) -> Result<Json<Vec<FailedJob>>, ApiError> {
    let Some(expected) = state.settings.server.admin_token.as_deref() else {
        return Err(ApiError::NotFound("admin endpoints are disabled".to_string()));
    };
    let provided = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("Missing X-Admin-Token header".to_string()))?;
    if !secrets_match(expected, provided) {
        return Err(ApiError::Unauthorized("Invalid admin token".to_string()));
    }

    let stages = match query.stage.as_deref() {
        Some(stage) => vec![stage.parse::<Stage>().map_err(ApiError::BadRequest)?],
        None => Stage::ALL.to_vec(),
    };
    let limit = query.limit.unwrap_or(50).min(MAX_LIMIT);

    let queue = state.pipeline.queue();
    let mut failed = Vec::new();
    for stage in stages {
        failed.extend(queue.failed(stage, limit).await?);
    }
    failed.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));
    failed.truncate(limit);

    info!(count = failed.len(), "Listed failed jobs");
    Ok(Json(failed))
}
