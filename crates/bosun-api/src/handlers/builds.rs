//! Running build handlers.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use bosun_core::buildset::Results;
use bosun_core::ids::BuildId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{ApiError, api_error, bad_id};
use crate::state::AppState;

#[derive(Serialize)]
pub struct RunningBuildResponse {
    pub build_id: String,
    pub builder: String,
    pub worker: String,
    pub request_ids: Vec<String>,
    pub started_at: String,
}

#[derive(Deserialize)]
pub struct BuildFinishedRequest {
    pub results: Results,
}

#[derive(Deserialize, Default)]
pub struct CancelBuildRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn list_running(State(state): State<Arc<AppState>>) -> Json<Vec<RunningBuildResponse>> {
    let builds = state
        .master
        .running_builds()
        .into_iter()
        .map(|b| RunningBuildResponse {
            build_id: b.build_id.to_string(),
            request_ids: b.request_ids().iter().map(|id| id.to_string()).collect(),
            builder: b.builder,
            worker: b.worker,
            started_at: b.started_at.to_rfc3339(),
        })
        .collect();
    Json(builds)
}

pub async fn build_finished(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<BuildFinishedRequest>,
) -> Result<StatusCode, ApiError> {
    let id: BuildId = id.parse().map_err(|_| bad_id("build"))?;
    state
        .master
        .build_finished(id, request.results)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn cancel_build(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<CancelBuildRequest>>,
) -> Result<StatusCode, ApiError> {
    let id: BuildId = id.parse().map_err(|_| bad_id("build"))?;
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "cancelled through the API".to_string());
    state
        .master
        .cancel_build(id, &reason)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::ACCEPTED)
}
