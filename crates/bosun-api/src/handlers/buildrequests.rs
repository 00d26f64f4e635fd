//! Build request handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use bosun_core::buildset::{BuildRequest, BuildRequestFilter};
use bosun_core::ids::{BuildRequestId, BuildSetId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{ApiError, api_error, bad_id};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ListBuildRequestsParams {
    pub builder: Option<String>,
    pub buildset: Option<String>,
    pub claimed: Option<bool>,
    pub complete: Option<bool>,
}

#[derive(Serialize)]
pub struct ListBuildRequestsResponse {
    pub requests: Vec<BuildRequest>,
    pub total: usize,
}

#[derive(Deserialize, Default)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

fn parse_id(id: &str) -> Result<BuildRequestId, ApiError> {
    id.parse().map_err(|_| bad_id("build request"))
}

pub async fn list_build_requests(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListBuildRequestsParams>,
) -> Result<Json<ListBuildRequestsResponse>, ApiError> {
    let buildset_id = params
        .buildset
        .as_deref()
        .map(str::parse::<BuildSetId>)
        .transpose()
        .map_err(|_| bad_id("buildset"))?;
    let filter = BuildRequestFilter {
        builder_name: params.builder,
        buildset_id,
        claimed: params.claimed,
        complete: params.complete,
        claimed_by: None,
    };
    let requests = state
        .master
        .list_build_requests(&filter)
        .await
        .map_err(api_error)?;
    Ok(Json(ListBuildRequestsResponse {
        total: requests.len(),
        requests,
    }))
}

pub async fn get_build_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BuildRequest>, ApiError> {
    let request = state
        .master
        .get_build_request(parse_id(&id)?)
        .await
        .map_err(api_error)?;
    Ok(Json(request))
}

pub async fn cancel_build_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<CancelRequest>>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "cancelled through the API".to_string());
    state
        .master
        .cancel_build_request(id, &reason)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::ACCEPTED)
}

/// The execution layer could not start the build holding this request.
pub async fn build_rejected(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .master
        .worker_rejected_build(parse_id(&id)?)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}
