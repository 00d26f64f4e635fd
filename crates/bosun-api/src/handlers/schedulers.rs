//! Scheduler handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use bosun_core::buildset::Results;
use bosun_core::ids::BuildSetId;
use bosun_scheduler::TriggerRequest;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::buildsets::BuildSetCreatedResponse;
use crate::error::{ApiError, api_error};
use crate::state::AppState;

#[derive(Serialize)]
pub struct SchedulerResponse {
    pub name: String,
    pub kind: String,
}

#[derive(Deserialize)]
pub struct TriggerParams {
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TriggerResultResponse {
    pub buildset_id: BuildSetId,
    pub results: Results,
}

pub async fn list_schedulers(State(state): State<Arc<AppState>>) -> Json<Vec<SchedulerResponse>> {
    let schedulers = state
        .master
        .schedulers()
        .await
        .into_iter()
        .map(|(name, kind)| SchedulerResponse {
            name,
            kind: kind.to_string(),
        })
        .collect();
    Json(schedulers)
}

/// Fire a triggerable scheduler. With `?wait=true` the response carries the
/// buildset's final result.
pub async fn trigger(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(params): Query<TriggerParams>,
    body: Option<Json<TriggerRequest>>,
) -> Result<Response, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let handle = state.master.trigger(&name, request).await.map_err(api_error)?;

    if !params.wait {
        let created = BuildSetCreatedResponse::from(bosun_core::buildset::BuildSetCreated {
            buildset_id: handle.buildset_id,
            requests: handle.requests.clone(),
        });
        return Ok((StatusCode::CREATED, Json(created)).into_response());
    }

    let buildset_id = handle.buildset_id;
    let results = handle.wait().await.map_err(api_error)?;
    Ok(Json(TriggerResultResponse {
        buildset_id,
        results,
    })
    .into_response())
}
