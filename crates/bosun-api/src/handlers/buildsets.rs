//! Buildset handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use bosun_core::buildset::{BuildSet, BuildSetCreated, BuildSetSubmission};
use bosun_core::ids::{BuildRequestId, BuildSetId};
use bosun_core::properties::Properties;
use bosun_core::sourcestamp::SourceStamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{ApiError, api_error, bad_id};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ListBuildSetsParams {
    pub complete: Option<bool>,
}

#[derive(Deserialize)]
pub struct SubmitBuildSetRequest {
    pub builder_names: Vec<String>,
    #[serde(default)]
    pub sourcestamps: Vec<SourceStamp>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    #[serde(default)]
    pub external_idstring: Option<String>,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BuildSetCreatedResponse {
    pub buildset_id: BuildSetId,
    pub requests: Vec<RequestRef>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RequestRef {
    pub builder_name: String,
    pub request_id: BuildRequestId,
}

impl From<BuildSetCreated> for BuildSetCreatedResponse {
    fn from(created: BuildSetCreated) -> Self {
        Self {
            buildset_id: created.buildset_id,
            requests: created
                .requests
                .into_iter()
                .map(|(builder_name, request_id)| RequestRef {
                    builder_name,
                    request_id,
                })
                .collect(),
        }
    }
}

#[derive(Serialize)]
pub struct ListBuildSetsResponse {
    pub buildsets: Vec<BuildSet>,
    pub total: usize,
}

pub async fn submit_buildset(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitBuildSetRequest>,
) -> Result<(StatusCode, Json<BuildSetCreatedResponse>), ApiError> {
    let stamps = if request.sourcestamps.is_empty() {
        vec![SourceStamp::new("")]
    } else {
        request.sourcestamps
    };
    let mut submission = BuildSetSubmission::new(request.builder_names, stamps)
        .with_reason(request.reason.unwrap_or_else(|| "submitted through the API".to_string()))
        .with_properties(Properties::from_values(request.properties, "API"))
        .with_priority(request.priority);
    if let Some(idstring) = request.external_idstring {
        submission = submission.with_external_idstring(idstring);
    }

    let created = state
        .master
        .submit_buildset(submission)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(created.into())))
}

pub async fn list_buildsets(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListBuildSetsParams>,
) -> Result<Json<ListBuildSetsResponse>, ApiError> {
    let buildsets = state
        .master
        .list_buildsets(params.complete)
        .await
        .map_err(api_error)?;
    Ok(Json(ListBuildSetsResponse {
        total: buildsets.len(),
        buildsets,
    }))
}

pub async fn get_buildset(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BuildSet>, ApiError> {
    let id: BuildSetId = id.parse().map_err(|_| bad_id("buildset"))?;
    let buildset = state.master.get_buildset(id).await.map_err(api_error)?;
    Ok(Json(buildset))
}
