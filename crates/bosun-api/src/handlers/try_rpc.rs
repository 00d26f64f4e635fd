//! Authenticated try-job submission.

use axum::{Json, extract::State, http::StatusCode};
use axum_extra::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Basic};
use bosun_scheduler::{SchedulerKind, TryCredentials, TryJob};
use serde::Deserialize;
use std::sync::Arc;

use super::buildsets::BuildSetCreatedResponse;
use crate::error::{ApiError, api_error};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct TryRpcRequest {
    /// The `try_userpass` scheduler to submit through.
    pub scheduler: String,
    #[serde(flatten)]
    pub job: TryJob,
}

pub async fn submit_try(
    State(state): State<Arc<AppState>>,
    auth: Option<TypedHeader<Authorization<Basic>>>,
    Json(request): Json<TryRpcRequest>,
) -> Result<(StatusCode, Json<BuildSetCreatedResponse>), ApiError> {
    let Some(TypedHeader(Authorization(basic))) = auth else {
        return Err((StatusCode::UNAUTHORIZED, "Missing credentials".to_string()));
    };
    let kind = state
        .master
        .schedulers()
        .await
        .into_iter()
        .find(|(name, _)| *name == request.scheduler)
        .map(|(_, kind)| kind);
    match kind {
        Some(SchedulerKind::TryUserpass) => {}
        Some(_) => {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("Scheduler {} does not accept try jobs over RPC", request.scheduler),
            ));
        }
        None => {
            return Err((
                StatusCode::NOT_FOUND,
                format!("Scheduler not found: {}", request.scheduler),
            ));
        }
    }

    let credentials = TryCredentials {
        username: basic.username().to_string(),
        password: basic.password().to_string(),
    };
    let created = state
        .master
        .submit_try_job(&request.scheduler, request.job, Some(credentials))
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(created.into())))
}
