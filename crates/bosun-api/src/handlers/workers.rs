//! Worker availability handlers.

use axum::{
    extract::{Path, State},
    http::StatusCode,
};
use std::sync::Arc;

use crate::error::{ApiError, api_error};
use crate::state::AppState;

pub async fn worker_idle(
    State(state): State<Arc<AppState>>,
    Path((builder, worker)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state
        .master
        .worker_became_idle(Some(&builder), &worker)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn worker_disconnected(
    State(state): State<Arc<AppState>>,
    Path(worker): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.master.worker_disconnected(&worker).map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}
