//! Change handlers.

use axum::{Json, extract::State, http::StatusCode};
use bosun_core::change::{Change, NewChange};
use std::sync::Arc;

use crate::error::{ApiError, api_error};
use crate::state::AppState;

pub async fn add_change(
    State(state): State<Arc<AppState>>,
    Json(change): Json<NewChange>,
) -> Result<(StatusCode, Json<Change>), ApiError> {
    let change = state.master.add_change(change).await.map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(change)))
}
