//! Mapping of core errors onto HTTP status codes.

use axum::http::StatusCode;
use bosun_core::Error;

/// Handler error: a status code and a message body.
pub type ApiError = (StatusCode, String);

pub fn status_for(error: &Error) -> StatusCode {
    match error {
        e if e.is_not_found() => StatusCode::NOT_FOUND,
        e if e.is_contention() => StatusCode::CONFLICT,
        Error::InvalidInput(_)
        | Error::MalformedJob(_)
        | Error::Unmergeable(_)
        | Error::NotTriggerable(_)
        | Error::Serialization(_) => StatusCode::BAD_REQUEST,
        Error::BuilderNotAllowed { .. } => StatusCode::FORBIDDEN,
        Error::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
        Error::SchedulerStopped(_) | Error::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn api_error(error: Error) -> ApiError {
    let status = status_for(&error);
    if status.is_server_error() {
        tracing::error!(error = %error, "Request failed");
    }
    (status, error.to_string())
}

pub(crate) fn bad_id(kind: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, format!("Invalid {kind} ID"))
}
