//! API route definitions.

use axum::{
    Router, middleware,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::handlers::{buildrequests, builds, buildsets, changes, health, schedulers, try_rpc, workers};
use crate::middleware::{cors_layer, request_id};
use crate::state::AppState;

/// Create the main API router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api/v1", api_routes())
        .route("/try", post(try_rpc::submit_try))
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .layer(middleware::from_fn(request_id))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .with_state(state)
}

fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/changes", post(changes::add_change))
        .nest("/buildsets", buildset_routes())
        .nest("/buildrequests", buildrequest_routes())
        .nest("/builds", build_routes())
        .nest("/schedulers", scheduler_routes())
        .route(
            "/builders/{builder}/workers/{worker}/idle",
            post(workers::worker_idle),
        )
        .route("/workers/{worker}/disconnected", post(workers::worker_disconnected))
}

fn buildset_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/",
            get(buildsets::list_buildsets).post(buildsets::submit_buildset),
        )
        .route("/{id}", get(buildsets::get_buildset))
}

fn buildrequest_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(buildrequests::list_build_requests))
        .route("/{id}", get(buildrequests::get_build_request))
        .route("/{id}/cancel", post(buildrequests::cancel_build_request))
        .route("/{id}/rejected", post(buildrequests::build_rejected))
}

fn build_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(builds::list_running))
        .route("/{id}/finished", post(builds::build_finished))
        .route("/{id}/cancel", post(builds::cancel_build))
}

fn scheduler_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(schedulers::list_schedulers))
        .route("/{name}/trigger", post(schedulers::trigger))
}
