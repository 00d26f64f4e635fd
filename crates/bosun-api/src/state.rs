//! Application state shared across handlers.

use bosun_scheduler::Master;
use std::sync::Arc;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub master: Arc<Master>,
}

impl AppState {
    pub fn new(master: Arc<Master>) -> Self {
        Self { master }
    }
}
