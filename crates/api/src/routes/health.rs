//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;
use store::Store;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub scheduler_running: bool,
}

/// GET /health — returns system health status.
pub async fn check<S: Store>(State(state): State<Arc<AppState<S>>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        scheduler_running: !state.scheduler.cancellation_token().is_cancelled(),
    })
}
