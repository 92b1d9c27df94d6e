//! Delivery queue endpoints: comment intake, depth and dead letters.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use queue::{DeadLetter, QueueStats, Topic};
use serde::{Deserialize, Serialize};
use store::Store;

use crate::error::ApiError;
use crate::state::AppState;

const DEFAULT_DEAD_LETTER_LIMIT: usize = 50;
const MAX_DEAD_LETTER_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct QueuedResponse {
    pub queued: bool,
    pub topic: String,
}

/// POST /comments — queue a comment body for the chat listener, as is.
///
/// The body is stored verbatim; bodies that are not JSON end up in the
/// dead-letter log when the consumer reaches them.
#[tracing::instrument(skip(state, body))]
pub async fn comment<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    body: String,
) -> Result<(StatusCode, Json<QueuedResponse>), ApiError> {
    let topic = Topic::comment();
    if !state.queue.enqueue_raw(topic.clone(), body).await {
        return Err(ApiError::Internal("comment could not be queued".to_string()));
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(QueuedResponse {
            queued: true,
            topic: topic.to_string(),
        }),
    ))
}

/// GET /queue/stats — live queue depth per topic.
#[tracing::instrument(skip(state))]
pub async fn stats<S: Store>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<QueueStats>, ApiError> {
    Ok(Json(state.queue.stats().await?))
}

/// GET /queue/dead-letters?limit= — most recent dead letters first.
#[tracing::instrument(skip(state))]
pub async fn dead_letters<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<Vec<DeadLetter>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_DEAD_LETTER_LIMIT)
        .min(MAX_DEAD_LETTER_LIMIT);
    Ok(Json(state.queue.dead_letters(limit).await?))
}
