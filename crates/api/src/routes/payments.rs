//! Payment gateway confirmation webhook.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use checkout::{ChargeConfirmation, ConfirmationOutcome, StepOutcome};
use serde::Deserialize;
use store::Store;

use crate::error::ApiError;
use crate::state::AppState;

/// Fields read from the gateway's confirmation; the whole body is kept as raw.
#[derive(Deserialize)]
pub struct ConfirmationRequest {
    pub reference: String,
    pub status: String,
    #[serde(default)]
    pub response: Option<String>,
}

/// POST /payments/confirmation — apply a charge status.
///
/// Answers 200 for unknown references as well so the gateway stops
/// retrying; the outcome in the body tells them apart.
#[tracing::instrument(skip(state, body))]
pub async fn confirm<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<ConfirmationOutcome>, ApiError> {
    let req: ConfirmationRequest = serde_json::from_value(body.clone())
        .map_err(|e| ApiError::BadRequest(format!("Invalid confirmation: {e}")))?;

    let outcome = state
        .settlement
        .confirm_payment(ChargeConfirmation {
            external_reference: req.reference,
            status: req.status,
            response: req.response,
            raw: body,
        })
        .await?;
    Ok(Json(outcome))
}

/// POST /payments/:reference/renotify — publish the settlement notification again.
#[tracing::instrument(skip(state))]
pub async fn renotify<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(reference): Path<String>,
) -> Result<Json<StepOutcome>, ApiError> {
    Ok(Json(state.settlement.resend_notification(&reference).await?))
}
