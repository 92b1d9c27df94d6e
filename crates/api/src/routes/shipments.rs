//! Shipment status and carrier tracking endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use checkout::{CheckoutError, StatusChange, TrackingReport};
use domain::Shipment;
use serde::{Deserialize, Serialize};
use store::Store;

use crate::error::ApiError;
use crate::state::AppState;

// -- Request types --

#[derive(Deserialize)]
pub struct StatusRequest {
    pub status: String,
}

/// Carrier webhook body. Only the fields used are read.
#[derive(Deserialize)]
pub struct WebhookRequest {
    #[serde(rename = "guia")]
    pub tracking_number: Option<String>,
    #[serde(rename = "transportadora")]
    pub carrier: Option<WebhookCarrier>,
    #[serde(rename = "origenCreacion")]
    pub stage: Option<i64>,
}

#[derive(Deserialize)]
pub struct WebhookCarrier {
    #[serde(rename = "nombre")]
    pub name: Option<String>,
}

// -- Response types --

#[derive(Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    ShipmentNotFound {
        tracking_number: String,
    },
    Recorded {
        tracking_number: String,
        #[serde(flatten)]
        change: StatusChange,
    },
}

// -- Handlers --

/// PATCH /shipments/status/:tracking — set a shipment's status by hand.
#[tracing::instrument(skip(state, req))]
pub async fn update_status<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(tracking): Path<String>,
    Json(req): Json<StatusRequest>,
) -> Result<Json<StatusChange>, ApiError> {
    Ok(Json(state.tracker.update_status(&tracking, &req.status).await?))
}

/// POST /shipments/tracking-webhook — apply a carrier status push.
///
/// Unknown tracking numbers answer 200 so the carrier stops retrying.
#[tracing::instrument(skip(state, req))]
pub async fn webhook<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<WebhookRequest>,
) -> Result<Json<WebhookOutcome>, ApiError> {
    let tracking_number = req
        .tracking_number
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("guia is required".to_string()))?;
    let carrier = req.carrier.and_then(|c| c.name);

    match state
        .tracker
        .apply_webhook(&tracking_number, carrier.as_deref(), req.stage)
        .await
    {
        Ok(change) => Ok(Json(WebhookOutcome::Recorded {
            tracking_number,
            change,
        })),
        Err(CheckoutError::ShipmentNotFound(_)) => {
            tracing::warn!(%tracking_number, "webhook for an unknown tracking number");
            Ok(Json(WebhookOutcome::ShipmentNotFound { tracking_number }))
        }
        Err(err) => Err(err.into()),
    }
}

/// GET /shipments/tracking/:tracking — current shipment data.
#[tracing::instrument(skip(state))]
pub async fn tracking_info<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(tracking): Path<String>,
) -> Result<Json<Shipment>, ApiError> {
    Ok(Json(state.tracker.get_shipment(&tracking).await?))
}

/// POST /tracking/check/:tracking — ask the carrier about one shipment now.
#[tracing::instrument(skip(state))]
pub async fn check<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Path(tracking): Path<String>,
) -> Result<Json<StatusChange>, ApiError> {
    Ok(Json(state.tracker.check_shipment(&tracking).await?))
}

/// POST /tracking/check-all — run a tracking pass now.
#[tracing::instrument(skip(state))]
pub async fn check_all<S: Store>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<TrackingReport>, ApiError> {
    Ok(Json(state.tracker.run_tracking_pass().await?))
}
