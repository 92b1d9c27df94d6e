//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use checkout::{CheckoutError, ErrorKind};
use queue::QueueError;
use store::StoreError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Checkout workflow error.
    Checkout(CheckoutError),
    /// Persistence error outside a checkout workflow.
    Store(StoreError),
    /// Delivery queue error.
    Queue(QueueError),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "invalid", msg),
            ApiError::Checkout(err) => checkout_error_to_response(err),
            ApiError::Store(StoreError::Conflict(msg)) => (StatusCode::BAD_REQUEST, "conflict", msg),
            ApiError::Store(err @ StoreError::ConcurrencyConflict { .. }) => {
                (StatusCode::BAD_REQUEST, "conflict", err.to_string())
            }
            ApiError::Store(err) => internal(err.to_string()),
            ApiError::Queue(err) => internal(err.to_string()),
            ApiError::Internal(msg) => internal(msg),
        };

        let body = serde_json::json!({
            "success": false,
            "error": { "kind": kind, "message": message },
        });
        (status, axum::Json(body)).into_response()
    }
}

fn checkout_error_to_response(err: CheckoutError) -> (StatusCode, &'static str, String) {
    let kind = err.kind();
    let status = match (&err, kind) {
        (CheckoutError::ChargeUnavailable(_) | CheckoutError::TrackingUnavailable(_), _) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        (_, ErrorKind::NotFound) => StatusCode::NOT_FOUND,
        (_, ErrorKind::Invalid | ErrorKind::Conflict | ErrorKind::Exhausted) => {
            StatusCode::BAD_REQUEST
        }
        (_, ErrorKind::Unauthorized) => StatusCode::UNAUTHORIZED,
        (_, ErrorKind::Dependency) => StatusCode::BAD_GATEWAY,
        (_, ErrorKind::Internal) => return internal(err.to_string()),
    };
    (status, kind.as_str(), err.to_string())
}

fn internal(message: String) -> (StatusCode, &'static str, String) {
    tracing::error!(error = %message, "internal server error");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

impl From<CheckoutError> for ApiError {
    fn from(err: CheckoutError) -> Self {
        ApiError::Checkout(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        ApiError::Queue(err)
    }
}
