//! Payment gateway trait and in-memory implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{MerchantId, OrderId};
use domain::{ChargeOutcome, Money, SplitAllocation};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::retry::IsTransient;

/// What the gateway needs to open a charge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChargeRequest {
    pub order_id: OrderId,
    pub merchant_id: MerchantId,
    pub amount: Money,
    pub currency: String,
    pub bank_code: String,
    pub description: String,
    pub payer_name: String,
    pub payer_email: Option<String>,
    pub payer_phone: String,
    pub split: Option<SplitAllocation>,
}

/// The gateway's answer to a charge request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargeReceipt {
    /// Reference the gateway will quote back in its confirmation.
    pub external_reference: String,
    pub receipt_number: Option<String>,
    /// Where the shopper completes the payment.
    pub redirect_url: String,
    pub raw: serde_json::Value,
}

/// Why a charge could not be opened.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChargeError {
    #[error("gateway rejected credentials: {0}")]
    Authentication(String),

    #[error("gateway rejected the charge: {0}")]
    Rejected(String),

    #[error("gateway unavailable: {0}")]
    Unavailable(String),
}

impl IsTransient for ChargeError {
    fn is_transient(&self) -> bool {
        matches!(self, ChargeError::Unavailable(_))
    }
}

/// Payment gateway operations.
#[async_trait]
pub trait ChargeGateway: Send + Sync {
    /// Opens a charge and returns the reference to await confirmation on.
    async fn initiate_charge(&self, request: ChargeRequest) -> Result<ChargeReceipt, ChargeError>;

    /// Maps the gateway's status vocabulary onto [`ChargeOutcome`].
    ///
    /// A charge is accepted only when both the status and the response (if
    /// any) say so; anything unrecognized counts as a rejection.
    fn normalize_status(&self, status: &str, response: Option<&str>) -> ChargeOutcome {
        let status = status.trim().to_lowercase();
        let response = response.map(|r| r.trim().to_lowercase());
        let accepted = |s: &str| matches!(s, "aceptada" | "accepted" | "approved");

        if accepted(&status) && response.as_deref().is_none_or(accepted) {
            ChargeOutcome::Accepted
        } else if matches!(status.as_str(), "pendiente" | "pending") {
            ChargeOutcome::Pending
        } else {
            ChargeOutcome::Rejected
        }
    }
}

#[derive(Debug, Default)]
struct InMemoryChargeState {
    requests: Vec<ChargeRequest>,
    next_id: u32,
    failure: Option<ChargeError>,
    transient_failures: u32,
    delay: Option<Duration>,
}

/// In-memory payment gateway for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryChargeGateway {
    state: Arc<RwLock<InMemoryChargeState>>,
}

impl InMemoryChargeGateway {
    /// Creates a new in-memory gateway that accepts every charge.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent charge fail with `error` (or succeed again with `None`).
    pub async fn set_failure(&self, error: Option<ChargeError>) {
        self.state.write().await.failure = error;
    }

    /// Fails the next `count` charges with [`ChargeError::Unavailable`].
    pub async fn fail_transiently(&self, count: u32) {
        self.state.write().await.transient_failures = count;
    }

    /// Delays every answer, to exercise the caller's timeout.
    pub async fn set_delay(&self, delay: Option<Duration>) {
        self.state.write().await.delay = delay;
    }

    /// Returns the number of charge attempts received.
    pub async fn attempt_count(&self) -> usize {
        self.state.read().await.requests.len()
    }

    /// Returns every charge request received, failed ones included.
    pub async fn requests(&self) -> Vec<ChargeRequest> {
        self.state.read().await.requests.clone()
    }
}

#[async_trait]
impl ChargeGateway for InMemoryChargeGateway {
    async fn initiate_charge(&self, request: ChargeRequest) -> Result<ChargeReceipt, ChargeError> {
        let delay = self.state.read().await.delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.write().await;
        state.requests.push(request.clone());

        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(ChargeError::Unavailable("connection reset".to_string()));
        }
        if let Some(error) = state.failure.clone() {
            return Err(error);
        }

        state.next_id += 1;
        let reference = format!("CHG-{:06}", state.next_id);
        Ok(ChargeReceipt {
            redirect_url: format!("https://pay.example.test/checkout/{reference}"),
            receipt_number: Some(format!("RCPT-{:06}", state.next_id)),
            raw: serde_json::json!({
                "reference": reference,
                "amount": request.amount,
                "bank": request.bank_code,
            }),
            external_reference: reference,
        })
    }
}
