//! Shipping-label carrier trait and in-memory implementation.

use std::sync::Arc;

use async_trait::async_trait;
use common::OrderId;
use domain::Money;
use thiserror::Error;
use tokio::sync::RwLock;

/// Carrier used when the order did not pick one.
pub const DEFAULT_CARRIER: &str = "coordinadora";

/// What the carrier needs to print a label.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelRequest {
    pub order_id: OrderId,
    pub carrier: Option<String>,
    pub recipient_name: String,
    pub recipient_phone: String,
    pub address: Option<String>,
    pub city: Option<String>,
    pub units: u32,
    pub declared_value: Money,
}

/// A label issued by the carrier.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelReceipt {
    pub carrier: String,
    pub tracking_number: String,
    pub label_url: Option<String>,
    pub status: String,
}

/// Why a label could not be produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LabelError {
    #[error("carrier refused the label: {0}")]
    Rejected(String),

    #[error("carrier unavailable: {0}")]
    Unavailable(String),
}

/// Shipping-label operations.
#[async_trait]
pub trait LabelService: Send + Sync {
    /// Requests a label and tracking number for an order.
    async fn create_label(&self, request: LabelRequest) -> Result<LabelReceipt, LabelError>;
}

#[derive(Debug, Default)]
struct InMemoryLabelState {
    labels: Vec<(LabelRequest, LabelReceipt)>,
    next_id: u32,
    failure: Option<LabelError>,
    #[cfg(test)]
    panic_on_create: bool,
}

/// In-memory carrier for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLabelService {
    state: Arc<RwLock<InMemoryLabelState>>,
}

impl InMemoryLabelService {
    /// Creates a new in-memory carrier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent label request fail with `error`.
    pub async fn set_failure(&self, error: Option<LabelError>) {
        self.state.write().await.failure = error;
    }

    /// Makes the next label request panic, as a crashing client would.
    #[cfg(test)]
    pub(crate) async fn set_panic_on_create(&self, panic: bool) {
        self.state.write().await.panic_on_create = panic;
    }

    /// Returns the number of labels issued.
    pub async fn label_count(&self) -> usize {
        self.state.read().await.labels.len()
    }

    /// Returns the requests of every label issued.
    pub async fn requests(&self) -> Vec<LabelRequest> {
        self.state
            .read()
            .await
            .labels
            .iter()
            .map(|(request, _)| request.clone())
            .collect()
    }
}

#[async_trait]
impl LabelService for InMemoryLabelService {
    async fn create_label(&self, request: LabelRequest) -> Result<LabelReceipt, LabelError> {
        let mut state = self.state.write().await;

        #[cfg(test)]
        if state.panic_on_create {
            state.panic_on_create = false;
            drop(state);
            panic!("label client crashed");
        }
        if let Some(error) = state.failure.clone() {
            return Err(error);
        }

        state.next_id += 1;
        let carrier = request
            .carrier
            .clone()
            .unwrap_or_else(|| DEFAULT_CARRIER.to_string());
        let tracking_number = format!("TRK-{:06}", state.next_id);
        let receipt = LabelReceipt {
            label_url: Some(format!("https://labels.example.test/{tracking_number}.pdf")),
            carrier,
            tracking_number,
            status: "LABEL_CREATED".to_string(),
        };
        state.labels.push((request, receipt.clone()));
        Ok(receipt)
    }
}
