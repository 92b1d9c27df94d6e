//! Electronic invoicing trait and in-memory implementation.

use std::sync::Arc;

use async_trait::async_trait;
use common::{MerchantId, OrderId};
use domain::{Money, OrderLine};
use thiserror::Error;
use tokio::sync::RwLock;

/// What the invoicing provider needs to issue an invoice.
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceRequest {
    pub order_id: OrderId,
    pub merchant_id: MerchantId,
    pub customer_name: String,
    pub customer_email: Option<String>,
    pub lines: Vec<OrderLine>,
    pub shipping: Money,
    pub discount: Money,
    pub total: Money,
}

/// An issued invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceReceipt {
    pub invoice_number: String,
    pub document_url: Option<String>,
}

/// Why an invoice could not be issued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvoiceError {
    #[error("invoice rejected: {0}")]
    Rejected(String),

    #[error("invoicing provider unavailable: {0}")]
    Unavailable(String),
}

/// Electronic invoicing operations.
#[async_trait]
pub trait InvoiceService: Send + Sync {
    /// Issues the invoice of an accepted order.
    async fn issue_invoice(&self, request: InvoiceRequest) -> Result<InvoiceReceipt, InvoiceError>;
}

#[derive(Debug, Default)]
struct InMemoryInvoiceState {
    invoices: Vec<InvoiceRequest>,
    next_id: u32,
    failure: Option<InvoiceError>,
}

/// In-memory invoicing provider for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInvoiceService {
    state: Arc<RwLock<InMemoryInvoiceState>>,
}

impl InMemoryInvoiceService {
    /// Creates a new in-memory invoicing provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent invoice fail with `error`.
    pub async fn set_failure(&self, error: Option<InvoiceError>) {
        self.state.write().await.failure = error;
    }

    /// Returns the number of invoices issued.
    pub async fn invoice_count(&self) -> usize {
        self.state.read().await.invoices.len()
    }
}

#[async_trait]
impl InvoiceService for InMemoryInvoiceService {
    async fn issue_invoice(&self, request: InvoiceRequest) -> Result<InvoiceReceipt, InvoiceError> {
        let mut state = self.state.write().await;

        if let Some(error) = state.failure.clone() {
            return Err(error);
        }

        state.next_id += 1;
        let invoice_number = format!("FE-{:06}", state.next_id);
        state.invoices.push(request);
        Ok(InvoiceReceipt {
            document_url: Some(format!("https://invoices.example.test/{invoice_number}.pdf")),
            invoice_number,
        })
    }
}
