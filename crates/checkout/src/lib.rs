//! Checkout workflows: stock holds, carts, cart expiration and order settlement.
//!
//! The pieces build on each other:
//! 1. [`InventoryLedger`] reserves and releases stock atomically
//! 2. [`CartManager`] holds stock for open carts
//! 3. [`ExpirationScheduler`] expires overdue carts and warns shoppers
//! 4. [`SettlementService`] turns lines into charged orders and applies
//!    payment confirmations
//! 5. [`ShipmentTracker`] follows shipments through the carriers
//!
//! Notifications go out through a [`queue::Publisher`]; none of these
//! workflows fail because a notification could not be queued.

pub mod cart;
pub mod error;
pub mod ledger;
pub mod notifications;
pub mod retry;
pub mod scheduler;
pub mod services;
pub mod settlement;
pub mod token;
pub mod tracking;

#[cfg(test)]
mod testing;

pub use cart::{CartManager, CartSettings, RecoveryLink};
pub use error::{CheckoutError, ErrorKind, Result};
pub use ledger::{InventoryLedger, StockLine};
pub use scheduler::{
    CartDisposition, ExpirationScheduler, SchedulerHandle, SchedulerSettings, Shortage,
    SweepReport,
};
pub use services::{
    ChargeError, ChargeGateway, InMemoryChargeGateway, InMemoryInvoiceService,
    InMemoryLabelService, InMemoryTrackingService, InvoiceError, InvoiceService, LabelError,
    LabelService, TrackingError, TrackingEvent, TrackingService,
};
pub use settlement::{
    ChargeConfirmation, ConfirmationOutcome, CreateOrder, OrderReceipt, SettlementService,
    SettlementSettings, SideEffectReport, StepOutcome,
};
pub use token::{TokenError, TokenSigner};
pub use tracking::{ShipmentTracker, StatusChange, TrackingReport, TrackingSettings};
