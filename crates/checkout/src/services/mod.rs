//! External collaborator traits and in-memory implementations.

pub mod charge;
pub mod invoice;
pub mod label;
pub mod tracking;

pub use charge::{ChargeError, ChargeGateway, ChargeReceipt, ChargeRequest, InMemoryChargeGateway};
pub use invoice::{
    InMemoryInvoiceService, InvoiceError, InvoiceReceipt, InvoiceRequest, InvoiceService,
};
pub use label::{
    DEFAULT_CARRIER, InMemoryLabelService, LabelError, LabelReceipt, LabelRequest, LabelService,
};
pub use tracking::{
    InMemoryTrackingService, TrackingError, TrackingEvent, TrackingService,
};
