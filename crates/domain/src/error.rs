//! Domain error types.

use thiserror::Error;

use crate::coupon::CouponError;

/// Errors raised by pure domain rules (state machines, validation, pricing).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    /// A lifecycle transition that the state machine does not allow.
    #[error("Invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: &'static str,
        to: &'static str,
    },

    /// Quantity must be positive.
    #[error("Invalid quantity: {quantity}")]
    InvalidQuantity { quantity: i64 },

    /// An order line failed validation.
    #[error("Invalid order line {index}: {reason}")]
    InvalidLine { index: usize, reason: String },

    /// An order needs at least one line.
    #[error("Order has no lines")]
    EmptyOrder,

    /// Coupon could not be applied.
    #[error(transparent)]
    Coupon(#[from] CouponError),
}

/// Result type for domain rules.
pub type Result<T> = std::result::Result<T, DomainError>;
