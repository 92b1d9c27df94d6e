//! Checkout error types.

use common::{CartId, CartItemId, MerchantId, OrderId, ProductId, ShopperId};
use domain::{CartStatus, DomainError, Money, OrderStatus};
use store::StoreError;
use thiserror::Error;

use crate::retry::IsTransient;
use crate::services::ChargeError;

/// Coarse classification of a [`CheckoutError`], stable across variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    /// The request itself is malformed or breaks a pricing rule.
    Invalid,
    /// The request conflicts with the current state or business rules.
    Conflict,
    /// A finite resource (stock) ran out.
    Exhausted,
    Unauthorized,
    /// An external collaborator failed.
    Dependency,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Invalid => "invalid",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Exhausted => "exhausted",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Dependency => "dependency",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Errors that can occur during checkout operations.
#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("Merchant not found: {0}")]
    MerchantNotFound(MerchantId),

    #[error("Shopper not found: {0}")]
    ShopperNotFound(ShopperId),

    #[error("Product not found: {0}")]
    ProductNotFound(ProductId),

    #[error("Cart not found: {0}")]
    CartNotFound(CartId),

    #[error("Cart item not found: {0}")]
    CartItemNotFound(CartItemId),

    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    #[error("Payment not found: {0}")]
    PaymentNotFound(String),

    #[error("Shipment not found: {0}")]
    ShipmentNotFound(String),

    /// The merchant has turned carts off.
    #[error("Carts are disabled for merchant {0}")]
    CartsDisabledForMerchant(MerchantId),

    /// The cart's status does not allow the operation.
    #[error("Cart {cart_id} cannot be used in status {status}")]
    CartNotUsable { cart_id: CartId, status: CartStatus },

    /// The cart belongs to another shopper or merchant.
    #[error("Cart {cart_id} does not belong to shopper {shopper_id} at merchant {merchant_id}")]
    CartNotOwned {
        cart_id: CartId,
        shopper_id: ShopperId,
        merchant_id: MerchantId,
    },

    /// Another writer moved the order on before this one could.
    #[error("Order {order_id} was closed concurrently (status {status})")]
    OrderClosed { order_id: OrderId, status: OrderStatus },

    /// The operation needs an EXPIRED cart.
    #[error("Cart {cart_id} is not expired (status {status})")]
    CartNotExpired { cart_id: CartId, status: CartStatus },

    #[error("Insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: ProductId,
        requested: u32,
        available: u32,
    },

    #[error("Order total {total} is below the minimum charge of {minimum}")]
    BelowMinimumChargeAmount { total: Money, minimum: Money },

    /// A recovery token failed verification.
    #[error("Invalid access token")]
    InvalidAccessToken,

    /// The gateway refused our credentials.
    #[error("Charge authentication failed: {0}")]
    ChargeAuthentication(String),

    /// The gateway refused the charge itself.
    #[error("Charge rejected: {0}")]
    ChargeRejected(String),

    /// The gateway could not be reached in time.
    #[error("Charge gateway unavailable: {0}")]
    ChargeUnavailable(String),

    #[error("Invalid shipment status: {0:?}")]
    InvalidShipmentStatus(String),

    /// The carrier's tracking lookup failed.
    #[error("Carrier tracking unavailable: {0}")]
    TrackingUnavailable(String),

    /// Domain error.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl CheckoutError {
    /// Returns the stable classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CheckoutError::MerchantNotFound(_)
            | CheckoutError::ShopperNotFound(_)
            | CheckoutError::ProductNotFound(_)
            | CheckoutError::CartNotFound(_)
            | CheckoutError::CartItemNotFound(_)
            | CheckoutError::OrderNotFound(_)
            | CheckoutError::PaymentNotFound(_)
            | CheckoutError::ShipmentNotFound(_) => ErrorKind::NotFound,
            CheckoutError::BelowMinimumChargeAmount { .. }
            | CheckoutError::InvalidShipmentStatus(_)
            | CheckoutError::Domain(
                DomainError::InvalidQuantity { .. }
                | DomainError::InvalidLine { .. }
                | DomainError::EmptyOrder
                | DomainError::Coupon(_),
            ) => ErrorKind::Invalid,
            CheckoutError::CartsDisabledForMerchant(_)
            | CheckoutError::CartNotUsable { .. }
            | CheckoutError::CartNotOwned { .. }
            | CheckoutError::CartNotExpired { .. }
            | CheckoutError::OrderClosed { .. }
            | CheckoutError::Domain(DomainError::InvalidTransition { .. })
            | CheckoutError::Store(StoreError::Conflict(_))
            | CheckoutError::Store(StoreError::ConcurrencyConflict { .. }) => ErrorKind::Conflict,
            CheckoutError::InsufficientStock { .. } => ErrorKind::Exhausted,
            CheckoutError::InvalidAccessToken => ErrorKind::Unauthorized,
            CheckoutError::ChargeAuthentication(_)
            | CheckoutError::ChargeRejected(_)
            | CheckoutError::ChargeUnavailable(_)
            | CheckoutError::TrackingUnavailable(_) => ErrorKind::Dependency,
            CheckoutError::Store(_) => ErrorKind::Internal,
        }
    }
}

impl From<domain::CouponError> for CheckoutError {
    fn from(err: domain::CouponError) -> Self {
        CheckoutError::Domain(DomainError::from(err))
    }
}

impl From<ChargeError> for CheckoutError {
    fn from(err: ChargeError) -> Self {
        match err {
            ChargeError::Authentication(msg) => CheckoutError::ChargeAuthentication(msg),
            ChargeError::Rejected(msg) => CheckoutError::ChargeRejected(msg),
            ChargeError::Unavailable(msg) => CheckoutError::ChargeUnavailable(msg),
        }
    }
}

/// A versioned write lost to a concurrent one; re-reading and retrying may succeed.
impl IsTransient for CheckoutError {
    fn is_transient(&self) -> bool {
        matches!(self, CheckoutError::Store(StoreError::ConcurrencyConflict { .. }))
    }
}

/// Result type for checkout operations.
pub type Result<T> = std::result::Result<T, CheckoutError>;
