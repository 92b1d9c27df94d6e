//! Shared types used across the checkout workspace.

pub mod types;

pub use types::{
    CartId, CartItemId, CouponId, MerchantId, MessageId, OrderId, PaymentId, ProductId,
    ShipmentId, ShopperId, VariantId,
};
