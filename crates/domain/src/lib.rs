//! Domain layer for carts, orders and payments.
//!
//! This crate holds the pure business model:
//! - Cart and order state machines
//! - Pricing rules (totals, coupons, split payments)
//! - Catalog entities referenced by carts and orders
//!
//! It performs no I/O; persistence lives in the `store` crate and the
//! workflows that combine both live in `checkout`.

pub mod cart;
pub mod catalog;
pub mod coupon;
pub mod error;
pub mod order;
pub mod payment;
pub mod shipment;
pub mod value_objects;

pub use cart::{
    Cart, CartItem, CartStatus, CartView, DEFAULT_CART_TIMEOUT_DAYS, REACTIVATION_WINDOW_HOURS,
    TimeRemaining,
};
pub use catalog::{Merchant, MerchantConfig, Product, Shopper};
pub use coupon::{Coupon, CouponError, Discount};
pub use error::DomainError;
pub use order::{Order, OrderLine, OrderStatus, OrderTotals};
pub use payment::{ChargeOutcome, CommissionRule, Payment, SplitAllocation, SplitPolicy};
pub use shipment::{
    DEFAULT_TRACKING_STATUS, FINAL_STATUSES, LABEL_PENDING, LOCAL_DELIVERY, Shipment,
    normalize_tracking_status,
};
pub use value_objects::Money;
