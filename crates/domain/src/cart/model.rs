//! Cart and cart line entities.

use chrono::{DateTime, Duration, Utc};
use common::{CartId, CartItemId, MerchantId, ProductId, ShopperId, VariantId};
use serde::{Deserialize, Serialize};

use super::state::CartStatus;
use crate::error::{DomainError, Result};
use crate::value_objects::Money;

/// Days a cart lives when neither the caller nor the merchant configures it.
pub const DEFAULT_CART_TIMEOUT_DAYS: u32 = 2;

/// Window granted to a cart re-activated by a shopper touching it.
pub const REACTIVATION_WINDOW_HOURS: i64 = 48;

/// A shopper's time-bounded selection of items for one merchant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cart {
    pub id: CartId,
    pub shopper_id: ShopperId,
    pub merchant_id: MerchantId,
    pub status: CartStatus,
    pub total_amount: Money,
    pub shipping_cost: Money,
    pub discount_amount: Money,
    pub notes: Option<String>,
    pub timeout_days: u32,
    /// Whether the cart's lines currently hold stock reservations.
    pub stock_held: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped by every stored write; a save against a stale version is refused.
    #[serde(default)]
    pub version: i64,
}

impl Cart {
    /// Creates a new ACTIVE cart expiring `timeout_days` after `now`.
    pub fn new(
        shopper_id: ShopperId,
        merchant_id: MerchantId,
        timeout_days: u32,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: CartId::new(),
            shopper_id,
            merchant_id,
            status: CartStatus::Active,
            total_amount: Money::zero(),
            shipping_cost: Money::zero(),
            discount_amount: Money::zero(),
            notes,
            timeout_days,
            stock_held: true,
            expires_at: now + Duration::days(i64::from(timeout_days)),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Returns true once the deadline has passed.
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Moves to `next`, enforcing the lifecycle state machine.
    pub fn transition_to(&mut self, next: CartStatus, now: DateTime<Utc>) -> Result<()> {
        self.status = self.status.transition_to(next)?;
        self.updated_at = now;
        Ok(())
    }

    /// Re-opens an EXPIRED or past-deadline cart with a fresh window.
    ///
    /// Returns true if anything changed.
    pub fn reactivate(&mut self, now: DateTime<Utc>) -> Result<bool> {
        if self.status == CartStatus::Expired {
            self.transition_to(CartStatus::Active, now)?;
        } else if self.status != CartStatus::Active || !self.is_past_deadline(now) {
            return Ok(false);
        }
        self.expires_at = now + Duration::hours(REACTIVATION_WINDOW_HOURS);
        self.updated_at = now;
        Ok(true)
    }

    /// Pushes the deadline forward by whole days.
    pub fn extend(&mut self, additional_days: u32, now: DateTime<Utc>) -> Result<()> {
        if self.status != CartStatus::Active {
            return Err(DomainError::InvalidTransition {
                entity: "cart",
                from: self.status.as_str(),
                to: CartStatus::Active.as_str(),
            });
        }
        self.expires_at += Duration::days(i64::from(additional_days));
        self.updated_at = now;
        Ok(())
    }

    /// Recomputes `total = Σ subtotals + shipping − discount` from the current lines.
    pub fn recompute_total(&mut self, items: &[CartItem]) {
        let lines: Money = items.iter().map(|item| item.subtotal).sum();
        self.total_amount = lines + self.shipping_cost - self.discount_amount;
    }

    /// Breaks the remaining lifetime down for display.
    pub fn time_remaining(&self, now: DateTime<Utc>) -> TimeRemaining {
        let left = self.expires_at - now;
        if left <= Duration::zero() {
            return TimeRemaining {
                days: 0,
                hours: 0,
                minutes: 0,
                seconds: 0,
                expired: true,
            };
        }
        let total = left.num_seconds();
        TimeRemaining {
            days: total / 86_400,
            hours: (total % 86_400) / 3_600,
            minutes: (total % 3_600) / 60,
            seconds: total % 60,
            expired: false,
        }
    }
}

/// One product line inside a cart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    pub id: CartItemId,
    pub cart_id: CartId,
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub quantity: u32,
    /// Price snapshot at add time.
    pub unit_price: Money,
    pub subtotal: Money,
    pub created_at: DateTime<Utc>,
}

impl CartItem {
    /// Creates a line; the subtotal is derived from price and quantity.
    pub fn new(
        cart_id: CartId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        quantity: u32,
        unit_price: Money,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: CartItemId::new(),
            cart_id,
            product_id,
            variant_id,
            quantity,
            unit_price,
            subtotal: unit_price.multiply(quantity),
            created_at: now,
        }
    }

    /// Returns true if this line is for the same product and variant.
    pub fn matches(&self, product_id: ProductId, variant_id: Option<VariantId>) -> bool {
        self.product_id == product_id && self.variant_id == variant_id
    }

    /// Sets the quantity and keeps the subtotal in step.
    pub fn set_quantity(&mut self, quantity: u32) {
        self.quantity = quantity;
        self.subtotal = self.unit_price.multiply(quantity);
    }
}

/// A cart together with its current lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartView {
    pub cart: Cart,
    pub items: Vec<CartItem>,
}

/// Remaining lifetime of a cart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRemaining {
    pub days: i64,
    pub hours: i64,
    pub minutes: i64,
    pub seconds: i64,
    pub expired: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cart(now: DateTime<Utc>) -> Cart {
        Cart::new(ShopperId::new(), MerchantId::new(), 2, None, now)
    }

    #[test]
    fn test_new_cart_expires_after_timeout() {
        let now = Utc::now();
        let cart = cart(now);
        assert_eq!(cart.status, CartStatus::Active);
        assert_eq!(cart.expires_at, now + Duration::days(2));
        assert!(cart.stock_held);
    }

    #[test]
    fn test_total_includes_shipping_and_discount() {
        let now = Utc::now();
        let mut cart = cart(now);
        cart.shipping_cost = Money::new(2000);
        cart.discount_amount = Money::new(500);
        let items = vec![
            CartItem::new(cart.id, ProductId::new(), None, 2, Money::new(3000), now),
            CartItem::new(cart.id, ProductId::new(), None, 1, Money::new(4000), now),
        ];
        cart.recompute_total(&items);
        assert_eq!(cart.total_amount, Money::new(11_500));
    }

    #[test]
    fn test_reactivate_expired_cart() {
        let now = Utc::now();
        let mut cart = cart(now - Duration::days(3));
        cart.status = CartStatus::Expired;
        assert!(cart.reactivate(now).unwrap());
        assert_eq!(cart.status, CartStatus::Active);
        assert!(cart.expires_at > now);
        assert_eq!(cart.expires_at, now + Duration::hours(48));
    }

    #[test]
    fn test_reactivate_active_past_deadline() {
        let now = Utc::now();
        let mut cart = cart(now - Duration::days(3));
        assert!(cart.is_past_deadline(now));
        assert!(cart.reactivate(now).unwrap());
        assert!(cart.expires_at > now);
    }

    #[test]
    fn test_reactivate_is_noop_for_live_cart() {
        let now = Utc::now();
        let mut cart = cart(now);
        let deadline = cart.expires_at;
        assert!(!cart.reactivate(now).unwrap());
        assert_eq!(cart.expires_at, deadline);
    }

    #[test]
    fn test_reactivate_completed_is_noop() {
        let now = Utc::now();
        let mut cart = cart(now);
        cart.status = CartStatus::Completed;
        assert!(!cart.reactivate(now).unwrap());
        assert_eq!(cart.status, CartStatus::Completed);
    }

    #[test]
    fn test_extend_requires_active() {
        let now = Utc::now();
        let mut cart = cart(now);
        cart.extend(3, now).unwrap();
        assert_eq!(cart.expires_at, now + Duration::days(5));

        cart.status = CartStatus::Expired;
        assert!(cart.extend(1, now).is_err());
    }

    #[test]
    fn test_item_subtotal_tracks_quantity() {
        let now = Utc::now();
        let mut item = CartItem::new(CartId::new(), ProductId::new(), None, 2, Money::new(750), now);
        assert_eq!(item.subtotal, Money::new(1500));
        item.set_quantity(5);
        assert_eq!(item.subtotal, Money::new(3750));
    }

    #[test]
    fn test_item_matches_product_and_variant() {
        let now = Utc::now();
        let product = ProductId::new();
        let variant = VariantId::new();
        let item = CartItem::new(CartId::new(), product, Some(variant), 1, Money::new(1), now);
        assert!(item.matches(product, Some(variant)));
        assert!(!item.matches(product, None));
        assert!(!item.matches(ProductId::new(), Some(variant)));
    }

    #[test]
    fn test_time_remaining() {
        let now = Utc::now();
        let mut cart = cart(now);
        cart.expires_at = now + Duration::seconds(90_061);
        let left = cart.time_remaining(now);
        assert_eq!(
            left,
            TimeRemaining {
                days: 1,
                hours: 1,
                minutes: 1,
                seconds: 1,
                expired: false
            }
        );

        cart.expires_at = now - Duration::seconds(1);
        assert!(cart.time_remaining(now).expired);
    }
}
