//! Order, order lines and pricing.

use chrono::{DateTime, Utc};
use common::{CartId, MerchantId, OrderId, PaymentId, ProductId, ShipmentId, ShopperId, VariantId};
use serde::{Deserialize, Serialize};

use super::state::OrderStatus;
use crate::error::{DomainError, Result};
use crate::value_objects::Money;

/// A product line of an order; quantity is reserved at order creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub quantity: u32,
    pub unit_price: Money,
}

impl OrderLine {
    /// Creates a new order line.
    pub fn new(product_id: ProductId, quantity: u32, unit_price: Money) -> Self {
        Self {
            product_id,
            variant_id: None,
            quantity,
            unit_price,
        }
    }

    /// Sets the variant.
    pub fn with_variant(mut self, variant_id: VariantId) -> Self {
        self.variant_id = Some(variant_id);
        self
    }

    /// Returns price × quantity.
    pub fn subtotal(&self) -> Money {
        self.unit_price.multiply(self.quantity)
    }
}

/// Checks that an order has lines and every line is positive.
pub fn validate_lines(lines: &[OrderLine]) -> Result<()> {
    if lines.is_empty() {
        return Err(DomainError::EmptyOrder);
    }
    for (index, line) in lines.iter().enumerate() {
        if line.quantity == 0 {
            return Err(DomainError::InvalidLine {
                index,
                reason: "quantity must be positive".to_string(),
            });
        }
        if !line.unit_price.is_positive() {
            return Err(DomainError::InvalidLine {
                index,
                reason: format!("unit price must be positive, got {}", line.unit_price),
            });
        }
    }
    Ok(())
}

/// Amounts of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTotals {
    pub subtotal: Money,
    pub discount: Money,
    pub shipping: Money,
    pub total: Money,
}

impl OrderTotals {
    /// Computes `total = Σ(price × qty) − discount + shipping`.
    pub fn compute(lines: &[OrderLine], discount: Money, shipping: Money) -> Self {
        let subtotal: Money = lines.iter().map(OrderLine::subtotal).sum();
        Self {
            subtotal,
            discount,
            shipping,
            total: subtotal - discount + shipping,
        }
    }

    /// Value of the products after discount, before shipping.
    pub fn product_value(&self) -> Money {
        self.subtotal - self.discount
    }
}

/// A checkout attempt: lines, amounts and links to its payment and shipment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub merchant_id: MerchantId,
    pub shopper_id: ShopperId,
    pub status: OrderStatus,
    pub totals: OrderTotals,
    pub coupon_code: Option<String>,
    pub cart_id: Option<CartId>,
    /// Carrier chosen at checkout; the label service picks one when unset.
    pub carrier: Option<String>,
    pub lines: Vec<OrderLine>,
    pub payment_id: Option<PaymentId>,
    pub shipment_id: Option<ShipmentId>,
    /// True while the lines' quantities are held out of stock.
    pub stock_reserved: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Creates an order in CREATED state whose lines are already reserved.
    pub fn new(
        merchant_id: MerchantId,
        shopper_id: ShopperId,
        lines: Vec<OrderLine>,
        totals: OrderTotals,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: OrderId::new(),
            merchant_id,
            shopper_id,
            status: OrderStatus::Created,
            totals,
            coupon_code: None,
            cart_id: None,
            carrier: None,
            lines,
            payment_id: None,
            shipment_id: None,
            stock_reserved: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves to `next`, enforcing the order state machine.
    pub fn transition_to(&mut self, next: OrderStatus, now: DateTime<Utc>) -> Result<()> {
        self.status = self.status.transition_to(next)?;
        self.updated_at = now;
        Ok(())
    }

    /// Total units across all lines.
    pub fn unit_count(&self) -> u32 {
        self.lines.iter().map(|l| l.quantity).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_empty() {
        assert_eq!(validate_lines(&[]), Err(DomainError::EmptyOrder));
    }

    #[test]
    fn test_validate_rejects_zero_quantity() {
        let lines = vec![
            OrderLine::new(ProductId::new(), 1, Money::new(100)),
            OrderLine::new(ProductId::new(), 0, Money::new(100)),
        ];
        assert!(matches!(
            validate_lines(&lines),
            Err(DomainError::InvalidLine { index: 1, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_non_positive_price() {
        let lines = vec![OrderLine::new(ProductId::new(), 1, Money::zero())];
        assert!(matches!(
            validate_lines(&lines),
            Err(DomainError::InvalidLine { index: 0, .. })
        ));
    }

    #[test]
    fn test_totals() {
        let lines = vec![
            OrderLine::new(ProductId::new(), 2, Money::new(2500)),
            OrderLine::new(ProductId::new(), 1, Money::new(5000)),
        ];
        let totals = OrderTotals::compute(&lines, Money::new(1000), Money::new(2000));
        assert_eq!(totals.subtotal, Money::new(10_000));
        assert_eq!(totals.product_value(), Money::new(9000));
        assert_eq!(totals.total, Money::new(11_000));
    }

    #[test]
    fn test_new_order_holds_stock() {
        let lines = vec![OrderLine::new(ProductId::new(), 3, Money::new(100))];
        let totals = OrderTotals::compute(&lines, Money::zero(), Money::zero());
        let order = Order::new(MerchantId::new(), ShopperId::new(), lines, totals, Utc::now());
        assert_eq!(order.status, OrderStatus::Created);
        assert!(order.stock_reserved);
        assert_eq!(order.unit_count(), 3);
    }
}
