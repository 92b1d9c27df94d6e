//! Payments and split allocation.

use chrono::{DateTime, Utc};
use common::{OrderId, PaymentId};
use serde::{Deserialize, Serialize};

use crate::order::OrderTotals;
use crate::value_objects::Money;

/// Gateway status normalized into the three outcomes settlement cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeOutcome {
    #[default]
    Pending,
    Accepted,
    Rejected,
}

impl ChargeOutcome {
    /// Returns the outcome name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeOutcome::Pending => "pending",
            ChargeOutcome::Accepted => "accepted",
            ChargeOutcome::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for ChargeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ChargeOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ChargeOutcome::Pending),
            "accepted" => Ok(ChargeOutcome::Accepted),
            "rejected" => Ok(ChargeOutcome::Rejected),
            other => Err(format!("unknown charge outcome: {other}")),
        }
    }
}

/// Division of a charge between the platform and the merchant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitAllocation {
    pub platform_commission: Money,
    pub merchant_payout: Money,
}

/// How the platform commission is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CommissionRule {
    Fixed(Money),
    Percentage(u32),
}

/// Split-payment settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitPolicy {
    pub enabled: bool,
    /// Charges below this total are not split.
    pub minimum_amount: Money,
    pub commission: CommissionRule,
}

impl Default for SplitPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            minimum_amount: Money::new(1000),
            commission: CommissionRule::Fixed(Money::new(1000)),
        }
    }
}

impl SplitPolicy {
    /// Allocates the charge, or returns `None` when splitting does not apply.
    ///
    /// The commission comes out of the discounted product value; shipping
    /// goes entirely to the merchant.
    pub fn allocate(&self, totals: &OrderTotals) -> Option<SplitAllocation> {
        if !self.enabled || totals.total < self.minimum_amount {
            return None;
        }
        let product_value = totals.product_value();
        let commission = match self.commission {
            CommissionRule::Fixed(amount) => amount,
            CommissionRule::Percentage(pct) => product_value.percent(pct),
        };
        let commission = if commission > product_value {
            product_value
        } else {
            commission
        };
        Some(SplitAllocation {
            platform_commission: commission,
            merchant_payout: product_value - commission + totals.shipping,
        })
    }
}

/// The payment row of an order, mirroring the gateway's view of the charge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub order_id: OrderId,
    pub external_reference: String,
    pub receipt_number: Option<String>,
    pub amount: Money,
    /// Free-text status in the gateway's vocabulary.
    pub status: String,
    pub outcome: ChargeOutcome,
    pub response: Option<String>,
    pub raw_response: serde_json::Value,
    pub split: Option<SplitAllocation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// Creates a payment in pending status right after the charge was initiated.
    pub fn pending(
        order_id: OrderId,
        external_reference: impl Into<String>,
        receipt_number: Option<String>,
        amount: Money,
        split: Option<SplitAllocation>,
        raw_response: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PaymentId::new(),
            order_id,
            external_reference: external_reference.into(),
            receipt_number,
            amount,
            status: "pending".to_string(),
            outcome: ChargeOutcome::Pending,
            response: None,
            raw_response,
            split,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn totals(subtotal: i64, discount: i64, shipping: i64) -> OrderTotals {
        OrderTotals {
            subtotal: Money::new(subtotal),
            discount: Money::new(discount),
            shipping: Money::new(shipping),
            total: Money::new(subtotal - discount + shipping),
        }
    }

    #[test]
    fn test_disabled_policy_never_splits() {
        let policy = SplitPolicy::default();
        assert!(policy.allocate(&totals(50_000, 0, 0)).is_none());
    }

    #[test]
    fn test_fixed_commission() {
        let policy = SplitPolicy {
            enabled: true,
            ..SplitPolicy::default()
        };
        let split = policy.allocate(&totals(20_000, 2000, 5000)).unwrap();
        assert_eq!(split.platform_commission, Money::new(1000));
        assert_eq!(split.merchant_payout, Money::new(22_000));
    }

    #[test]
    fn test_percentage_commission() {
        let policy = SplitPolicy {
            enabled: true,
            minimum_amount: Money::new(1000),
            commission: CommissionRule::Percentage(10),
        };
        let split = policy.allocate(&totals(10_000, 0, 1000)).unwrap();
        assert_eq!(split.platform_commission, Money::new(1000));
        assert_eq!(split.merchant_payout, Money::new(10_000));
    }

    #[test]
    fn test_below_minimum_is_not_split() {
        let policy = SplitPolicy {
            enabled: true,
            ..SplitPolicy::default()
        };
        assert!(policy.allocate(&totals(500, 0, 0)).is_none());
    }

    #[test]
    fn test_commission_never_exceeds_product_value() {
        let policy = SplitPolicy {
            enabled: true,
            minimum_amount: Money::new(100),
            commission: CommissionRule::Fixed(Money::new(5000)),
        };
        let split = policy.allocate(&totals(1200, 0, 800)).unwrap();
        assert_eq!(split.platform_commission, Money::new(1200));
        assert_eq!(split.merchant_payout, Money::new(800));
    }

    #[test]
    fn test_outcome_strings() {
        assert_eq!(ChargeOutcome::Accepted.to_string(), "accepted");
        assert_eq!("rejected".parse::<ChargeOutcome>().unwrap(), ChargeOutcome::Rejected);
    }
}
