//! Coupons and discount rules.

use chrono::{DateTime, Utc};
use common::{CouponId, MerchantId, ProductId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value_objects::Money;

/// Why a coupon could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CouponError {
    #[error("Coupon {0} is not valid for this store")]
    Invalid(String),

    #[error("Coupon {0} has expired")]
    Expired(String),

    #[error("Coupon {0} was already used by this shopper")]
    AlreadyUsed(String),

    #[error("Coupon {0} does not apply to any product in the order")]
    NotApplicable(String),
}

/// The discount a coupon grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Discount {
    Percentage(u32),
    Fixed(Money),
}

/// A merchant-issued discount code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coupon {
    pub id: CouponId,
    pub merchant_id: MerchantId,
    pub code: String,
    pub discount: Discount,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    /// Products the coupon is limited to; empty means store-wide.
    pub product_scope: Vec<ProductId>,
}

impl Coupon {
    /// Creates an active, store-wide coupon without expiry.
    pub fn new(merchant_id: MerchantId, code: impl Into<String>, discount: Discount) -> Self {
        Self {
            id: CouponId::new(),
            merchant_id,
            code: code.into(),
            discount,
            active: true,
            expires_at: None,
            product_scope: Vec::new(),
        }
    }

    /// Checks that the coupon can be used by a shopper for the given products.
    ///
    /// Checks run in order: validity for the store, expiry, prior use, scope.
    pub fn check(
        &self,
        merchant_id: MerchantId,
        already_used: bool,
        products: &[ProductId],
        now: DateTime<Utc>,
    ) -> Result<(), CouponError> {
        if !self.active || self.merchant_id != merchant_id {
            return Err(CouponError::Invalid(self.code.clone()));
        }
        if self.expires_at.is_some_and(|at| at < now) {
            return Err(CouponError::Expired(self.code.clone()));
        }
        if already_used {
            return Err(CouponError::AlreadyUsed(self.code.clone()));
        }
        if !self.product_scope.is_empty()
            && !products.iter().any(|p| self.product_scope.contains(p))
        {
            return Err(CouponError::NotApplicable(self.code.clone()));
        }
        Ok(())
    }

    /// Discount for a subtotal; never more than the subtotal itself.
    pub fn discount_for(&self, subtotal: Money) -> Money {
        let discount = match self.discount {
            Discount::Percentage(pct) => subtotal.percent(pct.min(100)),
            Discount::Fixed(amount) => amount,
        };
        if discount > subtotal { subtotal } else { discount }
    }
}
