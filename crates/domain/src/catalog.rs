//! Merchants, shoppers and products referenced by carts and orders.

use common::{MerchantId, ProductId, ShopperId};
use serde::{Deserialize, Serialize};

use crate::cart::DEFAULT_CART_TIMEOUT_DAYS;
use crate::value_objects::Money;

/// Per-merchant behavior switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MerchantConfig {
    pub carts_enabled: bool,
    pub cart_timeout_days: u32,
    pub invoicing_enabled: bool,
    /// Merchant ships itself; no carrier label is requested.
    pub free_shipping: bool,
}

impl Default for MerchantConfig {
    fn default() -> Self {
        Self {
            carts_enabled: true,
            cart_timeout_days: DEFAULT_CART_TIMEOUT_DAYS,
            invoicing_enabled: false,
            free_shipping: false,
        }
    }
}

/// A store selling through the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Merchant {
    pub id: MerchantId,
    pub name: String,
    /// URL-safe name used in storefront links.
    pub slug: String,
    pub config: MerchantConfig,
}

impl Merchant {
    /// Creates a merchant with default configuration.
    pub fn new(name: impl Into<String>, slug: impl Into<String>) -> Self {
        Self {
            id: MerchantId::new(),
            name: name.into(),
            slug: slug.into(),
            config: MerchantConfig::default(),
        }
    }
}

/// A buyer, with the contact data notifications and labels need.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shopper {
    pub id: ShopperId,
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
}

impl Shopper {
    /// Creates a shopper with only a name and phone.
    pub fn new(name: impl Into<String>, phone: impl Into<String>) -> Self {
        Self {
            id: ShopperId::new(),
            name: name.into(),
            phone: phone.into(),
            email: None,
            address: None,
            city: None,
        }
    }
}

/// A sellable product with its available stock counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub merchant_id: MerchantId,
    pub name: String,
    pub price: Money,
    /// Units available for reservation; never negative.
    pub stock: u32,
    pub image_url: Option<String>,
}

impl Product {
    /// Creates a product.
    pub fn new(merchant_id: MerchantId, name: impl Into<String>, price: Money, stock: u32) -> Self {
        Self {
            id: ProductId::new(),
            merchant_id,
            name: name.into(),
            price,
            stock,
            image_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merchant_defaults() {
        let merchant = Merchant::new("Shop", "shop");
        assert!(merchant.config.carts_enabled);
        assert_eq!(merchant.config.cart_timeout_days, 2);
        assert!(!merchant.config.invoicing_enabled);
    }

    #[test]
    fn test_config_partial_deserialization() {
        let config: MerchantConfig =
            serde_json::from_str(r#"{"invoicing_enabled": true}"#).unwrap();
        assert!(config.invoicing_enabled);
        assert!(config.carts_enabled);
        assert_eq!(config.cart_timeout_days, 2);
    }
}
