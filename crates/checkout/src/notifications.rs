//! Payloads published to the delivery queue.
//!
//! Field names are part of the contract with downstream listeners
//! (storefront, fulfillment, chat automation); add fields, never rename.

use chrono::{DateTime, Utc};
use common::{CartId, MerchantId, OrderId, ProductId, ShopperId};
use domain::{Money, Product, Shipment, Shopper};
use queue::{Publisher, Topic};
use serde::Serialize;

/// How to reach the shopper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShopperContact {
    pub id: ShopperId,
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
}

impl From<&Shopper> for ShopperContact {
    fn from(shopper: &Shopper) -> Self {
        Self {
            id: shopper.id,
            name: shopper.name.clone(),
            phone: shopper.phone.clone(),
            email: shopper.email.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductSummary {
    pub id: ProductId,
    pub name: String,
    pub price: Money,
    pub image_url: Option<String>,
}

impl From<&Product> for ProductSummary {
    fn from(product: &Product) -> Self {
        Self {
            id: product.id,
            name: product.name.clone(),
            price: product.price,
            image_url: product.image_url.clone(),
        }
    }
}

/// Published on `cart_item_added`.
#[derive(Debug, Clone, Serialize)]
pub struct CartItemAddedPayload {
    pub cart_id: CartId,
    pub merchant_id: MerchantId,
    pub merchant_name: String,
    pub shopper: ShopperContact,
    pub product: ProductSummary,
    pub quantity: u32,
    pub cart_total: Money,
    pub shipping_cost: Money,
    pub expires_at: DateTime<Utc>,
    pub timeout_days: u32,
    pub checkout_url: String,
}

/// Published on `cart_expired`.
#[derive(Debug, Clone, Serialize)]
pub struct CartExpiredPayload {
    pub cart_id: CartId,
    pub merchant_id: MerchantId,
    pub merchant_name: String,
    pub shopper: ShopperContact,
    pub total_amount: Money,
    pub shipping_cost: Money,
    pub items_count: usize,
    /// Recovery link embedding `recovery_token`.
    pub payment_link: String,
    pub recovery_token: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Published on `cart_expiring`.
#[derive(Debug, Clone, Serialize)]
pub struct CartExpiringPayload {
    pub cart_id: CartId,
    pub merchant_id: MerchantId,
    pub merchant_name: String,
    pub shopper: ShopperContact,
    pub total_amount: Money,
    pub items_count: usize,
    pub hours_left: u32,
    pub expires_at: DateTime<Utc>,
    pub checkout_url: String,
}

/// Carrier data attached to a settled order, when a shipment exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShippingInfo {
    pub carrier: String,
    pub tracking_number: Option<String>,
    pub label_url: Option<String>,
    pub status: String,
    pub message: Option<String>,
    pub date: DateTime<Utc>,
    pub recipient_phone: String,
    pub address: Option<String>,
    pub city: Option<String>,
}

impl ShippingInfo {
    pub fn new(shipment: &Shipment, shopper: &Shopper) -> Self {
        Self {
            carrier: shipment.carrier.clone(),
            tracking_number: shipment.tracking_number.clone(),
            label_url: shipment.label_url.clone(),
            status: shipment.status.clone(),
            message: shipment.message.clone(),
            date: shipment.created_at,
            recipient_phone: shopper.phone.clone(),
            address: shopper.address.clone(),
            city: shopper.city.clone(),
        }
    }
}

/// Published on `shipment_status_changed` when a confirmation settles an
/// order and again whenever the carrier moves the shipment on.
#[derive(Debug, Clone, Serialize)]
pub struct ShipmentStatusPayload {
    pub payment_reference: String,
    pub receipt_number: Option<String>,
    pub order_id: OrderId,
    pub shopper: ShopperContact,
    pub amount: Money,
    /// Settled order status (`ACCEPTED`, `REJECTED`) or, for tracking
    /// updates, the new carrier status.
    pub status: String,
    /// Carrier status replaced by a tracking update.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<String>,
    pub shipping: Option<ShippingInfo>,
}

/// Serializes and publishes a payload. Failures are logged, never raised.
pub(crate) async fn publish<T: Serialize>(
    publisher: &dyn Publisher,
    topic: Topic,
    payload: &T,
) -> bool {
    let value = match serde_json::to_value(payload) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(%topic, error = %err, "failed to serialize notification");
            return false;
        }
    };

    let published = publisher.publish(topic.clone(), value).await;
    if !published {
        tracing::warn!(%topic, "notification was not queued");
    }
    published
}
