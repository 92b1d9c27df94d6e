use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{
    CartId, CartItemId, CouponId, MerchantId, OrderId, PaymentId, ProductId, ShipmentId, ShopperId,
};
use domain::{
    Cart, CartItem, CartStatus, Coupon, Merchant, Order, OrderStatus, Payment, Product, Shipment,
    Shopper,
};
use tokio::sync::RwLock;

use crate::{
    Result, StoreError,
    store::{CartStore, CatalogStore, OrderStore, StockChange},
};

#[derive(Default)]
struct State {
    merchants: HashMap<MerchantId, Merchant>,
    shoppers: HashMap<ShopperId, Shopper>,
    products: HashMap<ProductId, Product>,
    coupons: HashMap<CouponId, Coupon>,
    coupon_usages: HashSet<(CouponId, ShopperId, OrderId)>,
    carts: HashMap<CartId, Cart>,
    items: HashMap<CartItemId, CartItem>,
    orders: HashMap<OrderId, Order>,
    payments: HashMap<PaymentId, Payment>,
    shipments: HashMap<ShipmentId, Shipment>,
}

/// In-memory store implementation for tests and development.
///
/// All tables live behind one lock, so the conditional stock decrement is
/// a single critical section.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of carts stored.
    pub async fn cart_count(&self) -> usize {
        self.state.read().await.carts.len()
    }

    /// Clears all tables.
    pub async fn clear(&self) {
        *self.state.write().await = State::default();
    }
}

/// Versioned cart write; the caller holds the lock.
fn write_cart(state: &mut State, cart: &mut Cart) -> Result<()> {
    let stored = state.carts.get(&cart.id).map(|c| c.version);
    if stored != Some(cart.version) {
        return Err(StoreError::ConcurrencyConflict {
            entity: "cart",
            id: cart.id.to_string(),
            expected: format!("version {}", cart.version),
        });
    }
    if cart.status == CartStatus::Active
        && state.carts.values().any(|c| {
            c.id != cart.id
                && c.status == CartStatus::Active
                && c.shopper_id == cart.shopper_id
                && c.merchant_id == cart.merchant_id
        })
    {
        return Err(StoreError::Conflict(format!(
            "shopper {} already has an active cart for merchant {}",
            cart.shopper_id, cart.merchant_id
        )));
    }
    cart.version += 1;
    state.carts.insert(cart.id, cart.clone());
    Ok(())
}

fn newest_first(carts: &mut [Cart]) {
    carts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

#[async_trait]
impl CatalogStore for InMemoryStore {
    async fn save_merchant(&self, merchant: &Merchant) -> Result<()> {
        self.state
            .write()
            .await
            .merchants
            .insert(merchant.id, merchant.clone());
        Ok(())
    }

    async fn get_merchant(&self, id: MerchantId) -> Result<Option<Merchant>> {
        Ok(self.state.read().await.merchants.get(&id).cloned())
    }

    async fn save_shopper(&self, shopper: &Shopper) -> Result<()> {
        self.state
            .write()
            .await
            .shoppers
            .insert(shopper.id, shopper.clone());
        Ok(())
    }

    async fn get_shopper(&self, id: ShopperId) -> Result<Option<Shopper>> {
        Ok(self.state.read().await.shoppers.get(&id).cloned())
    }

    async fn save_product(&self, product: &Product) -> Result<()> {
        self.state
            .write()
            .await
            .products
            .insert(product.id, product.clone());
        Ok(())
    }

    async fn get_product(&self, id: ProductId) -> Result<Option<Product>> {
        Ok(self.state.read().await.products.get(&id).cloned())
    }

    async fn try_decrement_stock(&self, id: ProductId, quantity: u32) -> Result<StockChange> {
        let mut state = self.state.write().await;
        let Some(product) = state.products.get_mut(&id) else {
            return Ok(StockChange::Missing);
        };
        if product.stock < quantity {
            return Ok(StockChange::Insufficient {
                available: product.stock,
            });
        }
        product.stock -= quantity;
        Ok(StockChange::Applied {
            remaining: product.stock,
        })
    }

    async fn increment_stock(&self, id: ProductId, quantity: u32) -> Result<Option<u32>> {
        let mut state = self.state.write().await;
        Ok(state.products.get_mut(&id).map(|product| {
            product.stock = product.stock.saturating_add(quantity);
            product.stock
        }))
    }

    async fn save_coupon(&self, coupon: &Coupon) -> Result<()> {
        self.state
            .write()
            .await
            .coupons
            .insert(coupon.id, coupon.clone());
        Ok(())
    }

    async fn find_coupon(&self, merchant_id: MerchantId, code: &str) -> Result<Option<Coupon>> {
        Ok(self
            .state
            .read()
            .await
            .coupons
            .values()
            .find(|c| c.merchant_id == merchant_id && c.code == code)
            .cloned())
    }

    async fn coupon_used_by(&self, coupon_id: CouponId, shopper_id: ShopperId) -> Result<bool> {
        Ok(self
            .state
            .read()
            .await
            .coupon_usages
            .iter()
            .any(|(c, s, _)| *c == coupon_id && *s == shopper_id))
    }

    async fn record_coupon_usage(
        &self,
        coupon_id: CouponId,
        shopper_id: ShopperId,
        order_id: OrderId,
    ) -> Result<()> {
        self.state
            .write()
            .await
            .coupon_usages
            .insert((coupon_id, shopper_id, order_id));
        Ok(())
    }
}

#[async_trait]
impl CartStore for InMemoryStore {
    async fn insert_cart(&self, cart: &Cart) -> Result<()> {
        let mut state = self.state.write().await;
        if cart.status == CartStatus::Active
            && state.carts.values().any(|c| {
                c.status == CartStatus::Active
                    && c.shopper_id == cart.shopper_id
                    && c.merchant_id == cart.merchant_id
            })
        {
            return Err(StoreError::Conflict(format!(
                "shopper {} already has an active cart for merchant {}",
                cart.shopper_id, cart.merchant_id
            )));
        }
        state.carts.insert(cart.id, cart.clone());
        Ok(())
    }

    async fn save_cart(&self, cart: &mut Cart) -> Result<()> {
        let mut state = self.state.write().await;
        write_cart(&mut state, cart)
    }

    async fn save_cart_with_items(
        &self,
        cart: &mut Cart,
        items: &[CartItem],
        removed: &[CartItemId],
    ) -> Result<()> {
        let mut state = self.state.write().await;
        write_cart(&mut state, cart)?;
        for item in items {
            state.items.insert(item.id, item.clone());
        }
        for id in removed {
            state.items.remove(id);
        }
        Ok(())
    }

    async fn get_cart(&self, id: CartId) -> Result<Option<Cart>> {
        Ok(self.state.read().await.carts.get(&id).cloned())
    }

    async fn find_cart(
        &self,
        shopper_id: ShopperId,
        merchant_id: MerchantId,
        statuses: &[CartStatus],
    ) -> Result<Option<Cart>> {
        let state = self.state.read().await;
        let mut carts: Vec<Cart> = state
            .carts
            .values()
            .filter(|c| {
                c.shopper_id == shopper_id
                    && c.merchant_id == merchant_id
                    && statuses.contains(&c.status)
            })
            .cloned()
            .collect();
        newest_first(&mut carts);
        Ok(carts.into_iter().next())
    }

    async fn list_carts(&self, status: Option<CartStatus>) -> Result<Vec<Cart>> {
        let state = self.state.read().await;
        let mut carts: Vec<Cart> = state
            .carts
            .values()
            .filter(|c| status.is_none_or(|s| c.status == s))
            .cloned()
            .collect();
        newest_first(&mut carts);
        Ok(carts)
    }

    async fn expired_carts(&self, now: DateTime<Utc>) -> Result<Vec<Cart>> {
        let state = self.state.read().await;
        let mut carts: Vec<Cart> = state
            .carts
            .values()
            .filter(|c| c.status == CartStatus::Active && c.expires_at < now)
            .cloned()
            .collect();
        carts.sort_by_key(|c| c.expires_at);
        Ok(carts)
    }

    async fn carts_expiring_between(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Cart>> {
        let state = self.state.read().await;
        let mut carts: Vec<Cart> = state
            .carts
            .values()
            .filter(|c| {
                c.status == CartStatus::Active && c.expires_at > after && c.expires_at <= until
            })
            .cloned()
            .collect();
        carts.sort_by_key(|c| c.expires_at);
        Ok(carts)
    }

    async fn get_item(&self, id: CartItemId) -> Result<Option<CartItem>> {
        Ok(self.state.read().await.items.get(&id).cloned())
    }

    async fn cart_items(&self, cart_id: CartId) -> Result<Vec<CartItem>> {
        let state = self.state.read().await;
        let mut items: Vec<CartItem> = state
            .items
            .values()
            .filter(|i| i.cart_id == cart_id)
            .cloned()
            .collect();
        items.sort_by_key(|i| i.created_at);
        Ok(items)
    }

    async fn save_item(&self, item: &CartItem) -> Result<()> {
        self.state.write().await.items.insert(item.id, item.clone());
        Ok(())
    }

    async fn delete_item(&self, id: CartItemId) -> Result<()> {
        self.state.write().await.items.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl OrderStore for InMemoryStore {
    async fn insert_order(&self, order: &Order) -> Result<()> {
        let mut state = self.state.write().await;
        if state.orders.contains_key(&order.id) {
            return Err(StoreError::Conflict(format!("order {} already exists", order.id)));
        }
        state.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn save_order(&self, order: &Order) -> Result<()> {
        self.state
            .write()
            .await
            .orders
            .insert(order.id, order.clone());
        Ok(())
    }

    async fn save_order_if_status(
        &self,
        order: &Order,
        expected: OrderStatus,
    ) -> Result<Option<bool>> {
        let mut state = self.state.write().await;
        match state.orders.get(&order.id) {
            Some(stored) if stored.status == expected => {
                let previous = stored.stock_reserved;
                state.orders.insert(order.id, order.clone());
                Ok(Some(previous))
            }
            _ => Ok(None),
        }
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>> {
        Ok(self.state.read().await.orders.get(&id).cloned())
    }

    async fn insert_payment(&self, payment: &Payment) -> Result<()> {
        let mut state = self.state.write().await;
        if state
            .payments
            .values()
            .any(|p| p.external_reference == payment.external_reference)
        {
            return Err(StoreError::Conflict(format!(
                "payment reference {} already exists",
                payment.external_reference
            )));
        }
        state.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn save_payment(&self, payment: &Payment) -> Result<()> {
        self.state
            .write()
            .await
            .payments
            .insert(payment.id, payment.clone());
        Ok(())
    }

    async fn get_payment(&self, id: PaymentId) -> Result<Option<Payment>> {
        Ok(self.state.read().await.payments.get(&id).cloned())
    }

    async fn find_payment_by_reference(&self, reference: &str) -> Result<Option<Payment>> {
        Ok(self
            .state
            .read()
            .await
            .payments
            .values()
            .find(|p| p.external_reference == reference)
            .cloned())
    }

    async fn save_shipment(&self, shipment: &Shipment) -> Result<()> {
        self.state
            .write()
            .await
            .shipments
            .insert(shipment.id, shipment.clone());
        Ok(())
    }

    async fn save_shipment_if_status(&self, shipment: &Shipment, expected: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.shipments.get(&shipment.id) {
            Some(stored) if stored.status == expected => {
                state.shipments.insert(shipment.id, shipment.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_shipment(&self, id: ShipmentId) -> Result<Option<Shipment>> {
        Ok(self.state.read().await.shipments.get(&id).cloned())
    }

    async fn find_shipment_by_tracking(&self, tracking_number: &str) -> Result<Option<Shipment>> {
        Ok(self
            .state
            .read()
            .await
            .shipments
            .values()
            .find(|s| s.tracking_number.as_deref() == Some(tracking_number))
            .cloned())
    }

    async fn shipments_to_track(&self, excluded: &[&str], limit: usize) -> Result<Vec<Shipment>> {
        let state = self.state.read().await;
        let mut shipments: Vec<Shipment> = state
            .shipments
            .values()
            .filter(|s| s.tracking_number.is_some() && !excluded.contains(&s.status.as_str()))
            .cloned()
            .collect();
        shipments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        shipments.truncate(limit);
        Ok(shipments)
    }
}
