use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CartId, CartItemId, CouponId, MerchantId, OrderId, PaymentId, ProductId, ShipmentId, ShopperId};
use domain::{
    Cart, CartItem, CartStatus, Coupon, Merchant, Order, OrderStatus, Payment, Product, Shipment,
    Shopper,
};

use crate::Result;

/// Outcome of a conditional stock decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockChange {
    /// The decrement was applied; `remaining` is the new counter.
    Applied { remaining: u32 },
    /// Not enough stock; nothing changed.
    Insufficient { available: u32 },
    /// The product does not exist.
    Missing,
}

/// Merchants, shoppers, products and coupons.
///
/// The stock counter is only changed through [`try_decrement_stock`] and
/// [`increment_stock`], which implementations must apply atomically.
///
/// [`try_decrement_stock`]: CatalogStore::try_decrement_stock
/// [`increment_stock`]: CatalogStore::increment_stock
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn save_merchant(&self, merchant: &Merchant) -> Result<()>;

    async fn get_merchant(&self, id: MerchantId) -> Result<Option<Merchant>>;

    async fn save_shopper(&self, shopper: &Shopper) -> Result<()>;

    async fn get_shopper(&self, id: ShopperId) -> Result<Option<Shopper>>;

    /// Inserts or replaces a product, including its stock counter.
    async fn save_product(&self, product: &Product) -> Result<()>;

    async fn get_product(&self, id: ProductId) -> Result<Option<Product>>;

    /// Decrements stock by `quantity` only if at least `quantity` is available.
    ///
    /// The check and the write happen as one atomic step, so two concurrent
    /// callers can never both succeed against the same last unit.
    async fn try_decrement_stock(&self, id: ProductId, quantity: u32) -> Result<StockChange>;

    /// Increments stock, returning the new counter or `None` if the product is gone.
    async fn increment_stock(&self, id: ProductId, quantity: u32) -> Result<Option<u32>>;

    async fn save_coupon(&self, coupon: &Coupon) -> Result<()>;

    /// Looks up a coupon by code within a merchant.
    async fn find_coupon(&self, merchant_id: MerchantId, code: &str) -> Result<Option<Coupon>>;

    /// Returns true if the shopper already used the coupon.
    async fn coupon_used_by(&self, coupon_id: CouponId, shopper_id: ShopperId) -> Result<bool>;

    async fn record_coupon_usage(
        &self,
        coupon_id: CouponId,
        shopper_id: ShopperId,
        order_id: OrderId,
    ) -> Result<()>;
}

/// Carts and their lines.
#[async_trait]
pub trait CartStore: Send + Sync {
    /// Inserts a new cart.
    ///
    /// Fails with `Conflict` if the cart is ACTIVE and another ACTIVE cart
    /// already exists for the same shopper and merchant.
    async fn insert_cart(&self, cart: &Cart) -> Result<()>;

    /// Updates an existing cart row if nobody wrote it since `cart` was read.
    ///
    /// The write only lands while the stored version equals `cart.version`;
    /// both are then bumped. A stale cart fails with `ConcurrencyConflict`.
    async fn save_cart(&self, cart: &mut Cart) -> Result<()>;

    /// Versioned cart write that also upserts `items` and deletes `removed`,
    /// all or nothing.
    async fn save_cart_with_items(
        &self,
        cart: &mut Cart,
        items: &[CartItem],
        removed: &[CartItemId],
    ) -> Result<()>;

    async fn get_cart(&self, id: CartId) -> Result<Option<Cart>>;

    /// Newest cart of the pair whose status is one of `statuses`.
    async fn find_cart(
        &self,
        shopper_id: ShopperId,
        merchant_id: MerchantId,
        statuses: &[CartStatus],
    ) -> Result<Option<Cart>>;

    /// All carts, optionally filtered by status, newest first.
    async fn list_carts(&self, status: Option<CartStatus>) -> Result<Vec<Cart>>;

    /// ACTIVE carts whose deadline is strictly before `now`.
    async fn expired_carts(&self, now: DateTime<Utc>) -> Result<Vec<Cart>>;

    /// ACTIVE carts with `after < expires_at <= until`.
    async fn carts_expiring_between(
        &self,
        after: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<Cart>>;

    async fn get_item(&self, id: CartItemId) -> Result<Option<CartItem>>;

    /// Lines of a cart in insertion order.
    async fn cart_items(&self, cart_id: CartId) -> Result<Vec<CartItem>>;

    /// Inserts or updates a line.
    async fn save_item(&self, item: &CartItem) -> Result<()>;

    async fn delete_item(&self, id: CartItemId) -> Result<()>;
}

/// Orders, payments and shipments.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Inserts an order together with its lines.
    async fn insert_order(&self, order: &Order) -> Result<()>;

    /// Updates the mutable columns of an order (status, links, stock flag).
    async fn save_order(&self, order: &Order) -> Result<()>;

    /// Updates the order only while its stored status is still `expected`.
    ///
    /// Returns the `stock_reserved` flag the write replaced, or `None` when
    /// the status had already moved on and nothing was written.
    async fn save_order_if_status(
        &self,
        order: &Order,
        expected: OrderStatus,
    ) -> Result<Option<bool>>;

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>>;

    async fn insert_payment(&self, payment: &Payment) -> Result<()>;

    async fn save_payment(&self, payment: &Payment) -> Result<()>;

    async fn get_payment(&self, id: PaymentId) -> Result<Option<Payment>>;

    async fn find_payment_by_reference(&self, reference: &str) -> Result<Option<Payment>>;

    async fn save_shipment(&self, shipment: &Shipment) -> Result<()>;

    /// Replaces the shipment only while its stored status is still `expected`.
    ///
    /// Returns false when another writer changed the status first.
    async fn save_shipment_if_status(&self, shipment: &Shipment, expected: &str) -> Result<bool>;

    async fn get_shipment(&self, id: ShipmentId) -> Result<Option<Shipment>>;

    async fn find_shipment_by_tracking(&self, tracking_number: &str) -> Result<Option<Shipment>>;

    /// Shipments with a tracking number whose status is not in `excluded`,
    /// newest first, at most `limit` of them.
    async fn shipments_to_track(&self, excluded: &[&str], limit: usize) -> Result<Vec<Shipment>>;
}

/// Everything the checkout workflows need from persistence.
pub trait Store: CatalogStore + CartStore + OrderStore + Clone + 'static {}

impl<T> Store for T where T: CatalogStore + CartStore + OrderStore + Clone + 'static {}
