//! Cart lifecycle: creation, item mutations, expiry, completion and recovery.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{CartId, CartItemId, MerchantId, ProductId, ShopperId, VariantId};
use domain::{
    Cart, CartItem, CartStatus, CartView, DEFAULT_CART_TIMEOUT_DAYS, DomainError, Money, Product,
    TimeRemaining,
};
use queue::{Publisher, Topic};
use serde::Serialize;
use store::{Store, StoreError};

use crate::error::{CheckoutError, Result};
use crate::ledger::{InventoryLedger, StockLine};
use crate::notifications::{self, CartItemAddedPayload, ProductSummary, ShopperContact};
use crate::retry::retry_transient;
use crate::token::TokenSigner;

/// Attempts for a cart write that keeps losing to concurrent writers.
const MAX_CART_WRITE_ATTEMPTS: u32 = 3;

/// Settings for [`CartManager`].
#[derive(Debug, Clone)]
pub struct CartSettings {
    /// Storefront base URL used in checkout and recovery links.
    pub frontend_url: String,
    /// Lifetime of a cart when neither the caller nor the merchant sets one.
    pub default_timeout_days: u32,
}

impl Default for CartSettings {
    fn default() -> Self {
        Self {
            frontend_url: "http://localhost:3000".to_string(),
            default_timeout_days: DEFAULT_CART_TIMEOUT_DAYS,
        }
    }
}

/// A link that lets the shopper come back to an expired cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryLink {
    pub link: String,
    pub token: String,
}

/// Drives carts through their lifecycle while keeping stock reservations in step.
///
/// A cart's lines hold stock while `stock_held` is set. Expiring or
/// cancelling releases the hold; touching an expired cart re-acquires it
/// (all or nothing) before the change is applied.
#[derive(Clone)]
pub struct CartManager<S: Store> {
    store: S,
    ledger: InventoryLedger<S>,
    publisher: Arc<dyn Publisher>,
    signer: TokenSigner,
    settings: CartSettings,
}

impl<S: Store> CartManager<S> {
    /// Creates a new cart manager.
    pub fn new(
        store: S,
        publisher: Arc<dyn Publisher>,
        signer: TokenSigner,
        settings: CartSettings,
    ) -> Self {
        let ledger = InventoryLedger::new(store.clone());
        Self {
            store,
            ledger,
            publisher,
            signer,
            settings,
        }
    }

    /// Gets the inventory ledger used for reservations.
    pub fn ledger(&self) -> &InventoryLedger<S> {
        &self.ledger
    }

    /// Gets the recovery token signer.
    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    /// Gets the settings.
    pub fn settings(&self) -> &CartSettings {
        &self.settings
    }

    /// Returns the shopper's ACTIVE cart for the merchant, creating one if needed.
    ///
    /// The lifetime comes from `timeout_days`, else the merchant's
    /// configuration, else the default.
    #[tracing::instrument(skip(self, notes))]
    pub async fn create_cart(
        &self,
        shopper_id: ShopperId,
        merchant_id: MerchantId,
        timeout_days: Option<u32>,
        notes: Option<String>,
    ) -> Result<Cart> {
        let merchant = self
            .store
            .get_merchant(merchant_id)
            .await?
            .ok_or(CheckoutError::MerchantNotFound(merchant_id))?;
        if !merchant.config.carts_enabled {
            return Err(CheckoutError::CartsDisabledForMerchant(merchant_id));
        }
        self.store
            .get_shopper(shopper_id)
            .await?
            .ok_or(CheckoutError::ShopperNotFound(shopper_id))?;

        if let Some(existing) = self.find_active(shopper_id, merchant_id).await? {
            tracing::debug!(cart_id = %existing.id, "returning existing active cart");
            return Ok(existing);
        }

        let days = timeout_days
            .filter(|d| *d > 0)
            .or(Some(merchant.config.cart_timeout_days).filter(|d| *d > 0))
            .unwrap_or(self.settings.default_timeout_days);
        let cart = Cart::new(shopper_id, merchant_id, days, notes, Utc::now());

        match self.store.insert_cart(&cart).await {
            Ok(()) => {
                metrics::counter!("carts_created_total").increment(1);
                tracing::info!(cart_id = %cart.id, timeout_days = days, "cart created");
                Ok(cart)
            }
            // Lost a race with a concurrent create for the same pair.
            Err(StoreError::Conflict(_)) => self
                .find_active(shopper_id, merchant_id)
                .await?
                .ok_or_else(|| {
                    CheckoutError::Store(StoreError::Conflict(format!(
                        "active cart for shopper {shopper_id} vanished during creation"
                    )))
                }),
            Err(err) => Err(err.into()),
        }
    }

    /// Adds `quantity` units of a product, merging with an identical line.
    ///
    /// An EXPIRED or overdue cart is re-activated first. Stock is reserved
    /// before anything is written, so a failed reservation leaves the cart
    /// untouched. The cart and the line are written together against the
    /// version that was read; a concurrent write makes this call release
    /// what it reserved and start over.
    #[tracing::instrument(skip(self))]
    pub async fn add_item(
        &self,
        cart_id: CartId,
        product_id: ProductId,
        quantity: u32,
        variant_id: Option<VariantId>,
    ) -> Result<CartView> {
        if quantity == 0 {
            return Err(DomainError::InvalidQuantity { quantity: 0 }.into());
        }
        let product = self
            .store
            .get_product(product_id)
            .await?
            .ok_or(CheckoutError::ProductNotFound(product_id))?;

        let view = retry_transient(MAX_CART_WRITE_ATTEMPTS, |_| {
            self.try_add_item(cart_id, &product, quantity, variant_id)
        })
        .await?;

        metrics::counter!("cart_items_added_total").increment(1);
        self.notify_item_added(&view.cart, &product, quantity).await;
        Ok(view)
    }

    async fn try_add_item(
        &self,
        cart_id: CartId,
        product: &Product,
        quantity: u32,
        variant_id: Option<VariantId>,
    ) -> Result<CartView> {
        let now = Utc::now();
        let mut cart = self.load(cart_id).await?;
        if !cart.status.accepts_items() {
            return Err(CheckoutError::CartNotUsable {
                cart_id,
                status: cart.status,
            });
        }
        let mut items = self.store.cart_items(cart_id).await?;

        // Everything reserved by this attempt, for undoing on failure.
        let mut reserved = Vec::new();
        if self.reacquire(&cart, &items).await? {
            reserved = stock_lines(&items);
        }
        if let Err(err) = self.ledger.reserve(product.id, quantity).await {
            self.ledger.release_all(&reserved).await?;
            return Err(err);
        }
        reserved.push(StockLine::new(product.id, quantity));

        let index = match items.iter().position(|i| i.matches(product.id, variant_id)) {
            Some(index) => {
                let merged = items[index].quantity + quantity;
                items[index].set_quantity(merged);
                index
            }
            None => {
                items.push(CartItem::new(
                    cart_id,
                    product.id,
                    variant_id,
                    quantity,
                    product.price,
                    now,
                ));
                items.len() - 1
            }
        };
        cart.stock_held = true;
        cart.recompute_total(&items);
        cart.updated_at = now;

        match self
            .write_cart(&mut cart, std::slice::from_ref(&items[index]), &[], now)
            .await
        {
            Ok(()) => Ok(CartView { cart, items }),
            Err(err) => {
                self.ledger.release_all(&reserved).await?;
                Err(err)
            }
        }
    }

    /// Sets a line's quantity; zero or less removes the line.
    ///
    /// Units given back by a decrease return to stock only once the new
    /// quantity is stored.
    #[tracing::instrument(skip(self))]
    pub async fn update_item_quantity(&self, item_id: CartItemId, quantity: i64) -> Result<CartView> {
        if quantity <= 0 {
            return self.remove_item(item_id).await;
        }
        let new_quantity =
            u32::try_from(quantity).map_err(|_| DomainError::InvalidQuantity { quantity })?;
        retry_transient(MAX_CART_WRITE_ATTEMPTS, |_| {
            self.try_update_item_quantity(item_id, new_quantity)
        })
        .await
    }

    async fn try_update_item_quantity(
        &self,
        item_id: CartItemId,
        new_quantity: u32,
    ) -> Result<CartView> {
        let now = Utc::now();
        let (mut cart, mut items, index) = self.load_line(item_id).await?;
        if !cart.status.accepts_items() {
            return Err(CheckoutError::CartNotUsable {
                cart_id: cart.id,
                status: cart.status,
            });
        }

        let mut reserved = Vec::new();
        if self.reacquire(&cart, &items).await? {
            reserved = stock_lines(&items);
        }
        let product_id = items[index].product_id;
        let old_quantity = items[index].quantity;
        if new_quantity > old_quantity {
            let extra = new_quantity - old_quantity;
            if let Err(err) = self.ledger.reserve(product_id, extra).await {
                self.ledger.release_all(&reserved).await?;
                return Err(err);
            }
            reserved.push(StockLine::new(product_id, extra));
        }

        items[index].set_quantity(new_quantity);
        cart.stock_held = true;
        cart.recompute_total(&items);
        cart.updated_at = now;

        if let Err(err) = self
            .write_cart(&mut cart, std::slice::from_ref(&items[index]), &[], now)
            .await
        {
            self.ledger.release_all(&reserved).await?;
            return Err(err);
        }
        if new_quantity < old_quantity {
            self.ledger
                .release(product_id, old_quantity - new_quantity)
                .await?;
        }
        Ok(CartView { cart, items })
    }

    /// Deletes a line, returning its units to stock if the cart holds them.
    #[tracing::instrument(skip(self))]
    pub async fn remove_item(&self, item_id: CartItemId) -> Result<CartView> {
        retry_transient(MAX_CART_WRITE_ATTEMPTS, |_| self.try_remove_item(item_id)).await
    }

    async fn try_remove_item(&self, item_id: CartItemId) -> Result<CartView> {
        let (mut cart, mut items, index) = self.load_line(item_id).await?;
        if cart.status.is_terminal() {
            return Err(CheckoutError::CartNotUsable {
                cart_id: cart.id,
                status: cart.status,
            });
        }

        let removed = items.remove(index);
        cart.recompute_total(&items);
        cart.updated_at = Utc::now();
        self.store
            .save_cart_with_items(&mut cart, &[], &[item_id])
            .await?;

        if cart.stock_held {
            self.ledger.release(removed.product_id, removed.quantity).await?;
        }
        Ok(CartView { cart, items })
    }

    /// Returns a cart with its lines.
    pub async fn get_cart(&self, cart_id: CartId) -> Result<CartView> {
        let cart = self.load(cart_id).await?;
        let items = self.store.cart_items(cart_id).await?;
        Ok(CartView { cart, items })
    }

    /// Returns the shopper's ACTIVE or EXPIRED cart for the merchant, if any.
    pub async fn get_open_cart(
        &self,
        shopper_id: ShopperId,
        merchant_id: MerchantId,
    ) -> Result<Option<CartView>> {
        let Some(cart) = self
            .store
            .find_cart(
                shopper_id,
                merchant_id,
                &[CartStatus::Active, CartStatus::Expired],
            )
            .await?
        else {
            return Ok(None);
        };
        let items = self.store.cart_items(cart.id).await?;
        Ok(Some(CartView { cart, items }))
    }

    /// Lists carts, newest first.
    pub async fn list_carts(&self, status: Option<CartStatus>) -> Result<Vec<Cart>> {
        Ok(self.store.list_carts(status).await?)
    }

    /// Expires an ACTIVE cart, releasing its hold. Any other cart is returned unchanged.
    #[tracing::instrument(skip(self))]
    pub async fn expire(&self, cart_id: CartId) -> Result<Cart> {
        match self.expire_current(cart_id, None).await? {
            Some((cart, _)) => Ok(cart),
            None => self.load(cart_id).await,
        }
    }

    /// Expires the stored cart as it is now, not as some earlier read saw it.
    ///
    /// With `overdue_at` set, a cart whose deadline is not before that
    /// instant is left alone. Returns the expired cart and the lines whose
    /// units were released, or `None` if nothing was expired.
    pub(crate) async fn expire_current(
        &self,
        cart_id: CartId,
        overdue_at: Option<DateTime<Utc>>,
    ) -> Result<Option<(Cart, Vec<CartItem>)>> {
        retry_transient(MAX_CART_WRITE_ATTEMPTS, |_| {
            self.try_expire(cart_id, overdue_at)
        })
        .await
    }

    async fn try_expire(
        &self,
        cart_id: CartId,
        overdue_at: Option<DateTime<Utc>>,
    ) -> Result<Option<(Cart, Vec<CartItem>)>> {
        let mut cart = self.load(cart_id).await?;
        if cart.status != CartStatus::Active {
            return Ok(None);
        }
        if let Some(now) = overdue_at
            && !cart.is_past_deadline(now)
        {
            tracing::debug!(%cart_id, expires_at = %cart.expires_at, "cart no longer overdue");
            return Ok(None);
        }
        let items = self.store.cart_items(cart_id).await?;

        let held = cart.stock_held;
        cart.stock_held = false;
        cart.transition_to(CartStatus::Expired, Utc::now())?;
        self.store.save_cart(&mut cart).await?;

        // Lines only change together with the version, so these are the held ones.
        if held {
            let restored = self.ledger.release_all(&stock_lines(&items)).await?;
            tracing::debug!(%cart_id, restored, "released cart hold");
        }
        metrics::counter!("carts_expired_total").increment(1);
        tracing::info!(%cart_id, "cart expired");
        Ok(Some((cart, items)))
    }

    /// Marks a cart as paid. Completing a COMPLETED cart is a no-op.
    ///
    /// The hold is not released: the order that paid for the cart owns the
    /// stock from here on.
    #[tracing::instrument(skip(self))]
    pub async fn complete(&self, cart_id: CartId) -> Result<Cart> {
        retry_transient(MAX_CART_WRITE_ATTEMPTS, |_| self.try_complete(cart_id)).await
    }

    async fn try_complete(&self, cart_id: CartId) -> Result<Cart> {
        let mut cart = self.load(cart_id).await?;
        match cart.status {
            CartStatus::Completed => return Ok(cart),
            CartStatus::Active | CartStatus::Expired => {}
            CartStatus::Cancelled => {
                return Err(CheckoutError::CartNotUsable {
                    cart_id,
                    status: cart.status,
                });
            }
        }
        let held = cart.stock_held;
        cart.transition_to(CartStatus::Completed, Utc::now())?;
        cart.stock_held = false;
        self.store.save_cart(&mut cart).await?;

        // Lines re-reserved after the order took over the hold.
        if held {
            let items = self.store.cart_items(cart_id).await?;
            let restored = self.ledger.release_all(&stock_lines(&items)).await?;
            tracing::warn!(%cart_id, restored, "completed cart still held stock, released");
        }
        metrics::counter!("carts_completed_total").increment(1);
        tracing::info!(%cart_id, "cart completed");
        Ok(cart)
    }

    /// Abandons an ACTIVE cart, returning its hold to stock.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, cart_id: CartId) -> Result<Cart> {
        retry_transient(MAX_CART_WRITE_ATTEMPTS, |_| self.try_cancel(cart_id)).await
    }

    async fn try_cancel(&self, cart_id: CartId) -> Result<Cart> {
        let mut cart = self.load_active(cart_id).await?;
        let items = self.store.cart_items(cart_id).await?;
        let held = cart.stock_held;
        cart.stock_held = false;
        cart.transition_to(CartStatus::Cancelled, Utc::now())?;
        self.store.save_cart(&mut cart).await?;

        if held {
            self.ledger.release_all(&stock_lines(&items)).await?;
        }
        tracing::info!(%cart_id, "cart cancelled");
        Ok(cart)
    }

    /// Pushes the deadline of an ACTIVE cart forward.
    #[tracing::instrument(skip(self))]
    pub async fn extend_deadline(&self, cart_id: CartId, additional_days: u32) -> Result<Cart> {
        retry_transient(MAX_CART_WRITE_ATTEMPTS, |_| async move {
            let mut cart = self.load_active(cart_id).await?;
            cart.extend(additional_days, Utc::now())?;
            self.store.save_cart(&mut cart).await?;
            Ok(cart)
        })
        .await
    }

    /// Sets the shipping cost of an ACTIVE cart and recomputes its total.
    #[tracing::instrument(skip(self))]
    pub async fn update_shipping(&self, cart_id: CartId, amount: Money) -> Result<CartView> {
        retry_transient(MAX_CART_WRITE_ATTEMPTS, |_| async move {
            let mut cart = self.load_active(cart_id).await?;
            let items = self.store.cart_items(cart_id).await?;
            cart.shipping_cost = amount;
            cart.recompute_total(&items);
            cart.updated_at = Utc::now();
            self.store.save_cart(&mut cart).await?;
            Ok(CartView { cart, items })
        })
        .await
    }

    /// Loads a cart that is about to seed an order for `shopper_id` at `merchant_id`.
    ///
    /// Only the pair's own ACTIVE or EXPIRED cart qualifies.
    pub(crate) async fn cart_for_order(
        &self,
        cart_id: CartId,
        shopper_id: ShopperId,
        merchant_id: MerchantId,
    ) -> Result<CartView> {
        let cart = self.load(cart_id).await?;
        if cart.shopper_id != shopper_id || cart.merchant_id != merchant_id {
            tracing::warn!(%cart_id, %shopper_id, "order names a cart of another shopper");
            return Err(CheckoutError::CartNotOwned {
                cart_id,
                shopper_id,
                merchant_id,
            });
        }
        if !matches!(cart.status, CartStatus::Active | CartStatus::Expired) {
            return Err(CheckoutError::CartNotUsable {
                cart_id,
                status: cart.status,
            });
        }
        let items = self.store.cart_items(cart_id).await?;
        Ok(CartView { cart, items })
    }

    /// Hands the cart's held units to the caller by clearing `stock_held`.
    ///
    /// Written against the version the caller read, so the units handed over
    /// are exactly the lines it saw. Stock counters are not touched.
    pub(crate) async fn detach_hold(&self, cart: &mut Cart) -> Result<()> {
        cart.stock_held = false;
        cart.updated_at = Utc::now();
        self.store.save_cart(cart).await?;
        tracing::debug!(cart_id = %cart.id, "cart hold handed over");
        Ok(())
    }

    /// Gives a detached hold back to the cart.
    ///
    /// Fails with a concurrency conflict if the cart was written since the
    /// hold was detached; the caller then still owns the units.
    pub(crate) async fn reattach_hold(&self, cart: &mut Cart) -> Result<()> {
        cart.stock_held = true;
        cart.updated_at = Utc::now();
        self.store.save_cart(cart).await?;
        tracing::debug!(cart_id = %cart.id, "cart hold restored");
        Ok(())
    }

    /// Remaining lifetime of a cart.
    pub async fn time_remaining(&self, cart_id: CartId) -> Result<TimeRemaining> {
        let cart = self.load(cart_id).await?;
        Ok(cart.time_remaining(Utc::now()))
    }

    /// Issues a signed link for coming back to the cart.
    #[tracing::instrument(skip(self))]
    pub async fn generate_recovery_link(&self, cart_id: CartId) -> Result<RecoveryLink> {
        let cart = self.load(cart_id).await?;
        Ok(self.recovery_link_for(&cart))
    }

    pub(crate) fn recovery_link_for(&self, cart: &Cart) -> RecoveryLink {
        let token = self.signer.issue(cart.id, cart.shopper_id, Utc::now());
        RecoveryLink {
            link: format!(
                "{}/cart/expired?cart={}&token={}",
                self.frontend_url(),
                cart.id,
                token
            ),
            token,
        }
    }

    /// Opens an EXPIRED cart from a recovery link.
    #[tracing::instrument(skip(self, token))]
    pub async fn resume_with_token(&self, cart_id: CartId, token: &str) -> Result<CartView> {
        let cart = self.load(cart_id).await?;
        let shopper_id = self
            .signer
            .verify(token, cart_id, Utc::now())
            .map_err(|err| {
                tracing::warn!(%cart_id, error = %err, "recovery token refused");
                CheckoutError::InvalidAccessToken
            })?;
        if shopper_id != cart.shopper_id {
            tracing::warn!(%cart_id, "recovery token issued to another shopper");
            return Err(CheckoutError::InvalidAccessToken);
        }
        if cart.status != CartStatus::Expired {
            return Err(CheckoutError::CartNotExpired {
                cart_id,
                status: cart.status,
            });
        }
        let items = self.store.cart_items(cart_id).await?;
        Ok(CartView { cart, items })
    }

    /// Storefront checkout URL for a shopper.
    pub fn checkout_url(&self, merchant_slug: &str, shopper_id: ShopperId) -> String {
        format!(
            "{}/{}/checkout?shopper={}",
            self.frontend_url(),
            merchant_slug,
            shopper_id
        )
    }

    fn frontend_url(&self) -> &str {
        self.settings.frontend_url.trim_end_matches('/')
    }

    async fn load(&self, cart_id: CartId) -> Result<Cart> {
        self.store
            .get_cart(cart_id)
            .await?
            .ok_or(CheckoutError::CartNotFound(cart_id))
    }

    async fn load_active(&self, cart_id: CartId) -> Result<Cart> {
        let cart = self.load(cart_id).await?;
        if cart.status != CartStatus::Active {
            return Err(CheckoutError::CartNotUsable {
                cart_id,
                status: cart.status,
            });
        }
        Ok(cart)
    }

    async fn find_active(
        &self,
        shopper_id: ShopperId,
        merchant_id: MerchantId,
    ) -> Result<Option<Cart>> {
        Ok(self
            .store
            .find_cart(shopper_id, merchant_id, &[CartStatus::Active])
            .await?)
    }

    /// Loads a line's cart and all its lines, with the line's index.
    async fn load_line(&self, item_id: CartItemId) -> Result<(Cart, Vec<CartItem>, usize)> {
        let item = self
            .store
            .get_item(item_id)
            .await?
            .ok_or(CheckoutError::CartItemNotFound(item_id))?;
        let cart = self.load(item.cart_id).await?;
        let items = self.store.cart_items(cart.id).await?;
        let index = items
            .iter()
            .position(|i| i.id == item_id)
            .ok_or(CheckoutError::CartItemNotFound(item_id))?;
        Ok((cart, items, index))
    }

    /// Re-activates an overdue cart if needed, then stores it with `changed` lines.
    async fn write_cart(
        &self,
        cart: &mut Cart,
        changed: &[CartItem],
        removed: &[CartItemId],
        now: DateTime<Utc>,
    ) -> Result<()> {
        if cart.reactivate(now)? {
            tracing::info!(cart_id = %cart.id, expires_at = %cart.expires_at, "cart re-activated");
        }
        self.store
            .save_cart_with_items(cart, changed, removed)
            .await?;
        Ok(())
    }

    /// Re-reserves every line of a cart that no longer holds stock.
    ///
    /// Returns true if anything was reserved.
    async fn reacquire(&self, cart: &Cart, items: &[CartItem]) -> Result<bool> {
        if cart.stock_held || items.is_empty() {
            return Ok(false);
        }
        self.ledger.reserve_all(&stock_lines(items)).await?;
        tracing::info!(cart_id = %cart.id, lines = items.len(), "re-acquired cart hold");
        Ok(true)
    }

    async fn notify_item_added(&self, cart: &Cart, product: &Product, quantity: u32) {
        let merchant = self.store.get_merchant(cart.merchant_id).await;
        let shopper = self.store.get_shopper(cart.shopper_id).await;
        let (Ok(Some(merchant)), Ok(Some(shopper))) = (merchant, shopper) else {
            tracing::warn!(cart_id = %cart.id, "skipping item notification, contact data unavailable");
            return;
        };

        let payload = CartItemAddedPayload {
            cart_id: cart.id,
            merchant_id: merchant.id,
            merchant_name: merchant.name.clone(),
            shopper: ShopperContact::from(&shopper),
            product: ProductSummary::from(product),
            quantity,
            cart_total: cart.total_amount,
            shipping_cost: cart.shipping_cost,
            expires_at: cart.expires_at,
            timeout_days: cart.timeout_days,
            checkout_url: self.checkout_url(&merchant.slug, shopper.id),
        };
        notifications::publish(self.publisher.as_ref(), Topic::cart_item_added(), &payload).await;
    }
}

pub(crate) fn stock_lines(items: &[CartItem]) -> Vec<StockLine> {
    items.iter().map(StockLine::from).collect()
}
