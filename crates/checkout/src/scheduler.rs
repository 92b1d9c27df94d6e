//! Background expiration of overdue carts and expiry warnings.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{CartId, ProductId};
use domain::{Cart, CartItem, CartStatus};
use queue::{Publisher, Topic};
use serde::Serialize;
use store::Store;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::cart::CartManager;
use crate::error::{CheckoutError, Result};
use crate::notifications::{self, CartExpiredPayload, CartExpiringPayload, ShopperContact};

/// Cadence of the two scheduler loops.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub sweep_interval: Duration,
    pub warning_interval: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(300),
            warning_interval: Duration::from_secs(3600),
        }
    }
}

/// A product a cart cannot get back after expiring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Shortage {
    pub product_id: ProductId,
    pub requested: u32,
    /// Units the cart could reclaim: stock left once its own hold was released.
    pub reclaimable: u32,
    pub missing: bool,
}

/// What happened to one overdue cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "disposition", content = "shortages", rename_all = "snake_case")]
pub enum CartDisposition {
    /// Expired without lines; nothing to notify.
    Empty,
    /// Expired and the shopper was sent a recovery link.
    Notified,
    /// Expired, but the notification could not be queued.
    Unnotified,
    /// Expired silently; some lines could not be bought any more.
    StockIssue(Vec<Shortage>),
    /// Left alone: the stored cart was no longer ACTIVE and overdue.
    Skipped,
}

/// Counters of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub notified: usize,
    pub stock_issues: usize,
    /// Listed as overdue but changed before it could be expired.
    pub skipped: usize,
    pub failures: usize,
}

/// Handle to the running scheduler loops.
pub struct SchedulerHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub(crate) fn new(token: CancellationToken, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { token, tasks }
    }

    /// Cancels the loops without waiting for them.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancels the loops and waits for them to finish their current pass.
    pub async fn shutdown(self) {
        self.token.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "scheduler task ended abnormally");
            }
        }
        tracing::info!("scheduled loops stopped");
    }
}

/// Expires overdue carts and warns shoppers whose carts are about to expire.
///
/// Constructed explicitly and started with [`start`](Self::start); every
/// loop stops when the scheduler's cancellation token fires.
#[derive(Clone)]
pub struct ExpirationScheduler<S: Store> {
    carts: CartManager<S>,
    store: S,
    publisher: Arc<dyn Publisher>,
    settings: SchedulerSettings,
    token: CancellationToken,
}

impl<S: Store> ExpirationScheduler<S> {
    /// Creates a new scheduler with its own cancellation token.
    pub fn new(
        carts: CartManager<S>,
        store: S,
        publisher: Arc<dyn Publisher>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            carts,
            store,
            publisher,
            settings,
            token: CancellationToken::new(),
        }
    }

    /// Token that stops every loop started by this scheduler.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawns the sweep and warning loops.
    pub fn start(&self) -> SchedulerHandle {
        let sweeper = self.clone();
        let sweep = tokio::spawn(async move {
            let token = sweeper.token.clone();
            let period = sweeper.settings.sweep_interval;
            run_interval("cart_sweep", period, token, || {
                let sweeper = sweeper.clone();
                async move { sweeper.run_sweep().await }
            })
            .await;
        });

        let warner = self.clone();
        let warnings = tokio::spawn(async move {
            let token = warner.token.clone();
            let period = warner.settings.warning_interval;
            run_interval("cart_expiry_warnings", period, token, || {
                let warner = warner.clone();
                async move { warner.run_warnings().await }
            })
            .await;
        });

        tracing::info!(
            sweep_interval_secs = self.settings.sweep_interval.as_secs(),
            warning_interval_secs = self.settings.warning_interval.as_secs(),
            "expiration scheduler started"
        );
        SchedulerHandle::new(self.token.clone(), vec![sweep, warnings])
    }

    async fn run_sweep(&self) {
        match self.sweep_expired(Utc::now()).await {
            Ok(report) if report.expired > 0 || report.failures > 0 => {
                tracing::info!(
                    expired = report.expired,
                    notified = report.notified,
                    stock_issues = report.stock_issues,
                    skipped = report.skipped,
                    failures = report.failures,
                    "cart sweep finished"
                );
            }
            Ok(_) => tracing::debug!("cart sweep found nothing to expire"),
            Err(err) => tracing::error!(error = %err, "cart sweep failed"),
        }
    }

    async fn run_warnings(&self) {
        match self.send_expiration_warnings(Utc::now()).await {
            Ok(sent) => tracing::debug!(sent, "expiry warnings sent"),
            Err(err) => tracing::error!(error = %err, "expiry warnings failed"),
        }
    }

    /// Expires every ACTIVE cart whose deadline is before `now`.
    ///
    /// Carts are handled independently; one failing cart is counted and
    /// expired best-effort without stopping the sweep. Each cart is re-read
    /// before it is expired, so one touched since the listing is skipped.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let started = std::time::Instant::now();
        let overdue = self.store.expired_carts(now).await?;
        let mut report = SweepReport::default();

        for cart in overdue {
            let cart_id = cart.id;
            match self.handle_overdue(cart_id, Some(now)).await {
                Ok(CartDisposition::Skipped) => report.skipped += 1,
                Ok(disposition) => {
                    report.expired += 1;
                    match disposition {
                        CartDisposition::Notified => report.notified += 1,
                        CartDisposition::StockIssue(_) => report.stock_issues += 1,
                        _ => {}
                    }
                }
                Err(err) => {
                    report.failures += 1;
                    tracing::error!(%cart_id, error = %err, "failed to process overdue cart");
                    if let Err(err) = self.carts.expire_current(cart_id, Some(now)).await {
                        tracing::error!(%cart_id, error = %err, "fallback expiry failed");
                    }
                }
            }
        }

        metrics::counter!("cart_sweeps_total").increment(1);
        metrics::histogram!("cart_sweep_duration_seconds").record(started.elapsed().as_secs_f64());
        Ok(report)
    }

    /// Runs the expiry handling for one ACTIVE cart now, whatever its deadline.
    #[tracing::instrument(skip(self))]
    pub async fn process_cart(&self, cart_id: CartId) -> Result<CartDisposition> {
        let cart = self
            .store
            .get_cart(cart_id)
            .await?
            .ok_or(CheckoutError::CartNotFound(cart_id))?;
        if cart.status != CartStatus::Active {
            return Err(CheckoutError::CartNotUsable {
                cart_id,
                status: cart.status,
            });
        }
        self.handle_overdue(cart_id, None).await
    }

    /// Publishes `cart_expiring` for ACTIVE carts expiring within two hours.
    ///
    /// Carts expiring in `(now+1h, now+2h]` get `hours_left = 2`, those in
    /// `(now, now+1h]` get `hours_left = 1`. Changes no state.
    #[tracing::instrument(skip(self))]
    pub async fn send_expiration_warnings(&self, now: DateTime<Utc>) -> Result<usize> {
        let hour = chrono::Duration::hours(1);
        let windows = [(2, now + hour, now + hour * 2), (1, now, now + hour)];
        let mut sent = 0;

        for (hours_left, after, until) in windows {
            for cart in self.store.carts_expiring_between(after, until).await? {
                match self.warn_cart(&cart, hours_left).await {
                    Ok(true) => sent += 1,
                    Ok(false) => {}
                    Err(err) => {
                        tracing::warn!(cart_id = %cart.id, error = %err, "expiry warning skipped");
                    }
                }
            }
        }
        Ok(sent)
    }

    /// Expires the stored cart if it is still ACTIVE (and overdue at
    /// `overdue_at`, when given), then notifies the shopper.
    async fn handle_overdue(
        &self,
        cart_id: CartId,
        overdue_at: Option<DateTime<Utc>>,
    ) -> Result<CartDisposition> {
        let Some((cart, items)) = self.carts.expire_current(cart_id, overdue_at).await? else {
            tracing::debug!(%cart_id, "cart changed since it was listed, skipped");
            return Ok(CartDisposition::Skipped);
        };
        if items.is_empty() {
            return Ok(CartDisposition::Empty);
        }

        let shortages = self.shortages(&items).await?;
        if !shortages.is_empty() {
            for shortage in &shortages {
                tracing::warn!(
                    %cart_id,
                    product_id = %shortage.product_id,
                    requested = shortage.requested,
                    reclaimable = shortage.reclaimable,
                    missing = shortage.missing,
                    "expired cart cannot be recovered in full"
                );
            }
            return Ok(CartDisposition::StockIssue(shortages));
        }

        if self.notify_expired(&cart, &items).await? {
            Ok(CartDisposition::Notified)
        } else {
            Ok(CartDisposition::Unnotified)
        }
    }

    /// Lines the shopper could not buy again; runs after the hold is released.
    async fn shortages(&self, items: &[CartItem]) -> Result<Vec<Shortage>> {
        let mut requested: BTreeMap<ProductId, u32> = BTreeMap::new();
        for item in items {
            *requested.entry(item.product_id).or_default() += item.quantity;
        }

        let mut shortages = Vec::new();
        for (product_id, quantity) in requested {
            let Some(product) = self.store.get_product(product_id).await? else {
                shortages.push(Shortage {
                    product_id,
                    requested: quantity,
                    reclaimable: 0,
                    missing: true,
                });
                continue;
            };
            if quantity > product.stock {
                shortages.push(Shortage {
                    product_id,
                    requested: quantity,
                    reclaimable: product.stock,
                    missing: false,
                });
            }
        }
        Ok(shortages)
    }

    async fn notify_expired(&self, cart: &Cart, items: &[CartItem]) -> Result<bool> {
        let merchant = self
            .store
            .get_merchant(cart.merchant_id)
            .await?
            .ok_or(CheckoutError::MerchantNotFound(cart.merchant_id))?;
        let shopper = self
            .store
            .get_shopper(cart.shopper_id)
            .await?
            .ok_or(CheckoutError::ShopperNotFound(cart.shopper_id))?;
        let recovery = self.carts.recovery_link_for(cart);

        let payload = CartExpiredPayload {
            cart_id: cart.id,
            merchant_id: merchant.id,
            merchant_name: merchant.name,
            shopper: ShopperContact::from(&shopper),
            total_amount: cart.total_amount,
            shipping_cost: cart.shipping_cost,
            items_count: items.len(),
            payment_link: recovery.link,
            recovery_token: recovery.token,
            expires_at: cart.expires_at,
            created_at: cart.created_at,
        };
        Ok(notifications::publish(self.publisher.as_ref(), Topic::cart_expired(), &payload).await)
    }

    async fn warn_cart(&self, cart: &Cart, hours_left: u32) -> Result<bool> {
        let items = self.store.cart_items(cart.id).await?;
        let merchant = self
            .store
            .get_merchant(cart.merchant_id)
            .await?
            .ok_or(CheckoutError::MerchantNotFound(cart.merchant_id))?;
        let shopper = self
            .store
            .get_shopper(cart.shopper_id)
            .await?
            .ok_or(CheckoutError::ShopperNotFound(cart.shopper_id))?;

        let payload = CartExpiringPayload {
            cart_id: cart.id,
            merchant_id: merchant.id,
            checkout_url: self.carts.checkout_url(&merchant.slug, shopper.id),
            merchant_name: merchant.name,
            shopper: ShopperContact::from(&shopper),
            total_amount: cart.total_amount,
            items_count: items.len(),
            hours_left,
            expires_at: cart.expires_at,
        };
        Ok(notifications::publish(self.publisher.as_ref(), Topic::cart_expiring(), &payload).await)
    }
}

/// Runs `task` every `period` until `token` is cancelled.
///
/// Every pass is spawned as its own task, so a slow pass never holds back
/// the next tick and passes may overlap. Once cancelled, the loop waits for
/// the passes still running.
pub(crate) async fn run_interval<F, Fut>(
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    mut task: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    if period.is_zero() {
        tracing::warn!(task = name, "zero interval, scheduled task disabled");
        return;
    }

    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut passes = JoinSet::new();
    loop {
        tokio::select! {
            _ = tick.tick() => {
                while let Some(finished) = passes.try_join_next() {
                    log_pass_end(name, finished);
                }
                if !passes.is_empty() {
                    tracing::warn!(task = name, running = passes.len(), "previous pass still running");
                }
                tracing::debug!(task = name, "running scheduled task");
                passes.spawn(task());
            }
            _ = token.cancelled() => {
                break;
            }
        }
    }

    while let Some(finished) = passes.join_next().await {
        log_pass_end(name, finished);
    }
}

fn log_pass_end(name: &'static str, finished: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(err) = finished {
        tracing::error!(task = name, error = %err, "scheduled pass crashed");
    }
}
