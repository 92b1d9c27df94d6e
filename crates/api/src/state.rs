//! Shared application state.

use std::sync::Arc;

use checkout::{
    CartManager, ExpirationScheduler, InMemoryChargeGateway, InMemoryInvoiceService,
    InMemoryLabelService, InMemoryTrackingService, SettlementService, ShipmentTracker,
    TokenError, TokenSigner,
};
use queue::DeliveryQueue;
use store::Store;

use crate::config::Config;

/// Settlement wired to the built-in gateway, carrier and invoicing clients.
pub type Settlement<S> =
    SettlementService<S, InMemoryChargeGateway, InMemoryLabelService, InMemoryInvoiceService>;

/// Tracker wired to the built-in carrier tracking client.
pub type Tracker<S> = ShipmentTracker<S, InMemoryTrackingService>;

/// Shared application state accessible from all handlers.
pub struct AppState<S: Store> {
    pub store: S,
    pub carts: CartManager<S>,
    pub settlement: Settlement<S>,
    pub scheduler: ExpirationScheduler<S>,
    pub tracker: Tracker<S>,
    pub queue: Arc<DeliveryQueue>,
}

/// Wires the checkout services over `store` and `queue`.
///
/// Fails only if the cart token secret is empty.
pub fn create_state<S: Store>(
    store: S,
    queue: Arc<DeliveryQueue>,
    config: &Config,
) -> Result<Arc<AppState<S>>, TokenError> {
    let signer = TokenSigner::new(config.token_secret.as_bytes(), config.token_ttl())?;
    let carts = CartManager::new(
        store.clone(),
        queue.clone(),
        signer,
        config.cart_settings(),
    );
    let scheduler = ExpirationScheduler::new(
        carts.clone(),
        store.clone(),
        queue.clone(),
        config.scheduler_settings(),
    );
    let settlement = SettlementService::new(
        store.clone(),
        carts.clone(),
        Arc::new(InMemoryChargeGateway::new()),
        Arc::new(InMemoryLabelService::new()),
        Arc::new(InMemoryInvoiceService::new()),
        queue.clone(),
        config.settlement_settings(),
    );
    let tracker = ShipmentTracker::new(
        store.clone(),
        Arc::new(InMemoryTrackingService::new()),
        queue.clone(),
        config.tracking_settings(),
    );

    Ok(Arc::new(AppState {
        store,
        carts,
        settlement,
        scheduler,
        tracker,
        queue,
    }))
}
