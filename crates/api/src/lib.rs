//! HTTP API server for the checkout system.
//!
//! Exposes carts, orders, payment confirmations, shipment tracking and the
//! delivery queue over REST, with structured logging (tracing) and
//! Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, patch, post, put};
use metrics_exporter_prometheus::PrometheusHandle;
use store::Store;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use state::{AppState, Settlement, Tracker, create_state};

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: Store>(state: Arc<AppState<S>>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(routes::metrics::MetricsState {
            handle: metrics_handle,
            queue: state.queue.clone(),
        });

    Router::new()
        .route("/health", get(routes::health::check::<S>))
        // Carts
        .route("/carts", post(routes::carts::create::<S>))
        .route("/carts", get(routes::carts::list::<S>))
        .route("/carts/{id}", get(routes::carts::get::<S>))
        .route("/carts/{id}/items", post(routes::carts::add_item::<S>))
        .route("/cart-items/{id}", put(routes::carts::update_item::<S>))
        .route("/cart-items/{id}", delete(routes::carts::remove_item::<S>))
        .route("/carts/{id}/expire", post(routes::carts::expire::<S>))
        .route("/carts/{id}/cancel", post(routes::carts::cancel::<S>))
        .route("/carts/{id}/extend", put(routes::carts::extend::<S>))
        .route("/carts/{id}/shipping", put(routes::carts::update_shipping::<S>))
        .route(
            "/carts/{id}/time-remaining",
            get(routes::carts::time_remaining::<S>),
        )
        .route(
            "/carts/{id}/recovery-link",
            post(routes::carts::recovery_link::<S>),
        )
        .route("/carts/{id}/resume", get(routes::carts::resume::<S>))
        .route("/carts/{id}/checkout", post(routes::carts::checkout::<S>))
        .route("/carts/{id}/process", post(routes::carts::process::<S>))
        .route(
            "/shoppers/{shopper}/merchants/{merchant}/cart",
            get(routes::carts::open_cart::<S>),
        )
        // Orders and payments
        .route("/orders", post(routes::orders::create::<S>))
        .route("/orders/{id}", get(routes::orders::get::<S>))
        .route("/orders/{id}/rollback", post(routes::orders::rollback::<S>))
        .route(
            "/payments/confirmation",
            post(routes::payments::confirm::<S>),
        )
        .route(
            "/payments/{reference}/renotify",
            post(routes::payments::renotify::<S>),
        )
        // Shipments
        .route(
            "/shipments/status/{tracking}",
            patch(routes::shipments::update_status::<S>),
        )
        .route(
            "/shipments/tracking-webhook",
            post(routes::shipments::webhook::<S>),
        )
        .route(
            "/shipments/tracking/{tracking}",
            get(routes::shipments::tracking_info::<S>),
        )
        .route("/tracking/check-all", post(routes::shipments::check_all::<S>))
        .route(
            "/tracking/check/{tracking}",
            post(routes::shipments::check::<S>),
        )
        // Queue
        .route("/comments", post(routes::deliveries::comment::<S>))
        .route("/queue/stats", get(routes::deliveries::stats::<S>))
        .route("/queue/dead-letters", get(routes::deliveries::dead_letters::<S>))
        // Catalog
        .route("/merchants", post(routes::catalog::create_merchant::<S>))
        .route("/shoppers", post(routes::catalog::create_shopper::<S>))
        .route("/products", post(routes::catalog::create_product::<S>))
        .route("/coupons", post(routes::catalog::create_coupon::<S>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
