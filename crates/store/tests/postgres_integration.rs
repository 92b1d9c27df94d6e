//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p store --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use chrono::{Duration, Utc};
use domain::{
    Cart, CartItem, CartStatus, Coupon, Discount, Merchant, Money, Order, OrderLine, OrderStatus,
    OrderTotals, Payment, Product, Shipment, Shopper,
};
use serial_test::serial;
use sqlx::PgPool;
use store::{CartStore, CatalogStore, OrderStore, PostgresStore, StockChange, StoreError};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();

            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_commerce_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();

            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and cleared tables
async fn get_test_store() -> PostgresStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query(
        "TRUNCATE TABLE shipments, payments, order_lines, orders, cart_items, carts, \
         coupon_usages, coupons, products, shoppers, merchants",
    )
    .execute(&pool)
    .await
    .unwrap();

    PostgresStore::new(pool)
}

struct Fixture {
    merchant: Merchant,
    shopper: Shopper,
    product: Product,
}

async fn seed(store: &PostgresStore, stock: u32) -> Fixture {
    let merchant = Merchant::new("Tienda Uno", format!("tienda-{}", uuid::Uuid::new_v4()));
    let shopper = Shopper::new("Ana", "+573001112233");
    let product = Product::new(merchant.id, "Camiseta", Money::new(25_000), stock);
    store.save_merchant(&merchant).await.unwrap();
    store.save_shopper(&shopper).await.unwrap();
    store.save_product(&product).await.unwrap();
    Fixture {
        merchant,
        shopper,
        product,
    }
}

#[tokio::test]
#[serial]
async fn merchant_config_round_trips_through_jsonb() {
    let store = get_test_store().await;
    let mut merchant = Merchant::new("Tienda", "tienda");
    merchant.config.free_shipping = true;
    merchant.config.cart_timeout_days = 5;
    store.save_merchant(&merchant).await.unwrap();

    let loaded = store.get_merchant(merchant.id).await.unwrap().unwrap();
    assert_eq!(loaded.config, merchant.config);
    assert_eq!(loaded.slug, "tienda");
}

#[tokio::test]
#[serial]
async fn conditional_decrement_outcomes() {
    let store = get_test_store().await;
    let fx = seed(&store, 3).await;

    let applied = store.try_decrement_stock(fx.product.id, 2).await.unwrap();
    assert_eq!(applied, StockChange::Applied { remaining: 1 });

    let refused = store.try_decrement_stock(fx.product.id, 2).await.unwrap();
    assert_eq!(refused, StockChange::Insufficient { available: 1 });

    let missing = store
        .try_decrement_stock(common::ProductId::new(), 1)
        .await
        .unwrap();
    assert_eq!(missing, StockChange::Missing);

    let restored = store.increment_stock(fx.product.id, 2).await.unwrap();
    assert_eq!(restored, Some(3));
}

#[tokio::test]
#[serial]
async fn concurrent_decrements_never_oversell() {
    let store = get_test_store().await;
    let fx = seed(&store, 5).await;

    let mut handles = Vec::new();
    for _ in 0..12 {
        let store = store.clone();
        let product_id = fx.product.id;
        handles.push(tokio::spawn(async move {
            store.try_decrement_stock(product_id, 1).await.unwrap()
        }));
    }

    let mut applied = 0;
    for handle in handles {
        if matches!(handle.await.unwrap(), StockChange::Applied { .. }) {
            applied += 1;
        }
    }

    assert_eq!(applied, 5);
    let product = store.get_product(fx.product.id).await.unwrap().unwrap();
    assert_eq!(product.stock, 0);
}

#[tokio::test]
#[serial]
async fn one_active_cart_per_pair() {
    let store = get_test_store().await;
    let fx = seed(&store, 1).await;
    let now = Utc::now();

    let first = Cart::new(fx.shopper.id, fx.merchant.id, 2, None, now);
    store.insert_cart(&first).await.unwrap();

    let second = Cart::new(fx.shopper.id, fx.merchant.id, 2, None, now);
    let result = store.insert_cart(&second).await;
    assert!(matches!(result, Err(StoreError::Conflict(_))));

    // Once the first cart leaves ACTIVE a new one is allowed.
    let mut first = first;
    first.transition_to(CartStatus::Expired, now).unwrap();
    store.save_cart(&mut first).await.unwrap();
    store.insert_cart(&second).await.unwrap();

    let found = store
        .find_cart(fx.shopper.id, fx.merchant.id, &[CartStatus::Active])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.id, second.id);
}

#[tokio::test]
#[serial]
async fn expired_and_expiring_queries() {
    let store = get_test_store().await;
    let fx = seed(&store, 1).await;
    let now = Utc::now();

    let other_shopper = Shopper::new("Luis", "+573009998877");
    store.save_shopper(&other_shopper).await.unwrap();

    let mut overdue = Cart::new(fx.shopper.id, fx.merchant.id, 2, None, now);
    overdue.expires_at = now - Duration::minutes(1);
    store.insert_cart(&overdue).await.unwrap();

    let mut soon = Cart::new(other_shopper.id, fx.merchant.id, 2, None, now);
    soon.expires_at = now + Duration::minutes(30);
    store.insert_cart(&soon).await.unwrap();

    let expired = store.expired_carts(now).await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, overdue.id);

    let expiring = store
        .carts_expiring_between(now, now + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(expiring.len(), 1);
    assert_eq!(expiring[0].id, soon.id);

    let active = store.list_carts(Some(CartStatus::Active)).await.unwrap();
    assert_eq!(active.len(), 2);
    let expired_only = store.list_carts(Some(CartStatus::Expired)).await.unwrap();
    assert!(expired_only.is_empty());
}

#[tokio::test]
#[serial]
async fn cart_items_upsert_and_delete() {
    let store = get_test_store().await;
    let fx = seed(&store, 10).await;
    let now = Utc::now();

    let cart = Cart::new(fx.shopper.id, fx.merchant.id, 2, None, now);
    store.insert_cart(&cart).await.unwrap();

    let mut item = CartItem::new(cart.id, fx.product.id, None, 2, fx.product.price, now);
    store.save_item(&item).await.unwrap();

    item.set_quantity(4);
    store.save_item(&item).await.unwrap();

    let items = store.cart_items(cart.id).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].quantity, 4);
    assert_eq!(items[0].subtotal, Money::new(100_000));

    store.delete_item(item.id).await.unwrap();
    assert!(store.get_item(item.id).await.unwrap().is_none());
}

#[tokio::test]
#[serial]
async fn order_with_lines_payment_and_shipment() {
    let store = get_test_store().await;
    let fx = seed(&store, 10).await;
    let now = Utc::now();

    let lines = vec![
        OrderLine::new(fx.product.id, 2, fx.product.price),
        OrderLine::new(fx.product.id, 1, fx.product.price),
    ];
    let totals = OrderTotals::compute(&lines, Money::zero(), Money::new(8_000));
    let mut order = Order::new(fx.merchant.id, fx.shopper.id, lines, totals, now);
    store.insert_order(&order).await.unwrap();

    let payment = Payment::pending(
        order.id,
        "ref-001",
        Some("rcpt-1".to_string()),
        totals.total,
        None,
        serde_json::json!({"code": "OK"}),
        now,
    );
    store.insert_payment(&payment).await.unwrap();

    let duplicate = Payment::pending(
        order.id,
        "ref-001",
        None,
        totals.total,
        None,
        serde_json::json!({}),
        now,
    );
    assert!(matches!(
        store.insert_payment(&duplicate).await,
        Err(StoreError::Conflict(_))
    ));

    let shipment = Shipment::label_pending(order.id, "coordinadora", "no balance", now);
    store.save_shipment(&shipment).await.unwrap();

    order.payment_id = Some(payment.id);
    order.shipment_id = Some(shipment.id);
    order.transition_to(OrderStatus::ChargePending, now).unwrap();
    store.save_order(&order).await.unwrap();

    let loaded = store.get_order(order.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, OrderStatus::ChargePending);
    assert_eq!(loaded.lines.len(), 2);
    assert_eq!(loaded.lines[0].quantity, 2);
    assert_eq!(loaded.totals.total, Money::new(83_000));
    assert_eq!(loaded.payment_id, Some(payment.id));

    let by_ref = store
        .find_payment_by_reference("ref-001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_ref.id, payment.id);
    assert_eq!(by_ref.raw_response["code"], "OK");

    let loaded_shipment = store.get_shipment(shipment.id).await.unwrap().unwrap();
    assert!(loaded_shipment.is_label_pending());
}

#[tokio::test]
#[serial]
async fn stale_cart_write_is_refused() {
    let store = get_test_store().await;
    let fx = seed(&store, 1).await;
    let now = Utc::now();

    let cart = Cart::new(fx.shopper.id, fx.merchant.id, 2, None, now);
    store.insert_cart(&cart).await.unwrap();

    let mut fresh = store.get_cart(cart.id).await.unwrap().unwrap();
    let mut stale = fresh.clone();

    fresh.total_amount = Money::new(75_000);
    store.save_cart(&mut fresh).await.unwrap();
    assert_eq!(fresh.version, 1);

    stale.transition_to(CartStatus::Expired, now).unwrap();
    let result = store.save_cart(&mut stale).await;
    assert!(matches!(result, Err(StoreError::ConcurrencyConflict { .. })));

    // A stale write carrying lines leaves both tables untouched.
    let mut stale = store.get_cart(cart.id).await.unwrap().unwrap();
    stale.version = 0;
    let item = CartItem::new(cart.id, fx.product.id, None, 3, fx.product.price, now);
    let result = store.save_cart_with_items(&mut stale, &[item.clone()], &[]).await;
    assert!(matches!(result, Err(StoreError::ConcurrencyConflict { .. })));
    assert!(store.get_item(item.id).await.unwrap().is_none());

    let loaded = store.get_cart(cart.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, CartStatus::Active);
    assert_eq!(loaded.version, 1);
    assert_eq!(loaded.total_amount, Money::new(75_000));

    let mut current = loaded;
    store
        .save_cart_with_items(&mut current, &[item.clone()], &[])
        .await
        .unwrap();
    assert_eq!(current.version, 2);
    assert_eq!(store.cart_items(cart.id).await.unwrap().len(), 1);
}

#[tokio::test]
#[serial]
async fn status_guarded_order_write_has_one_winner() {
    let store = get_test_store().await;
    let fx = seed(&store, 10).await;
    let now = Utc::now();

    let lines = vec![OrderLine::new(fx.product.id, 3, fx.product.price)];
    let totals = OrderTotals::compute(&lines, Money::zero(), Money::zero());
    let mut order = Order::new(fx.merchant.id, fx.shopper.id, lines, totals, now);
    order.transition_to(OrderStatus::ChargePending, now).unwrap();
    store.insert_order(&order).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..6 {
        let store = store.clone();
        let mut settled = order.clone();
        handles.push(tokio::spawn(async move {
            settled.transition_to(OrderStatus::Rejected, Utc::now()).unwrap();
            settled.stock_reserved = false;
            store
                .save_order_if_status(&settled, OrderStatus::ChargePending)
                .await
                .unwrap()
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        if let Some(previous) = handle.await.unwrap() {
            winners.push(previous);
        }
    }
    assert_eq!(winners, vec![true]);

    let loaded = store.get_order(order.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, OrderStatus::Rejected);
    assert!(!loaded.stock_reserved);
}

#[tokio::test]
#[serial]
async fn shipments_tracked_by_number_and_status() {
    let store = get_test_store().await;
    let fx = seed(&store, 10).await;
    let now = Utc::now();

    let lines = vec![OrderLine::new(fx.product.id, 1, fx.product.price)];
    let totals = OrderTotals::compute(&lines, Money::zero(), Money::zero());
    let order = Order::new(fx.merchant.id, fx.shopper.id, lines, totals, now);
    store.insert_order(&order).await.unwrap();

    let moving = Shipment::labeled(order.id, "servientrega", "TRK-100", None, "REPARTO", now);
    let delivered = Shipment::labeled(
        order.id,
        "servientrega",
        "TRK-200",
        None,
        "ENTREGADA",
        now + Duration::seconds(1),
    );
    store.save_shipment(&moving).await.unwrap();
    store.save_shipment(&delivered).await.unwrap();

    let tracked = store
        .shipments_to_track(&domain::FINAL_STATUSES, 10)
        .await
        .unwrap();
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].id, moving.id);

    let found = store.find_shipment_by_tracking("TRK-200").await.unwrap().unwrap();
    assert_eq!(found.id, delivered.id);

    let mut updated = moving.clone();
    updated.record_status("ENTREGADA", Some("ENTREGADA - 2024-05-03"));
    assert!(!store.save_shipment_if_status(&updated, "GENERADA").await.unwrap());
    assert!(store.save_shipment_if_status(&updated, "REPARTO").await.unwrap());
    let loaded = store.get_shipment(moving.id).await.unwrap().unwrap();
    assert!(loaded.is_final());
}

#[tokio::test]
#[serial]
async fn coupon_lookup_and_usage() {
    let store = get_test_store().await;
    let fx = seed(&store, 1).await;

    let coupon = Coupon::new(fx.merchant.id, "BIENVENIDA", Discount::Percentage(10));
    store.save_coupon(&coupon).await.unwrap();

    let found = store
        .find_coupon(fx.merchant.id, "BIENVENIDA")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.discount, Discount::Percentage(10));

    assert!(!store.coupon_used_by(coupon.id, fx.shopper.id).await.unwrap());
    store
        .record_coupon_usage(coupon.id, fx.shopper.id, common::OrderId::new())
        .await
        .unwrap();
    assert!(store.coupon_used_by(coupon.id, fx.shopper.id).await.unwrap());
}
