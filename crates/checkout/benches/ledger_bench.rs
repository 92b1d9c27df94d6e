use std::sync::Arc;

use checkout::{CartManager, CartSettings, InventoryLedger, StockLine, TokenSigner};
use criterion::{Criterion, criterion_group, criterion_main};
use domain::{Merchant, Money, Product, Shopper};
use queue::{DeliveryQueue, InMemoryDeliverer, InMemoryQueueStorage, RetryPolicy};
use store::{CatalogStore, InMemoryStore};

fn bench_reserve_release(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryStore::new();
    let product = Product::new(Merchant::new("Bench", "bench").id, "Mug", Money::new(1000), 1_000);
    rt.block_on(async { store.save_product(&product).await.unwrap() });
    let ledger = InventoryLedger::new(store);

    c.bench_function("ledger/reserve_release", |b| {
        b.iter(|| {
            rt.block_on(async {
                ledger.reserve(product.id, 3).await.unwrap();
                ledger.release(product.id, 3).await.unwrap();
            });
        });
    });
}

fn bench_reserve_all(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = InMemoryStore::new();
    let merchant = Merchant::new("Bench", "bench");
    let products: Vec<Product> = (0..5)
        .map(|i| Product::new(merchant.id, format!("Item {i}"), Money::new(1000), 1_000))
        .collect();
    rt.block_on(async {
        for product in &products {
            store.save_product(product).await.unwrap();
        }
    });
    let ledger = InventoryLedger::new(store);
    let lines: Vec<StockLine> = products.iter().map(|p| StockLine::new(p.id, 2)).collect();

    c.bench_function("ledger/reserve_all_5_lines", |b| {
        b.iter(|| {
            rt.block_on(async {
                ledger.reserve_all(&lines).await.unwrap();
                ledger.release_all(&lines).await.unwrap();
            });
        });
    });
}

fn bench_cart_add_item(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("cart/create_and_add_item", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryStore::new();
                let publisher = Arc::new(DeliveryQueue::new(
                    Arc::new(InMemoryQueueStorage::new()),
                    Arc::new(InMemoryDeliverer::new()),
                    RetryPolicy::default(),
                ));
                let signer = TokenSigner::new(b"bench-secret", chrono::Duration::days(7)).unwrap();
                let carts = CartManager::new(store.clone(), publisher, signer, CartSettings::default());

                let merchant = Merchant::new("Bench", "bench");
                let shopper = Shopper::new("Bench", "3000000000");
                let product = Product::new(merchant.id, "Mug", Money::new(1000), 100);
                store.save_merchant(&merchant).await.unwrap();
                store.save_shopper(&shopper).await.unwrap();
                store.save_product(&product).await.unwrap();

                let cart = carts
                    .create_cart(shopper.id, merchant.id, None, None)
                    .await
                    .unwrap();
                carts.add_item(cart.id, product.id, 2, None).await.unwrap();
            });
        });
    });
}

criterion_group!(benches, bench_reserve_release, bench_reserve_all, bench_cart_add_item);
criterion_main!(benches);
