//! Shared fixture for unit tests.

use std::sync::Arc;

use chrono::Duration;
use common::ProductId;
use domain::{Merchant, Money, Product, Shopper};
use queue::{DeliveryQueue, InMemoryDeliverer, InMemoryQueueStorage, RetryPolicy, Topic};
use store::{CatalogStore, InMemoryStore};

use crate::cart::{CartManager, CartSettings};
use crate::token::TokenSigner;

pub(crate) struct Fixture {
    pub store: InMemoryStore,
    pub queue_storage: InMemoryQueueStorage,
    pub publisher: Arc<DeliveryQueue>,
    pub carts: CartManager<InMemoryStore>,
    pub merchant: Merchant,
    pub shopper: Shopper,
}

impl Fixture {
    pub async fn new() -> Self {
        let store = InMemoryStore::new();
        let queue_storage = InMemoryQueueStorage::new();
        let publisher = Arc::new(DeliveryQueue::new(
            Arc::new(queue_storage.clone()),
            Arc::new(InMemoryDeliverer::new()),
            RetryPolicy::default(),
        ));
        let signer = TokenSigner::new(b"unit-test-secret", Duration::days(7)).unwrap();
        let carts = CartManager::new(
            store.clone(),
            publisher.clone(),
            signer,
            CartSettings {
                frontend_url: "https://shop.test/".to_string(),
                ..CartSettings::default()
            },
        );

        let merchant = Merchant::new("Tienda", "tienda");
        store.save_merchant(&merchant).await.unwrap();
        let mut shopper = Shopper::new("Ana", "3001234567");
        shopper.email = Some("ana@example.test".to_string());
        store.save_shopper(&shopper).await.unwrap();

        Self {
            store,
            queue_storage,
            publisher,
            carts,
            merchant,
            shopper,
        }
    }

    pub async fn product(&self, price: i64, stock: u32) -> Product {
        let product = Product::new(self.merchant.id, "Mug", Money::new(price), stock);
        self.store.save_product(&product).await.unwrap();
        product
    }

    pub async fn stock(&self, id: ProductId) -> u32 {
        self.store.get_product(id).await.unwrap().unwrap().stock
    }

    /// Decoded payloads queued on a topic.
    pub async fn messages(&self, topic: &Topic) -> Vec<serde_json::Value> {
        self.queue_storage
            .messages(topic)
            .await
            .iter()
            .map(|m| serde_json::from_str(&m.payload).unwrap())
            .collect()
    }
}
