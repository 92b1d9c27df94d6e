//! Inventory ledger: the only writer of product stock counters.

use common::ProductId;
use domain::{CartItem, OrderLine};
use store::{CatalogStore, StockChange};

use crate::error::{CheckoutError, Result};

/// A product quantity to reserve or release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockLine {
    pub product_id: ProductId,
    pub quantity: u32,
}

impl StockLine {
    pub fn new(product_id: ProductId, quantity: u32) -> Self {
        Self {
            product_id,
            quantity,
        }
    }
}

impl From<&CartItem> for StockLine {
    fn from(item: &CartItem) -> Self {
        Self::new(item.product_id, item.quantity)
    }
}

impl From<&OrderLine> for StockLine {
    fn from(line: &OrderLine) -> Self {
        Self::new(line.product_id, line.quantity)
    }
}

/// Reserves and releases product stock.
///
/// Every decrement goes through [`CatalogStore::try_decrement_stock`], so the
/// availability check and the write are a single atomic step and stock can
/// never go negative, however many callers race for the last unit.
#[derive(Clone)]
pub struct InventoryLedger<S> {
    store: S,
}

impl<S> InventoryLedger<S>
where
    S: CatalogStore + Clone,
{
    /// Creates a new ledger over the given catalog.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Takes `quantity` units out of stock, returning what is left.
    #[tracing::instrument(skip(self))]
    pub async fn reserve(&self, product_id: ProductId, quantity: u32) -> Result<u32> {
        if quantity == 0 {
            let product = self
                .store
                .get_product(product_id)
                .await?
                .ok_or(CheckoutError::ProductNotFound(product_id))?;
            return Ok(product.stock);
        }

        match self.store.try_decrement_stock(product_id, quantity).await? {
            StockChange::Applied { remaining } => {
                metrics::counter!("inventory_reservations_total", "outcome" => "reserved")
                    .increment(1);
                Ok(remaining)
            }
            StockChange::Insufficient { available } => {
                metrics::counter!("inventory_reservations_total", "outcome" => "insufficient")
                    .increment(1);
                Err(CheckoutError::InsufficientStock {
                    product_id,
                    requested: quantity,
                    available,
                })
            }
            StockChange::Missing => {
                metrics::counter!("inventory_reservations_total", "outcome" => "missing")
                    .increment(1);
                Err(CheckoutError::ProductNotFound(product_id))
            }
        }
    }

    /// Puts `quantity` units back. A product that no longer exists is logged and skipped.
    #[tracing::instrument(skip(self))]
    pub async fn release(&self, product_id: ProductId, quantity: u32) -> Result<()> {
        if quantity == 0 {
            return Ok(());
        }
        match self.store.increment_stock(product_id, quantity).await? {
            Some(_) => {
                metrics::counter!("inventory_released_units_total").increment(u64::from(quantity));
            }
            None => {
                tracing::warn!(%product_id, quantity, "released stock for a missing product");
            }
        }
        Ok(())
    }

    /// Reserves every line or none of them.
    ///
    /// On the first failure, lines already reserved by this call are released
    /// again before the error is returned.
    pub async fn reserve_all(&self, lines: &[StockLine]) -> Result<()> {
        for (index, line) in lines.iter().enumerate() {
            if let Err(err) = self.reserve(line.product_id, line.quantity).await {
                self.release_all(&lines[..index]).await?;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Releases every line, returning the number of units restored.
    pub async fn release_all(&self, lines: &[StockLine]) -> Result<u32> {
        let mut restored = 0;
        for line in lines {
            self.release(line.product_id, line.quantity).await?;
            restored += line.quantity;
        }
        Ok(restored)
    }

    /// Current stock of a product.
    pub async fn available(&self, product_id: ProductId) -> Result<u32> {
        self.store
            .get_product(product_id)
            .await?
            .map(|p| p.stock)
            .ok_or(CheckoutError::ProductNotFound(product_id))
    }
}

#[cfg(test)]
mod tests {
    use domain::{Merchant, Money, Product};
    use store::InMemoryStore;

    use super::*;

    async fn setup(stock: u32) -> (InventoryLedger<InMemoryStore>, ProductId) {
        let store = InMemoryStore::new();
        let merchant = Merchant::new("Shop", "shop");
        store.save_merchant(&merchant).await.unwrap();
        let product = Product::new(merchant.id, "Mug", Money::new(1000), stock);
        store.save_product(&product).await.unwrap();
        (InventoryLedger::new(store), product.id)
    }

    #[tokio::test]
    async fn test_reserve_and_release_round_trip() {
        let (ledger, product) = setup(10).await;

        assert_eq!(ledger.reserve(product, 4).await.unwrap(), 6);
        ledger.release(product, 4).await.unwrap();
        assert_eq!(ledger.available(product).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_reserve_more_than_available_fails() {
        let (ledger, product) = setup(2).await;

        let err = ledger.reserve(product, 3).await.unwrap_err();
        assert!(matches!(
            err,
            CheckoutError::InsufficientStock {
                requested: 3,
                available: 2,
                ..
            }
        ));
        assert_eq!(ledger.available(product).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_zero_quantity_returns_current_stock() {
        let (ledger, product) = setup(7).await;
        assert_eq!(ledger.reserve(product, 0).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_missing_product() {
        let (ledger, _) = setup(1).await;
        let missing = ProductId::new();

        assert!(matches!(
            ledger.reserve(missing, 1).await,
            Err(CheckoutError::ProductNotFound(id)) if id == missing
        ));
        // Releasing into a missing product is not fatal.
        ledger.release(missing, 1).await.unwrap();
    }

    #[tokio::test]
    async fn test_reserve_all_is_all_or_nothing() {
        let (ledger, first) = setup(5).await;
        let merchant = Merchant::new("Other", "other");
        ledger.store.save_merchant(&merchant).await.unwrap();
        let scarce = Product::new(merchant.id, "Rare", Money::new(500), 1);
        ledger.store.save_product(&scarce).await.unwrap();

        let lines = [StockLine::new(first, 3), StockLine::new(scarce.id, 2)];
        assert!(ledger.reserve_all(&lines).await.is_err());

        assert_eq!(ledger.available(first).await.unwrap(), 5);
        assert_eq!(ledger.available(scarce.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_reservations_never_oversell() {
        let (ledger, product) = setup(5).await;

        let mut handles = Vec::new();
        for _ in 0..20 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(
                async move { ledger.reserve(product, 1).await },
            ));
        }

        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                succeeded += 1;
            }
        }
        assert_eq!(succeeded, 5);
        assert_eq!(ledger.available(product).await.unwrap(), 0);
    }
}
