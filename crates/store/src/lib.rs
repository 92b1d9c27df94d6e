//! Persistence layer for catalog, carts, orders and payments.
//!
//! Business code depends on the [`CatalogStore`], [`CartStore`] and
//! [`OrderStore`] traits. Two backends implement all of them:
//! [`InMemoryStore`] for tests and development, and [`PostgresStore`].

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use store::{CartStore, CatalogStore, OrderStore, StockChange, Store};
