use thiserror::Error;

/// Errors that can occur when interacting with the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness rule was violated (e.g. a second ACTIVE cart for a pair).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A versioned or status-guarded write found the row already changed.
    #[error("Concurrency conflict on {entity} {id}: expected {expected}")]
    ConcurrencyConflict {
        entity: &'static str,
        id: String,
        expected: String,
    },

    /// A persisted row could not be mapped back into a domain value.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
