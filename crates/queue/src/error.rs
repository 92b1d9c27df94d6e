use thiserror::Error;

/// Errors raised by queue storage backends.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The backend refused the operation.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A stored row could not be mapped back into a message.
    #[error("Corrupt queue row: {0}")]
    Corrupt(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for queue storage operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Why a single delivery attempt failed.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The listener answered with a non-success status.
    #[error("Listener responded with HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The request never got an answer (DNS, connect, reset).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The listener did not answer within the configured timeout.
    #[error("Delivery timed out")]
    Timeout,

    /// The deliverer could not be built or used as configured.
    #[error("Delivery misconfigured: {0}")]
    Misconfigured(String),
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DeliveryError::Timeout
        } else {
            DeliveryError::Transport(err.to_string())
        }
    }
}
