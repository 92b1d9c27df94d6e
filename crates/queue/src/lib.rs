//! Reliable at-least-once delivery of notifications.
//!
//! Messages are stored per topic, handed to a [`Deliverer`] one at a time,
//! retried with exponential backoff and finally moved to a dead-letter log.
//! Every delivery carries a stable message id so listeners can deduplicate.

pub mod dead_letter;
pub mod delivery;
pub mod error;
pub mod message;
pub mod postgres;
pub mod queue;
pub mod retry;
pub mod storage;

pub use dead_letter::{DeadLetter, DeadLetterReason};
pub use delivery::{
    Deliverer, DeliveryStatus, IDEMPOTENCY_HEADER, InMemoryDeliverer, WebhookDeliverer,
    WebhookSettings,
};
pub use error::{DeliveryError, QueueError, Result};
pub use message::{DeliveryEnvelope, QueueMessage, Topic};
pub use postgres::PostgresQueueStorage;
pub use queue::{DeliveryQueue, ProcessOutcome, Publisher, QueueStats};
pub use retry::RetryPolicy;
pub use storage::{InMemoryQueueStorage, QueueStorage};
