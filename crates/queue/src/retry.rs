use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::message::QueueMessage;

/// Redelivery budget and backoff for failed deliveries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total delivery attempts per message, the first one included.
    pub max_attempts: u32,
    /// Delay unit for exponential backoff.
    pub base_delay: Duration,
    /// Messages older than this are dead-lettered instead of delivered.
    pub message_ttl: Duration,
    /// Consumer sleep when a topic has nothing ready.
    pub poll_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            message_ttl: Duration::from_secs(24 * 60 * 60),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Returns true if a message that just failed with `retry_count` prior
    /// retries may be attempted again.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count.saturating_add(1) < self.max_attempts
    }

    /// Delay before the next attempt: `base × 2^(retry_count + 1)`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_add(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Returns true if the message outlived the TTL.
    pub fn is_expired(&self, message: &QueueMessage, now: DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::from_std(self.message_ttl).unwrap_or(chrono::Duration::MAX);
        now - message.enqueued_at > ttl
    }
}
