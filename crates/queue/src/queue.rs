//! The delivery queue: enqueue, consume, retry and dead-letter.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dead_letter::{DeadLetter, DeadLetterReason};
use crate::delivery::{Deliverer, DeliveryStatus};
use crate::error::Result;
use crate::message::{DeliveryEnvelope, QueueMessage, Topic};
use crate::retry::RetryPolicy;
use crate::storage::QueueStorage;

/// Fire-and-forget publication of notifications.
///
/// Returns `false` when the message could not be stored; callers log and
/// carry on, since a lost notification must never undo business state.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: Topic, payload: serde_json::Value) -> bool;
}

/// Result of one consumer step on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Nothing was ready.
    Idle,
    /// The message was delivered (or skipped for lack of a listener) and removed.
    Delivered,
    /// Delivery failed; the message will be retried after `retry_count` retries.
    Retried { retry_count: u32 },
    /// The message was moved to the dead-letter log.
    DeadLettered(DeadLetterReason),
}

/// Depth of the live queue per topic.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub depths: BTreeMap<String, usize>,
    pub total: usize,
}

/// At-least-once delivery queue over a pluggable storage and deliverer.
#[derive(Clone)]
pub struct DeliveryQueue {
    storage: Arc<dyn QueueStorage>,
    deliverer: Arc<dyn Deliverer>,
    policy: RetryPolicy,
}

impl DeliveryQueue {
    pub fn new(
        storage: Arc<dyn QueueStorage>,
        deliverer: Arc<dyn Deliverer>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            storage,
            deliverer,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Serializes `payload` and appends it to `topic` with a fresh message id.
    pub async fn enqueue<T: Serialize + ?Sized>(&self, topic: Topic, payload: &T) -> bool {
        match serde_json::to_string(payload) {
            Ok(json) => self.enqueue_raw(topic, json).await,
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "payload could not be serialized");
                false
            }
        }
    }

    /// Appends an already encoded payload; it is validated only on delivery.
    pub async fn enqueue_raw(&self, topic: Topic, payload: String) -> bool {
        let message = QueueMessage::new(topic.clone(), payload, Utc::now());
        let message_id = message.id;
        match self.storage.push(message).await {
            Ok(()) => {
                metrics::counter!("queue_enqueued_total", "topic" => topic.to_string())
                    .increment(1);
                tracing::debug!(topic = %topic, message_id = %message_id, "message enqueued");
                true
            }
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "failed to enqueue message");
                false
            }
        }
    }

    /// Claims and handles at most one message of `topic`.
    #[tracing::instrument(skip(self, topic), fields(topic = %topic))]
    pub async fn process_next(&self, topic: &Topic, now: DateTime<Utc>) -> Result<ProcessOutcome> {
        let Some(message) = self.storage.claim(topic, now).await? else {
            return Ok(ProcessOutcome::Idle);
        };

        if self.policy.is_expired(&message, now) {
            return self
                .bury(message, DeadLetterReason::Expired, None, now)
                .await;
        }

        let envelope = match DeliveryEnvelope::from_message(&message) {
            Ok(envelope) => envelope,
            Err(e) => {
                return self
                    .bury(message, DeadLetterReason::Malformed, Some(e.to_string()), now)
                    .await;
            }
        };

        let start = Instant::now();
        let result = self.deliverer.deliver(&envelope).await;
        metrics::histogram!("queue_delivery_duration_seconds").record(start.elapsed().as_secs_f64());

        match result {
            Ok(status) => {
                self.storage.ack(message.id).await?;
                metrics::counter!("queue_delivered_total", "topic" => topic.to_string())
                    .increment(1);
                if status == DeliveryStatus::Skipped {
                    tracing::debug!(message_id = %message.id, "no listener, message dropped");
                } else {
                    tracing::debug!(message_id = %message.id, "message delivered");
                }
                Ok(ProcessOutcome::Delivered)
            }
            Err(e) if self.policy.should_retry(message.retry_count) => {
                let retry_count = message.retry_count + 1;
                let delay = self.policy.backoff(message.retry_count);
                let available_at = now
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                self.storage
                    .reschedule(message.id, retry_count, available_at)
                    .await?;
                metrics::counter!("queue_retried_total", "topic" => topic.to_string())
                    .increment(1);
                tracing::warn!(
                    message_id = %message.id,
                    retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "delivery failed, retrying after delay"
                );
                Ok(ProcessOutcome::Retried { retry_count })
            }
            Err(e) => {
                self.bury(
                    message,
                    DeadLetterReason::RetriesExhausted,
                    Some(e.to_string()),
                    now,
                )
                .await
            }
        }
    }

    async fn bury(
        &self,
        message: QueueMessage,
        reason: DeadLetterReason,
        last_error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ProcessOutcome> {
        tracing::error!(
            message_id = %message.id,
            topic = %message.topic,
            retry_count = message.retry_count,
            reason = %reason,
            error = last_error.as_deref().unwrap_or(""),
            "moving message to dead-letter log"
        );
        metrics::counter!(
            "queue_dead_lettered_total",
            "topic" => message.topic.to_string(),
            "reason" => reason.as_str()
        )
        .increment(1);

        let entry = DeadLetter::from_message(message, reason, last_error, now);
        self.storage.dead_letter(entry).await?;
        Ok(ProcessOutcome::DeadLettered(reason))
    }

    /// Messages of `topic` still to be delivered.
    pub async fn depth(&self, topic: &Topic) -> Result<usize> {
        self.storage.depth(topic).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let depths = self.storage.depths().await?;
        let total = depths.values().sum();
        Ok(QueueStats { depths, total })
    }

    /// Most recent dead letters first.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        self.storage.dead_letters(limit).await
    }

    /// Returns claims left behind by a previous process to the live queue.
    pub async fn recover(&self, now: DateTime<Utc>) -> Result<u64> {
        self.storage.release_stale_claims(now).await
    }

    /// Starts one sequential consumer per topic.
    ///
    /// Each consumer drains its topic until idle, then sleeps for the poll
    /// interval. Cancelling `token` stops every consumer after its current
    /// message.
    pub fn spawn_consumers(
        &self,
        topics: Vec<Topic>,
        token: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        topics
            .into_iter()
            .map(|topic| {
                let queue = self.clone();
                let token = token.clone();
                tokio::spawn(async move { queue.consume(topic, token).await })
            })
            .collect()
    }

    async fn consume(&self, topic: Topic, token: CancellationToken) {
        tracing::info!(topic = %topic, "queue consumer started");
        loop {
            if token.is_cancelled() {
                break;
            }

            let idle = match self.process_next(&topic, Utc::now()).await {
                Ok(ProcessOutcome::Idle) => true,
                Ok(_) => false,
                Err(e) => {
                    tracing::error!(topic = %topic, error = %e, "queue consumer step failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.policy.poll_interval) => {}
                    _ = token.cancelled() => break,
                }
            }
        }
        tracing::info!(topic = %topic, "queue consumer stopped");
    }
}

#[async_trait]
impl Publisher for DeliveryQueue {
    async fn publish(&self, topic: Topic, payload: serde_json::Value) -> bool {
        self.enqueue(topic, &payload).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::delivery::InMemoryDeliverer;
    use crate::storage::InMemoryQueueStorage;

    fn queue_with(deliverer: InMemoryDeliverer) -> (DeliveryQueue, InMemoryQueueStorage) {
        let storage = InMemoryQueueStorage::new();
        let queue = DeliveryQueue::new(
            Arc::new(storage.clone()),
            Arc::new(deliverer),
            RetryPolicy::default(),
        );
        (queue, storage)
    }

    #[tokio::test]
    async fn enqueue_then_deliver() {
        let deliverer = InMemoryDeliverer::new();
        let (queue, _) = queue_with(deliverer.clone());

        assert!(
            queue
                .enqueue(Topic::comment(), &serde_json::json!({"text": "hola"}))
                .await
        );
        let outcome = queue
            .process_next(&Topic::comment(), Utc::now())
            .await
            .unwrap();

        assert_eq!(outcome, ProcessOutcome::Delivered);
        assert_eq!(queue.depth(&Topic::comment()).await.unwrap(), 0);
        let delivered = deliverer.delivered().await;
        assert_eq!(delivered[0].payload["text"], "hola");
        assert_eq!(delivered[0].retry_count, 0);
    }

    #[tokio::test]
    async fn idle_when_topic_empty() {
        let (queue, _) = queue_with(InMemoryDeliverer::new());
        let outcome = queue
            .process_next(&Topic::cart_expired(), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, ProcessOutcome::Idle);
    }

    #[tokio::test]
    async fn failed_delivery_is_rescheduled_with_backoff() {
        let deliverer = InMemoryDeliverer::new();
        deliverer.fail_next(1).await;
        let (queue, storage) = queue_with(deliverer);

        queue.enqueue(Topic::comment(), &"x").await;
        let now = Utc::now();
        let outcome = queue.process_next(&Topic::comment(), now).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Retried { retry_count: 1 });

        let waiting = storage.messages(&Topic::comment()).await;
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].retry_count, 1);
        assert_eq!(waiting[0].available_at, now + chrono::Duration::seconds(2));

        // Not yet available.
        let outcome = queue.process_next(&Topic::comment(), now).await.unwrap();
        assert_eq!(outcome, ProcessOutcome::Idle);
    }

    #[tokio::test]
    async fn malformed_payload_goes_straight_to_dead_letters() {
        let deliverer = InMemoryDeliverer::new();
        let (queue, _) = queue_with(deliverer.clone());

        queue
            .enqueue_raw(Topic::comment(), "{broken".to_string())
            .await;
        let outcome = queue
            .process_next(&Topic::comment(), Utc::now())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ProcessOutcome::DeadLettered(DeadLetterReason::Malformed)
        );
        assert_eq!(deliverer.attempts().await, 0);
        let letters = queue.dead_letters(10).await.unwrap();
        assert_eq!(letters[0].payload, "{broken");
    }

    #[tokio::test]
    async fn expired_message_is_not_delivered() {
        let deliverer = InMemoryDeliverer::new();
        let (queue, _) = queue_with(deliverer.clone());

        queue.enqueue(Topic::comment(), &1).await;
        let later = Utc::now() + chrono::Duration::hours(25);
        let outcome = queue.process_next(&Topic::comment(), later).await.unwrap();

        assert_eq!(outcome, ProcessOutcome::DeadLettered(DeadLetterReason::Expired));
        assert_eq!(deliverer.attempts().await, 0);
    }

    #[tokio::test]
    async fn stats_report_depth_per_topic() {
        let (queue, _) = queue_with(InMemoryDeliverer::new());
        queue.enqueue(Topic::comment(), &1).await;
        queue.enqueue(Topic::comment(), &2).await;
        queue.enqueue(Topic::cart_expired(), &3).await;

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.depths.get("comment"), Some(&2));
    }

    #[tokio::test]
    async fn consumers_stop_on_cancel() {
        let deliverer = InMemoryDeliverer::new();
        let storage = InMemoryQueueStorage::new();
        let queue = DeliveryQueue::new(
            Arc::new(storage),
            Arc::new(deliverer.clone()),
            RetryPolicy {
                poll_interval: Duration::from_millis(10),
                ..RetryPolicy::default()
            },
        );
        queue.enqueue(Topic::comment(), &"hi").await;

        let token = CancellationToken::new();
        let handles = queue.spawn_consumers(vec![Topic::comment()], token.clone());

        for _ in 0..100 {
            if !deliverer.delivered().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        token.cancel();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(deliverer.delivered().await.len(), 1);
    }
}
