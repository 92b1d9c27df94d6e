//! Delivery of envelopes to downstream listeners.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::DeliveryError;
use crate::message::{DeliveryEnvelope, Topic};

/// Header carrying the stable message id on every webhook call.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Result of a successful delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// The listener acknowledged the envelope.
    Delivered,
    /// No listener is configured for the topic; the message is dropped as handled.
    Skipped,
}

/// Pushes one envelope to whoever listens on its topic.
#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver(&self, envelope: &DeliveryEnvelope) -> Result<DeliveryStatus, DeliveryError>;
}

/// Listener endpoints and HTTP timeout for [`WebhookDeliverer`].
#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub timeout: Duration,
    pub endpoints: HashMap<Topic, String>,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            endpoints: HashMap::new(),
        }
    }
}

impl WebhookSettings {
    /// Registers the listener URL of a topic.
    pub fn with_endpoint(mut self, topic: Topic, url: impl Into<String>) -> Self {
        self.endpoints.insert(topic, url.into());
        self
    }
}

/// Delivers envelopes as JSON POSTs to per-topic webhook URLs.
#[derive(Clone)]
pub struct WebhookDeliverer {
    client: reqwest::Client,
    endpoints: HashMap<Topic, String>,
}

impl WebhookDeliverer {
    /// Builds the HTTP client with the configured timeout.
    pub fn new(settings: WebhookSettings) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| DeliveryError::Misconfigured(e.to_string()))?;
        Ok(Self {
            client,
            endpoints: settings.endpoints,
        })
    }
}

#[async_trait]
impl Deliverer for WebhookDeliverer {
    #[tracing::instrument(skip(self, envelope), fields(topic = %envelope.topic, message_id = %envelope.message_id))]
    async fn deliver(&self, envelope: &DeliveryEnvelope) -> Result<DeliveryStatus, DeliveryError> {
        let Some(url) = self.endpoints.get(&envelope.topic) else {
            tracing::debug!("no listener configured, skipping");
            return Ok(DeliveryStatus::Skipped);
        };

        let response = self
            .client
            .post(url)
            .header(IDEMPOTENCY_HEADER, envelope.message_id.to_string())
            .json(envelope)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(DeliveryStatus::Delivered)
    }
}

#[derive(Default)]
struct InMemoryDelivererState {
    delivered: Vec<DeliveryEnvelope>,
    attempts: usize,
    failures_remaining: Option<usize>,
}

/// In-memory deliverer for testing; records every envelope it accepts.
#[derive(Clone, Default)]
pub struct InMemoryDeliverer {
    state: Arc<RwLock<InMemoryDelivererState>>,
}

impl InMemoryDeliverer {
    /// Creates a deliverer that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `count` attempts.
    pub async fn fail_next(&self, count: usize) {
        self.state.write().await.failures_remaining = Some(count);
    }

    /// Fails every attempt until reset with `fail_next(0)`.
    pub async fn fail_always(&self) {
        self.state.write().await.failures_remaining = Some(usize::MAX);
    }

    /// Envelopes accepted so far, in delivery order.
    pub async fn delivered(&self) -> Vec<DeliveryEnvelope> {
        self.state.read().await.delivered.clone()
    }

    /// Attempts made so far, failed ones included.
    pub async fn attempts(&self) -> usize {
        self.state.read().await.attempts
    }
}

#[async_trait]
impl Deliverer for InMemoryDeliverer {
    async fn deliver(&self, envelope: &DeliveryEnvelope) -> Result<DeliveryStatus, DeliveryError> {
        let mut state = self.state.write().await;
        state.attempts += 1;

        if let Some(remaining) = state.failures_remaining.as_mut()
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(DeliveryError::Status {
                status: 503,
                body: "listener unavailable".to_string(),
            });
        }

        state.delivered.push(envelope.clone());
        Ok(DeliveryStatus::Delivered)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::message::QueueMessage;

    fn envelope(topic: Topic) -> DeliveryEnvelope {
        let message = QueueMessage::new(topic, r#"{"cart_id":"c-1"}"#, Utc::now());
        DeliveryEnvelope::from_message(&message).unwrap()
    }

    #[tokio::test]
    async fn posts_envelope_with_idempotency_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/expired"))
            .and(header_exists(IDEMPOTENCY_HEADER))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let settings = WebhookSettings::default().with_endpoint(
            Topic::cart_expired(),
            format!("{}/hooks/expired", server.uri()),
        );
        let deliverer = WebhookDeliverer::new(settings).unwrap();

        let status = deliverer
            .deliver(&envelope(Topic::cart_expired()))
            .await
            .unwrap();
        assert_eq!(status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let settings = WebhookSettings::default()
            .with_endpoint(Topic::comment(), format!("{}/comments", server.uri()));
        let deliverer = WebhookDeliverer::new(settings).unwrap();

        let result = deliverer.deliver(&envelope(Topic::comment())).await;
        match result {
            Err(DeliveryError::Status { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unconfigured_topic_is_skipped() {
        let deliverer = WebhookDeliverer::new(WebhookSettings::default()).unwrap();
        let status = deliverer
            .deliver(&envelope(Topic::cart_expiring()))
            .await
            .unwrap();
        assert_eq!(status, DeliveryStatus::Skipped);
    }

    #[tokio::test]
    async fn slow_listener_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let settings = WebhookSettings {
            timeout: Duration::from_millis(50),
            ..WebhookSettings::default()
        }
        .with_endpoint(Topic::comment(), server.uri());
        let deliverer = WebhookDeliverer::new(settings).unwrap();

        let result = deliverer.deliver(&envelope(Topic::comment())).await;
        assert!(matches!(result, Err(DeliveryError::Timeout)));
    }

    #[tokio::test]
    async fn in_memory_deliverer_fails_on_demand() {
        let deliverer = InMemoryDeliverer::new();
        deliverer.fail_next(1).await;

        assert!(deliverer.deliver(&envelope(Topic::comment())).await.is_err());
        assert!(deliverer.deliver(&envelope(Topic::comment())).await.is_ok());
        assert_eq!(deliverer.attempts().await, 2);
        assert_eq!(deliverer.delivered().await.len(), 1);
    }
}
