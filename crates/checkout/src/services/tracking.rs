//! Carrier tracking trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

/// Latest event a carrier reports for a tracking number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingEvent {
    /// Status as the carrier words it.
    pub status: String,
    pub date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackingError {
    #[error("carrier does not know tracking number {0}")]
    NotFound(String),

    #[error("carrier tracking unavailable: {0}")]
    Unavailable(String),
}

/// Carrier tracking lookups.
#[async_trait]
pub trait TrackingService: Send + Sync {
    /// Fetches the latest event of a shipment.
    async fn track(&self, carrier: &str, tracking_number: &str)
    -> Result<TrackingEvent, TrackingError>;
}

#[derive(Debug, Default)]
struct InMemoryTrackingState {
    events: HashMap<String, TrackingEvent>,
    failure: Option<TrackingError>,
    lookups: usize,
}

/// In-memory carrier tracking for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTrackingService {
    state: Arc<RwLock<InMemoryTrackingState>>,
}

impl InMemoryTrackingService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets what the carrier reports for `tracking_number`.
    pub async fn set_event(&self, tracking_number: &str, status: &str) {
        self.state.write().await.events.insert(
            tracking_number.to_string(),
            TrackingEvent {
                status: status.to_string(),
                date: None,
            },
        );
    }

    /// Makes every lookup fail with `error` (or answer again with `None`).
    pub async fn set_failure(&self, error: Option<TrackingError>) {
        self.state.write().await.failure = error;
    }

    /// Number of lookups received.
    pub async fn lookup_count(&self) -> usize {
        self.state.read().await.lookups
    }
}

#[async_trait]
impl TrackingService for InMemoryTrackingService {
    async fn track(
        &self,
        _carrier: &str,
        tracking_number: &str,
    ) -> Result<TrackingEvent, TrackingError> {
        let mut state = self.state.write().await;
        state.lookups += 1;
        if let Some(error) = state.failure.clone() {
            return Err(error);
        }
        state
            .events
            .get(tracking_number)
            .cloned()
            .ok_or_else(|| TrackingError::NotFound(tracking_number.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reports_configured_events() {
        let service = InMemoryTrackingService::new();
        service.set_event("TRK-000001", "EN_RUTA").await;

        let event = service.track("coordinadora", "TRK-000001").await.unwrap();
        assert_eq!(event.status, "EN_RUTA");
        assert_eq!(
            service.track("coordinadora", "TRK-000002").await,
            Err(TrackingError::NotFound("TRK-000002".to_string()))
        );

        service
            .set_failure(Some(TrackingError::Unavailable("timeout".to_string())))
            .await;
        assert!(service.track("coordinadora", "TRK-000001").await.is_err());
        assert_eq!(service.lookup_count().await, 3);
    }
}
