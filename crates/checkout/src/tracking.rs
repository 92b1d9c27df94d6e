//! Shipment tracking: carrier status updates and the periodic tracking pass.

use std::sync::Arc;
use std::time::Duration;

use domain::{FINAL_STATUSES, Shipment, normalize_tracking_status};
use queue::{Publisher, Topic};
use serde::Serialize;
use store::{Store, StoreError};
use tokio_util::sync::CancellationToken;

use crate::error::{CheckoutError, Result};
use crate::notifications::{self, ShipmentStatusPayload, ShippingInfo, ShopperContact};
use crate::retry::retry_transient;
use crate::scheduler::{SchedulerHandle, run_interval};
use crate::services::TrackingService;

const MAX_SHIPMENT_WRITE_ATTEMPTS: u32 = 3;

/// Cadence and pacing of the tracking pass.
#[derive(Debug, Clone)]
pub struct TrackingSettings {
    /// Zero disables the periodic pass.
    pub interval: Duration,
    /// Shipments checked per pass, newest first.
    pub batch_limit: usize,
    /// Pause between two carrier lookups.
    pub request_spacing: Duration,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1800),
            batch_limit: 50,
            request_spacing: Duration::from_secs(1),
        }
    }
}

/// Result of recording a shipment status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum StatusChange {
    Unchanged { status: String },
    Changed { previous: String, status: String },
}

impl StatusChange {
    pub fn is_changed(&self) -> bool {
        matches!(self, StatusChange::Changed { .. })
    }
}

/// Counters of one tracking pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackingReport {
    pub checked: usize,
    pub updated: usize,
    pub failures: usize,
}

/// Keeps shipment statuses in step with the carriers.
///
/// Every status change is published on `shipment_status_changed`; writes
/// that change nothing publish nothing.
pub struct ShipmentTracker<S: Store, T> {
    store: S,
    tracking: Arc<T>,
    publisher: Arc<dyn Publisher>,
    settings: TrackingSettings,
    token: CancellationToken,
}

impl<S: Store, T> Clone for ShipmentTracker<S, T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            tracking: self.tracking.clone(),
            publisher: self.publisher.clone(),
            settings: self.settings.clone(),
            token: self.token.clone(),
        }
    }
}

impl<S, T> ShipmentTracker<S, T>
where
    S: Store,
    T: TrackingService + 'static,
{
    pub fn new(
        store: S,
        tracking: Arc<T>,
        publisher: Arc<dyn Publisher>,
        settings: TrackingSettings,
    ) -> Self {
        Self {
            store,
            tracking,
            publisher,
            settings,
            token: CancellationToken::new(),
        }
    }

    /// Spawns the periodic tracking pass.
    pub fn start(&self) -> SchedulerHandle {
        let tracker = self.clone();
        let pass = tokio::spawn(async move {
            let token = tracker.token.clone();
            let period = tracker.settings.interval;
            run_interval("shipment_tracking", period, token, || {
                let tracker = tracker.clone();
                async move { tracker.run_pass().await }
            })
            .await;
        });
        tracing::info!(
            interval_secs = self.settings.interval.as_secs(),
            batch_limit = self.settings.batch_limit,
            "shipment tracker started"
        );
        SchedulerHandle::new(self.token.clone(), vec![pass])
    }

    async fn run_pass(&self) {
        match self.run_tracking_pass().await {
            Ok(report) => tracing::info!(
                checked = report.checked,
                updated = report.updated,
                failures = report.failures,
                "tracking pass finished"
            ),
            Err(err) => tracing::error!(error = %err, "tracking pass failed"),
        }
    }

    /// Sets a shipment's status by hand. The status is upper-cased.
    #[tracing::instrument(skip(self))]
    pub async fn update_status(&self, tracking_number: &str, status: &str) -> Result<StatusChange> {
        let status = status.trim().to_uppercase();
        if status.is_empty() {
            return Err(CheckoutError::InvalidShipmentStatus(status));
        }
        self.record(tracking_number, &status, None).await
    }

    /// Applies a carrier webhook.
    ///
    /// Stage 1 means in transit, stage 2 delivered; anything else is taken as
    /// processed. A carrier that differs from the shipment's is logged and
    /// the update still applies.
    #[tracing::instrument(skip(self))]
    pub async fn apply_webhook(
        &self,
        tracking_number: &str,
        carrier: Option<&str>,
        stage: Option<i64>,
    ) -> Result<StatusChange> {
        let shipment = self.get_shipment(tracking_number).await?;
        if let Some(carrier) = carrier
            && !carrier.eq_ignore_ascii_case(&shipment.carrier)
        {
            tracing::warn!(
                tracking_number,
                stored = %shipment.carrier,
                reported = carrier,
                "webhook carrier does not match shipment"
            );
        }
        let carrier = carrier.unwrap_or("carrier");
        let (status, note) = match stage {
            Some(1) => ("TRANSITO URBANO", format!("in transit with {carrier}")),
            Some(2) => ("ENTREGADA", format!("delivered by {carrier}")),
            _ => ("PROCESADA", format!("processed by {carrier}")),
        };
        self.record(tracking_number, status, Some(&note)).await
    }

    /// Asks the carrier for one shipment's latest status and records it.
    #[tracing::instrument(skip(self))]
    pub async fn check_shipment(&self, tracking_number: &str) -> Result<StatusChange> {
        let shipment = self.get_shipment(tracking_number).await?;
        self.check(&shipment).await
    }

    /// Checks the newest shipments that are not in a final status yet.
    ///
    /// Lookups are spaced by `request_spacing`; a failing shipment is counted
    /// and the pass moves on.
    #[tracing::instrument(skip(self))]
    pub async fn run_tracking_pass(&self) -> Result<TrackingReport> {
        let started = std::time::Instant::now();
        let shipments = self
            .store
            .shipments_to_track(&FINAL_STATUSES, self.settings.batch_limit)
            .await?;
        let mut report = TrackingReport::default();

        for (index, shipment) in shipments.iter().enumerate() {
            if index > 0 && !self.settings.request_spacing.is_zero() {
                tokio::time::sleep(self.settings.request_spacing).await;
            }
            report.checked += 1;
            match self.check(shipment).await {
                Ok(change) if change.is_changed() => report.updated += 1,
                Ok(_) => {}
                Err(err) => {
                    report.failures += 1;
                    tracing::warn!(
                        tracking_number = shipment.tracking_number.as_deref().unwrap_or_default(),
                        error = %err,
                        "shipment tracking failed"
                    );
                }
            }
        }

        metrics::counter!("tracking_passes_total").increment(1);
        metrics::histogram!("tracking_pass_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        Ok(report)
    }

    async fn check(&self, shipment: &Shipment) -> Result<StatusChange> {
        let tracking_number = shipment
            .tracking_number
            .as_deref()
            .ok_or_else(|| CheckoutError::ShipmentNotFound(shipment.id.to_string()))?;
        let event = self
            .tracking
            .track(&shipment.carrier, tracking_number)
            .await
            .map_err(|err| CheckoutError::TrackingUnavailable(err.to_string()))?;
        let status = normalize_tracking_status(&event.status);
        let note = match &event.date {
            Some(date) => format!("{} - {date}", event.status),
            None => event.status.clone(),
        };
        self.record(tracking_number, status, Some(&note)).await
    }

    async fn record(
        &self,
        tracking_number: &str,
        status: &str,
        note: Option<&str>,
    ) -> Result<StatusChange> {
        retry_transient(MAX_SHIPMENT_WRITE_ATTEMPTS, |_| {
            self.try_record(tracking_number, status, note)
        })
        .await
    }

    async fn try_record(
        &self,
        tracking_number: &str,
        status: &str,
        note: Option<&str>,
    ) -> Result<StatusChange> {
        let mut shipment = self.get_shipment(tracking_number).await?;
        let expected = shipment.status.clone();
        let Some(previous) = shipment.record_status(status, note) else {
            return Ok(StatusChange::Unchanged {
                status: expected,
            });
        };
        if !self.store.save_shipment_if_status(&shipment, &expected).await? {
            return Err(StoreError::ConcurrencyConflict {
                entity: "shipment",
                id: shipment.id.to_string(),
                expected: format!("status {expected}"),
            }
            .into());
        }

        metrics::counter!("shipment_status_changes_total").increment(1);
        tracing::info!(tracking_number, %previous, status, "shipment status changed");
        self.publish_change(&shipment, &previous).await;
        Ok(StatusChange::Changed {
            previous,
            status: status.to_string(),
        })
    }

    async fn publish_change(&self, shipment: &Shipment, previous: &str) {
        let loaded = async {
            let order = self.store.get_order(shipment.order_id).await?;
            let Some(order) = order else {
                return Ok(None);
            };
            let payment = match order.payment_id {
                Some(payment_id) => self.store.get_payment(payment_id).await?,
                None => None,
            };
            let shopper = self.store.get_shopper(order.shopper_id).await?;
            Ok::<_, StoreError>(payment.zip(shopper).map(|pair| (order, pair)))
        };
        let (order, (payment, shopper)) = match loaded.await {
            Ok(Some(found)) => found,
            Ok(None) => {
                tracing::warn!(order_id = %shipment.order_id, "shipment change not published: order, payment or shopper missing");
                return;
            }
            Err(err) => {
                tracing::warn!(order_id = %shipment.order_id, error = %err, "shipment change not published");
                return;
            }
        };

        let payload = ShipmentStatusPayload {
            payment_reference: payment.external_reference.clone(),
            receipt_number: payment.receipt_number.clone(),
            order_id: order.id,
            shopper: ShopperContact::from(&shopper),
            amount: payment.amount,
            status: shipment.status.clone(),
            previous_status: Some(previous.to_string()),
            shipping: Some(ShippingInfo::new(shipment, &shopper)),
        };
        notifications::publish(
            self.publisher.as_ref(),
            Topic::shipment_status_changed(),
            &payload,
        )
        .await;
    }

    /// Returns the shipment carrying `tracking_number`.
    pub async fn get_shipment(&self, tracking_number: &str) -> Result<Shipment> {
        self.store
            .find_shipment_by_tracking(tracking_number)
            .await?
            .ok_or_else(|| CheckoutError::ShipmentNotFound(tracking_number.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use common::OrderId;
    use domain::{Money, Order, OrderLine, OrderStatus, OrderTotals, Payment};
    use store::{InMemoryStore, OrderStore};

    use super::*;
    use crate::services::{InMemoryTrackingService, TrackingError};
    use crate::testing::Fixture;

    type Tracker = ShipmentTracker<InMemoryStore, InMemoryTrackingService>;

    fn tracker(fx: &Fixture, carrier: &Arc<InMemoryTrackingService>) -> Tracker {
        ShipmentTracker::new(
            fx.store.clone(),
            carrier.clone(),
            fx.publisher.clone(),
            TrackingSettings {
                request_spacing: Duration::ZERO,
                ..TrackingSettings::default()
            },
        )
    }

    /// An accepted order with a paid charge and a labeled shipment.
    async fn shipped(fx: &Fixture, tracking_number: &str) -> Shipment {
        let lines = vec![OrderLine::new(common::ProductId::new(), 1, Money::new(5000))];
        let totals = OrderTotals::compute(&lines, Money::zero(), Money::new(1000));
        let mut order = Order::new(fx.merchant.id, fx.shopper.id, lines, totals, Utc::now());
        let payment = Payment::pending(
            order.id,
            format!("CHG-{tracking_number}"),
            None,
            totals.total,
            None,
            serde_json::Value::Null,
            Utc::now(),
        );
        fx.store.insert_payment(&payment).await.unwrap();
        let shipment = Shipment::labeled(
            order.id,
            "coordinadora",
            tracking_number,
            None,
            "GENERADA",
            Utc::now(),
        );
        fx.store.save_shipment(&shipment).await.unwrap();
        order.payment_id = Some(payment.id);
        order.shipment_id = Some(shipment.id);
        order.status = OrderStatus::Accepted;
        order.stock_reserved = false;
        fx.store.insert_order(&order).await.unwrap();
        shipment
    }

    #[tokio::test]
    async fn test_update_status_publishes_only_real_changes() {
        let fx = Fixture::new().await;
        let carrier = Arc::new(InMemoryTrackingService::new());
        let tracker = tracker(&fx, &carrier);
        shipped(&fx, "TRK-1").await;

        let change = tracker.update_status("TRK-1", "reparto").await.unwrap();
        assert_eq!(
            change,
            StatusChange::Changed {
                previous: "GENERADA".to_string(),
                status: "REPARTO".to_string(),
            }
        );
        let again = tracker.update_status("TRK-1", "REPARTO").await.unwrap();
        assert!(!again.is_changed());

        let messages = fx.messages(&Topic::shipment_status_changed()).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["status"], "REPARTO");
        assert_eq!(messages[0]["previous_status"], "GENERADA");
        assert_eq!(messages[0]["payment_reference"], "CHG-TRK-1");
        assert_eq!(messages[0]["shipping"]["tracking_number"], "TRK-1");

        assert!(matches!(
            tracker.update_status("TRK-404", "REPARTO").await,
            Err(CheckoutError::ShipmentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_webhook_maps_stages_and_appends_notes() {
        let fx = Fixture::new().await;
        let carrier = Arc::new(InMemoryTrackingService::new());
        let tracker = tracker(&fx, &carrier);
        shipped(&fx, "TRK-2").await;

        let change = tracker
            .apply_webhook("TRK-2", Some("envia"), Some(1))
            .await
            .unwrap();
        assert!(change.is_changed());
        tracker
            .apply_webhook("TRK-2", Some("coordinadora"), Some(2))
            .await
            .unwrap();

        let shipment = fx.store.find_shipment_by_tracking("TRK-2").await.unwrap().unwrap();
        assert_eq!(shipment.status, "ENTREGADA");
        assert_eq!(
            shipment.message.as_deref(),
            Some("in transit with envia | delivered by coordinadora")
        );

        let change = tracker.apply_webhook("TRK-2", None, None).await.unwrap();
        assert_eq!(
            change,
            StatusChange::Changed {
                previous: "ENTREGADA".to_string(),
                status: "PROCESADA".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_tracking_pass_normalizes_and_skips_final_shipments() {
        let fx = Fixture::new().await;
        let carrier = Arc::new(InMemoryTrackingService::new());
        let tracker = tracker(&fx, &carrier);
        shipped(&fx, "TRK-A").await;
        shipped(&fx, "TRK-B").await;
        shipped(&fx, "TRK-C").await;
        let done = shipped(&fx, "TRK-D").await;
        tracker.update_status("TRK-D", "ENTREGADA").await.unwrap();
        carrier.set_event("TRK-A", "en_ruta").await;
        carrier.set_event("TRK-B", "GENERADA EN CALI").await;

        let report = tracker.run_tracking_pass().await.unwrap();

        assert_eq!(
            report,
            TrackingReport {
                checked: 3,
                updated: 1,
                failures: 1,
            }
        );
        let a = fx.store.find_shipment_by_tracking("TRK-A").await.unwrap().unwrap();
        assert_eq!(a.status, "TRANSITO URBANO");
        assert_eq!(a.message.as_deref(), Some("en_ruta"));
        let d = fx.store.get_shipment(done.id).await.unwrap().unwrap();
        assert_eq!(d.status, "ENTREGADA");
        assert_eq!(carrier.lookup_count().await, 3);
    }

    #[tokio::test]
    async fn test_check_shipment_surfaces_carrier_failures() {
        let fx = Fixture::new().await;
        let carrier = Arc::new(InMemoryTrackingService::new());
        let tracker = tracker(&fx, &carrier);
        shipped(&fx, "TRK-E").await;
        carrier
            .set_failure(Some(TrackingError::Unavailable("timeout".to_string())))
            .await;

        assert!(matches!(
            tracker.check_shipment("TRK-E").await,
            Err(CheckoutError::TrackingUnavailable(_))
        ));

        carrier.set_failure(None).await;
        carrier.set_event("TRK-E", "Reparto en curso").await;
        let change = tracker.check_shipment("TRK-E").await.unwrap();
        assert_eq!(
            change,
            StatusChange::Changed {
                previous: "GENERADA".to_string(),
                status: "REPARTO".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_change_without_order_is_recorded_but_not_published() {
        let fx = Fixture::new().await;
        let carrier = Arc::new(InMemoryTrackingService::new());
        let tracker = tracker(&fx, &carrier);
        let orphan = Shipment::labeled(OrderId::new(), "envia", "TRK-F", None, "CREADA", Utc::now());
        fx.store.save_shipment(&orphan).await.unwrap();

        let change = tracker.update_status("TRK-F", "RECIBIDA").await.unwrap();

        assert!(change.is_changed());
        assert!(fx.messages(&Topic::shipment_status_changed()).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_tracker_stops_on_shutdown() {
        let fx = Fixture::new().await;
        let carrier = Arc::new(InMemoryTrackingService::new());
        let tracker = ShipmentTracker::new(
            fx.store.clone(),
            carrier.clone(),
            fx.publisher.clone(),
            TrackingSettings {
                interval: Duration::from_secs(60),
                batch_limit: 10,
                request_spacing: Duration::ZERO,
            },
        );
        shipped(&fx, "TRK-G").await;
        carrier.set_event("TRK-G", "RECIBIDA").await;

        let handle = tracker.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.shutdown().await;

        let shipment = fx.store.find_shipment_by_tracking("TRK-G").await.unwrap().unwrap();
        assert_eq!(shipment.status, "RECIBIDA");
        assert_eq!(carrier.lookup_count().await, 1);
    }
}
