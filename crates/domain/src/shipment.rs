//! Shipments produced after payment acceptance.

use chrono::{DateTime, Utc};
use common::{OrderId, ShipmentId};
use serde::{Deserialize, Serialize};

/// Status recorded when the carrier could not produce a label.
pub const LABEL_PENDING: &str = "LABEL_PENDING";

/// Status of a shipment the merchant delivers itself.
pub const LOCAL_DELIVERY: &str = "LOCAL_DELIVERY";

/// Carrier status assumed when a reported one is not recognised.
pub const DEFAULT_TRACKING_STATUS: &str = "GUÍA ADMITIDA";

/// Carrier statuses after which a shipment is no longer tracked.
pub const FINAL_STATUSES: [&str; 7] = [
    "ENTREGADA",
    "FINALIZADA",
    "DEVOLUCIÓN RATIFICADA",
    "DEVUELTA",
    "CANCELADA",
    "NO_ENTREGADA",
    "RETENIDA",
];

const TRACKING_STATUSES: [&str; 17] = [
    "GUÍA ADMITIDA",
    "GENERADA",
    "CREADA",
    "RECIBIDA",
    "PROCESADA",
    "TRANSITO URBANO",
    "CENTRO DE ACOPIO",
    "TELEMERCADO",
    "REENVÍO",
    "REPARTO",
    "ENTREGADA",
    "FINALIZADA",
    "DEVOLUCIÓN RATIFICADA",
    "DEVUELTA",
    "CANCELADA",
    "NO_ENTREGADA",
    "RETENIDA",
];

const TRACKING_ALIASES: [(&str, &str); 6] = [
    ("GENERADA EN BOGOTA", "GENERADA"),
    ("GENERADA EN MEDELLIN", "GENERADA"),
    ("GENERADA EN CALI", "GENERADA"),
    ("ENTREGADO", "ENTREGADA"),
    ("EN_TRANSITO", "TRANSITO URBANO"),
    ("EN_RUTA", "TRANSITO URBANO"),
];

/// Maps a status reported by a carrier onto the known tracking statuses.
///
/// Aliases win, then exact matches, then the first known status contained
/// in (or containing) the reported one. Anything else becomes
/// [`DEFAULT_TRACKING_STATUS`].
pub fn normalize_tracking_status(reported: &str) -> &'static str {
    let normalized = reported.trim().to_uppercase();
    if normalized.is_empty() {
        return DEFAULT_TRACKING_STATUS;
    }
    if let Some((_, status)) = TRACKING_ALIASES.iter().find(|(alias, _)| *alias == normalized) {
        return status;
    }
    if let Some(status) = TRACKING_STATUSES.iter().find(|s| **s == normalized) {
        return status;
    }
    TRACKING_STATUSES
        .iter()
        .find(|s| normalized.contains(**s) || s.contains(normalized.as_str()))
        .copied()
        .unwrap_or(DEFAULT_TRACKING_STATUS)
}

/// Carrier label and tracking data for an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shipment {
    pub id: ShipmentId,
    pub order_id: OrderId,
    pub carrier: String,
    pub tracking_number: Option<String>,
    pub label_url: Option<String>,
    pub status: String,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Shipment {
    /// A shipment with a label issued by the carrier.
    pub fn labeled(
        order_id: OrderId,
        carrier: impl Into<String>,
        tracking_number: impl Into<String>,
        label_url: Option<String>,
        status: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ShipmentId::new(),
            order_id,
            carrier: carrier.into(),
            tracking_number: Some(tracking_number.into()),
            label_url,
            status: status.into(),
            message: None,
            created_at: now,
        }
    }

    /// A shipment whose label still has to be produced.
    pub fn label_pending(
        order_id: OrderId,
        carrier: impl Into<String>,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ShipmentId::new(),
            order_id,
            carrier: carrier.into(),
            tracking_number: None,
            label_url: None,
            status: LABEL_PENDING.to_string(),
            message: Some(reason.into()),
            created_at: now,
        }
    }

    /// A merchant-delivered shipment that needs no carrier label.
    pub fn local(order_id: OrderId, now: DateTime<Utc>) -> Self {
        Self {
            id: ShipmentId::new(),
            order_id,
            carrier: "local".to_string(),
            tracking_number: Some(format!("LOCAL-{}-{}", order_id, now.timestamp_millis())),
            label_url: None,
            status: LOCAL_DELIVERY.to_string(),
            message: Some("free shipping handled by the merchant".to_string()),
            created_at: now,
        }
    }

    /// Returns true if the carrier label is still missing.
    pub fn is_label_pending(&self) -> bool {
        self.status == LABEL_PENDING
    }

    /// Returns true once the carrier reported a final status.
    pub fn is_final(&self) -> bool {
        FINAL_STATUSES.contains(&self.status.as_str())
    }

    /// Moves to `status`, appending `note` to the message.
    ///
    /// Returns the previous status, or `None` if the status is unchanged
    /// (the message is then left alone too).
    pub fn record_status(&mut self, status: &str, note: Option<&str>) -> Option<String> {
        if self.status == status {
            return None;
        }
        if let Some(note) = note {
            self.message = Some(match self.message.take() {
                Some(message) if !message.is_empty() => format!("{message} | {note}"),
                _ => note.to_string(),
            });
        }
        Some(std::mem::replace(&mut self.status, status.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_tracking_number() {
        let order = OrderId::new();
        let shipment = Shipment::local(order, Utc::now());
        assert!(
            shipment
                .tracking_number
                .unwrap()
                .starts_with(&format!("LOCAL-{order}-"))
        );
    }

    #[test]
    fn test_normalize_tracking_status() {
        assert_eq!(normalize_tracking_status("reparto"), "REPARTO");
        assert_eq!(normalize_tracking_status(" Entregado "), "ENTREGADA");
        assert_eq!(normalize_tracking_status("EN_RUTA"), "TRANSITO URBANO");
        assert_eq!(normalize_tracking_status("EN REPARTO ZONA 3"), "REPARTO");
        assert_eq!(normalize_tracking_status("desconocido"), DEFAULT_TRACKING_STATUS);
        assert_eq!(normalize_tracking_status(""), DEFAULT_TRACKING_STATUS);
    }

    #[test]
    fn test_record_status_only_on_change() {
        let mut shipment = Shipment::labeled(
            OrderId::new(),
            "coordinadora",
            "TRK-1",
            None,
            "LABEL_CREATED",
            Utc::now(),
        );
        assert_eq!(
            shipment.record_status("REPARTO", Some("REPARTO - 2024-05-02")),
            Some("LABEL_CREATED".to_string())
        );
        assert_eq!(shipment.message.as_deref(), Some("REPARTO - 2024-05-02"));
        assert_eq!(shipment.record_status("REPARTO", Some("again")), None);
        assert_eq!(shipment.message.as_deref(), Some("REPARTO - 2024-05-02"));

        shipment.record_status("ENTREGADA", Some("ENTREGADA - 2024-05-03"));
        assert!(shipment.is_final());
        assert_eq!(
            shipment.message.as_deref(),
            Some("REPARTO - 2024-05-02 | ENTREGADA - 2024-05-03")
        );
    }

    #[test]
    fn test_label_pending() {
        let shipment = Shipment::label_pending(OrderId::new(), "coordinadora", "balance", Utc::now());
        assert!(shipment.is_label_pending());
        assert_eq!(shipment.message.as_deref(), Some("balance"));
    }
}
