//! Order state machine.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, Result};

/// The settlement status of an order.
///
/// ```text
/// CREATED ──► CHARGE_PENDING ──► ACCEPTED
///    │              │
///    └──────────────┴──────────► REJECTED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Lines persisted and stock reserved; no charge yet.
    #[default]
    Created,

    /// Charge initiated, waiting for the gateway confirmation.
    ChargePending,

    /// Payment confirmed (terminal state).
    Accepted,

    /// Charge failed or was rejected (terminal state).
    Rejected,
}

impl OrderStatus {
    /// Returns true if the order can move to `next`.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Created, ChargePending)
                | (Created, Rejected)
                | (ChargePending, Accepted)
                | (ChargePending, Rejected)
        )
    }

    /// Validates a transition, returning the target state.
    pub fn transition_to(&self, next: OrderStatus) -> Result<OrderStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::InvalidTransition {
                entity: "order",
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }

    /// Returns true once the confirmation has been applied.
    pub fn is_settled(&self) -> bool {
        matches!(self, OrderStatus::Accepted | OrderStatus::Rejected)
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "CREATED",
            OrderStatus::ChargePending => "CHARGE_PENDING",
            OrderStatus::Accepted => "ACCEPTED",
            OrderStatus::Rejected => "REJECTED",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(OrderStatus::Created),
            "CHARGE_PENDING" => Ok(OrderStatus::ChargePending),
            "ACCEPTED" => Ok(OrderStatus::Accepted),
            "REJECTED" => Ok(OrderStatus::Rejected),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}
