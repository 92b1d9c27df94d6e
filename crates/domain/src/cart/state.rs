//! Cart lifecycle state machine.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, Result};

/// The lifecycle status of a cart.
///
/// ```text
/// ACTIVE ──► EXPIRED ──► ACTIVE (re-activation)
///   │          │
///   │          └──► COMPLETED
///   ├──► COMPLETED
///   └──► CANCELLED
/// ```
///
/// COMPLETED and CANCELLED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CartStatus {
    /// Open for item mutations, holding reservations.
    #[default]
    Active,

    /// Deadline passed; reservations released, recoverable.
    Expired,

    /// Paid (terminal state).
    Completed,

    /// Abandoned by the shopper or an operator (terminal state).
    Cancelled,
}

impl CartStatus {
    /// Returns true if items can be added in this state (possibly after re-activation).
    pub fn accepts_items(&self) -> bool {
        matches!(self, CartStatus::Active | CartStatus::Expired)
    }

    /// Returns true if the cart can move to `next`.
    pub fn can_transition_to(&self, next: CartStatus) -> bool {
        use CartStatus::*;
        matches!(
            (self, next),
            (Active, Expired)
                | (Active, Cancelled)
                | (Active, Completed)
                | (Expired, Active)
                | (Expired, Completed)
        )
    }

    /// Validates a transition, returning the target state.
    pub fn transition_to(&self, next: CartStatus) -> Result<CartStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::InvalidTransition {
                entity: "cart",
                from: self.as_str(),
                to: next.as_str(),
            })
        }
    }

    /// Returns true if this is a terminal state (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(self, CartStatus::Completed | CartStatus::Cancelled)
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            CartStatus::Active => "ACTIVE",
            CartStatus::Expired => "EXPIRED",
            CartStatus::Completed => "COMPLETED",
            CartStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for CartStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CartStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(CartStatus::Active),
            "EXPIRED" => Ok(CartStatus::Expired),
            "COMPLETED" => Ok(CartStatus::Completed),
            "CANCELLED" => Ok(CartStatus::Cancelled),
            other => Err(format!("unknown cart status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_is_active() {
        assert_eq!(CartStatus::default(), CartStatus::Active);
    }

    #[test]
    fn test_accepts_items() {
        assert!(CartStatus::Active.accepts_items());
        assert!(CartStatus::Expired.accepts_items());
        assert!(!CartStatus::Completed.accepts_items());
        assert!(!CartStatus::Cancelled.accepts_items());
    }

    #[test]
    fn test_active_transitions() {
        assert!(CartStatus::Active.can_transition_to(CartStatus::Expired));
        assert!(CartStatus::Active.can_transition_to(CartStatus::Cancelled));
        assert!(CartStatus::Active.can_transition_to(CartStatus::Completed));
        assert!(!CartStatus::Active.can_transition_to(CartStatus::Active));
    }

    #[test]
    fn test_expired_transitions() {
        assert!(CartStatus::Expired.can_transition_to(CartStatus::Active));
        assert!(CartStatus::Expired.can_transition_to(CartStatus::Completed));
        assert!(!CartStatus::Expired.can_transition_to(CartStatus::Cancelled));
    }

    #[test]
    fn test_no_transition_leaves_terminal_states() {
        for from in [CartStatus::Completed, CartStatus::Cancelled] {
            assert!(from.is_terminal());
            for to in [
                CartStatus::Active,
                CartStatus::Expired,
                CartStatus::Completed,
                CartStatus::Cancelled,
            ] {
                assert!(!from.can_transition_to(to));
            }
        }
    }

    #[test]
    fn test_transition_error() {
        let err = CartStatus::Completed
            .transition_to(CartStatus::Active)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid cart transition from COMPLETED to ACTIVE"
        );
    }

    #[test]
    fn test_roundtrip_strings() {
        for status in [
            CartStatus::Active,
            CartStatus::Expired,
            CartStatus::Completed,
            CartStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<CartStatus>().unwrap(), status);
        }
        let json = serde_json::to_string(&CartStatus::Expired).unwrap();
        assert_eq!(json, "\"EXPIRED\"");
    }
}
