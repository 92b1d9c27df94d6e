//! Messages that left the live queue without being delivered.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::MessageId;
use serde::{Deserialize, Serialize};

use crate::message::{QueueMessage, Topic};

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Every allowed attempt failed.
    RetriesExhausted,
    /// The payload could not be decoded.
    Malformed,
    /// The message outlived its TTL before being delivered.
    Expired,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::RetriesExhausted => "retries_exhausted",
            DeadLetterReason::Malformed => "malformed",
            DeadLetterReason::Expired => "expired",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeadLetterReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retries_exhausted" => Ok(DeadLetterReason::RetriesExhausted),
            "malformed" => Ok(DeadLetterReason::Malformed),
            "expired" => Ok(DeadLetterReason::Expired),
            other => Err(format!("unknown dead-letter reason: {other}")),
        }
    }
}

/// An entry of the dead-letter log, kept for manual inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: MessageId,
    pub topic: Topic,
    pub payload: String,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub reason: DeadLetterReason,
    pub last_error: Option<String>,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn from_message(
        message: QueueMessage,
        reason: DeadLetterReason,
        last_error: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: message.id,
            topic: message.topic,
            payload: message.payload,
            retry_count: message.retry_count,
            enqueued_at: message.enqueued_at,
            reason,
            last_error,
            failed_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_round_trips_through_str() {
        for reason in [
            DeadLetterReason::RetriesExhausted,
            DeadLetterReason::Malformed,
            DeadLetterReason::Expired,
        ] {
            assert_eq!(reason.as_str().parse::<DeadLetterReason>().unwrap(), reason);
        }
        assert!("lost".parse::<DeadLetterReason>().is_err());
    }
}
