//! Queue messages and the envelope sent to listeners.

use std::fmt;

use chrono::{DateTime, Utc};
use common::MessageId;
use serde::{Deserialize, Serialize};

/// Name of a delivery channel.
///
/// Topics are open-ended; the well-known ones are exposed as constructors.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub const CART_ITEM_ADDED: &'static str = "cart_item_added";
    pub const CART_EXPIRED: &'static str = "cart_expired";
    pub const CART_EXPIRING: &'static str = "cart_expiring";
    pub const SHIPMENT_STATUS_CHANGED: &'static str = "shipment_status_changed";
    pub const COMMENT: &'static str = "comment";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn cart_item_added() -> Self {
        Self::new(Self::CART_ITEM_ADDED)
    }

    pub fn cart_expired() -> Self {
        Self::new(Self::CART_EXPIRED)
    }

    pub fn cart_expiring() -> Self {
        Self::new(Self::CART_EXPIRING)
    }

    pub fn shipment_status_changed() -> Self {
        Self::new(Self::SHIPMENT_STATUS_CHANGED)
    }

    pub fn comment() -> Self {
        Self::new(Self::COMMENT)
    }

    /// Every topic the service publishes to.
    pub fn all() -> Vec<Topic> {
        [
            Self::CART_ITEM_ADDED,
            Self::CART_EXPIRED,
            Self::CART_EXPIRING,
            Self::SHIPMENT_STATUS_CHANGED,
            Self::COMMENT,
        ]
        .into_iter()
        .map(Topic::new)
        .collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// A message waiting in (or claimed from) the live queue.
///
/// The payload is kept as raw JSON text so that an undecodable message can be
/// dead-lettered verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: MessageId,
    pub topic: Topic,
    pub payload: String,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the message may be delivered again.
    pub available_at: DateTime<Utc>,
}

impl QueueMessage {
    /// A fresh message, immediately available.
    pub fn new(topic: Topic, payload: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::new(),
            topic,
            payload: payload.into(),
            retry_count: 0,
            enqueued_at: now,
            available_at: now,
        }
    }
}

/// What a listener receives for every delivery attempt.
///
/// `message_id` is stable across redeliveries so consumers can deduplicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryEnvelope {
    pub message_id: MessageId,
    pub topic: Topic,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl DeliveryEnvelope {
    /// Decodes the message payload; fails if it is not valid JSON.
    pub fn from_message(message: &QueueMessage) -> serde_json::Result<Self> {
        Ok(Self {
            message_id: message.id,
            topic: message.topic.clone(),
            retry_count: message.retry_count,
            enqueued_at: message.enqueued_at,
            payload: serde_json::from_str(&message.payload)?,
        })
    }
}
