use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::MessageId;
use tokio::sync::RwLock;

use crate::dead_letter::DeadLetter;
use crate::error::{QueueError, Result};
use crate::message::{QueueMessage, Topic};

/// Durable home of live messages and the dead-letter log.
///
/// A claimed message stays owned by the storage until it is acked,
/// rescheduled or dead-lettered, so a crash between claim and ack leaves it
/// recoverable through [`release_stale_claims`](QueueStorage::release_stale_claims).
#[async_trait]
pub trait QueueStorage: Send + Sync {
    /// Appends a message to the end of its topic.
    async fn push(&self, message: QueueMessage) -> Result<()>;

    /// Claims the oldest message of `topic` that is available at `now`.
    async fn claim(&self, topic: &Topic, now: DateTime<Utc>) -> Result<Option<QueueMessage>>;

    /// Removes a delivered message.
    async fn ack(&self, id: MessageId) -> Result<()>;

    /// Returns a claimed message to the live queue with a new retry count and
    /// availability time.
    async fn reschedule(
        &self,
        id: MessageId,
        retry_count: u32,
        available_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Removes a message from the live queue and appends it to the dead-letter log.
    async fn dead_letter(&self, entry: DeadLetter) -> Result<()>;

    /// Messages of `topic` not yet delivered, claimed ones included.
    async fn depth(&self, topic: &Topic) -> Result<usize>;

    /// Depth of every topic that currently holds messages.
    async fn depths(&self) -> Result<BTreeMap<String, usize>>;

    /// Most recent dead letters first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>>;

    /// Returns claims older than `older_than` to the live queue.
    async fn release_stale_claims(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

#[derive(Default)]
struct State {
    topics: HashMap<Topic, VecDeque<QueueMessage>>,
    in_flight: HashMap<MessageId, (QueueMessage, DateTime<Utc>)>,
    dead_letters: Vec<DeadLetter>,
}

/// In-memory queue storage for tests and single-process development.
#[derive(Clone, Default)]
pub struct InMemoryQueueStorage {
    state: Arc<RwLock<State>>,
}

impl InMemoryQueueStorage {
    /// Creates a new empty in-memory queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the live (unclaimed) messages of a topic, in queue order.
    pub async fn messages(&self, topic: &Topic) -> Vec<QueueMessage> {
        self.state
            .read()
            .await
            .topics
            .get(topic)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of claimed, not yet settled messages.
    pub async fn in_flight_count(&self) -> usize {
        self.state.read().await.in_flight.len()
    }
}

#[async_trait]
impl QueueStorage for InMemoryQueueStorage {
    async fn push(&self, message: QueueMessage) -> Result<()> {
        self.state
            .write()
            .await
            .topics
            .entry(message.topic.clone())
            .or_default()
            .push_back(message);
        Ok(())
    }

    async fn claim(&self, topic: &Topic, now: DateTime<Utc>) -> Result<Option<QueueMessage>> {
        let mut state = self.state.write().await;
        let Some(queue) = state.topics.get_mut(topic) else {
            return Ok(None);
        };
        let Some(position) = queue.iter().position(|m| m.available_at <= now) else {
            return Ok(None);
        };
        let Some(message) = queue.remove(position) else {
            return Ok(None);
        };
        state
            .in_flight
            .insert(message.id, (message.clone(), now));
        Ok(Some(message))
    }

    async fn ack(&self, id: MessageId) -> Result<()> {
        self.state.write().await.in_flight.remove(&id);
        Ok(())
    }

    async fn reschedule(
        &self,
        id: MessageId,
        retry_count: u32,
        available_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let (mut message, _) = state
            .in_flight
            .remove(&id)
            .ok_or_else(|| QueueError::Storage(format!("message {id} is not claimed")))?;
        message.retry_count = retry_count;
        message.available_at = available_at;
        state
            .topics
            .entry(message.topic.clone())
            .or_default()
            .push_back(message);
        Ok(())
    }

    async fn dead_letter(&self, entry: DeadLetter) -> Result<()> {
        let mut state = self.state.write().await;
        state.in_flight.remove(&entry.id);
        if let Some(queue) = state.topics.get_mut(&entry.topic) {
            queue.retain(|m| m.id != entry.id);
        }
        state.dead_letters.push(entry);
        Ok(())
    }

    async fn depth(&self, topic: &Topic) -> Result<usize> {
        let state = self.state.read().await;
        let queued = state.topics.get(topic).map_or(0, VecDeque::len);
        let claimed = state
            .in_flight
            .values()
            .filter(|(m, _)| &m.topic == topic)
            .count();
        Ok(queued + claimed)
    }

    async fn depths(&self) -> Result<BTreeMap<String, usize>> {
        let state = self.state.read().await;
        let mut depths = BTreeMap::new();
        for (topic, queue) in &state.topics {
            if !queue.is_empty() {
                *depths.entry(topic.to_string()).or_insert(0) += queue.len();
            }
        }
        for (message, _) in state.in_flight.values() {
            *depths.entry(message.topic.to_string()).or_insert(0) += 1;
        }
        Ok(depths)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let state = self.state.read().await;
        Ok(state.dead_letters.iter().rev().take(limit).cloned().collect())
    }

    async fn release_stale_claims(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;
        let stale: Vec<MessageId> = state
            .in_flight
            .iter()
            .filter(|(_, (_, claimed_at))| *claimed_at < older_than)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            if let Some((message, _)) = state.in_flight.remove(id) {
                state
                    .topics
                    .entry(message.topic.clone())
                    .or_default()
                    .push_front(message);
            }
        }
        Ok(stale.len() as u64)
    }
}
