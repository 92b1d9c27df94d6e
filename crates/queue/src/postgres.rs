use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::MessageId;
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::dead_letter::DeadLetter;
use crate::error::{QueueError, Result};
use crate::message::{QueueMessage, Topic};
use crate::storage::QueueStorage;

/// PostgreSQL-backed queue storage.
///
/// Claims take a row lock with `FOR UPDATE SKIP LOCKED`, so several
/// processes may consume the same topic without delivering a message twice
/// concurrently.
#[derive(Clone)]
pub struct PostgresQueueStorage {
    pool: PgPool,
}

impl PostgresQueueStorage {
    /// Creates a new PostgreSQL queue storage.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_message(row: &PgRow) -> Result<QueueMessage> {
        let retry_count: i32 = row.try_get("retry_count")?;
        Ok(QueueMessage {
            id: MessageId::from_uuid(row.try_get("id")?),
            topic: Topic::new(row.try_get::<String, _>("topic")?),
            payload: row.try_get("payload")?,
            retry_count: to_u32(retry_count)?,
            enqueued_at: row.try_get("enqueued_at")?,
            available_at: row.try_get("available_at")?,
        })
    }

    fn row_to_dead_letter(row: &PgRow) -> Result<DeadLetter> {
        let retry_count: i32 = row.try_get("retry_count")?;
        let reason: String = row.try_get("reason")?;
        Ok(DeadLetter {
            id: MessageId::from_uuid(row.try_get("id")?),
            topic: Topic::new(row.try_get::<String, _>("topic")?),
            payload: row.try_get("payload")?,
            retry_count: to_u32(retry_count)?,
            enqueued_at: row.try_get("enqueued_at")?,
            reason: reason.parse().map_err(QueueError::Corrupt)?,
            last_error: row.try_get("last_error")?,
            failed_at: row.try_get("failed_at")?,
        })
    }
}

fn to_u32(value: i32) -> Result<u32> {
    u32::try_from(value).map_err(|_| QueueError::Corrupt(format!("negative retry count: {value}")))
}

fn to_i32(value: u32) -> Result<i32> {
    i32::try_from(value).map_err(|_| QueueError::Corrupt(format!("retry count too large: {value}")))
}

#[async_trait]
impl QueueStorage for PostgresQueueStorage {
    async fn push(&self, message: QueueMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queue_messages (id, topic, payload, retry_count, enqueued_at, available_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(message.id.as_uuid())
        .bind(message.topic.as_str())
        .bind(&message.payload)
        .bind(to_i32(message.retry_count)?)
        .bind(message.enqueued_at)
        .bind(message.available_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim(&self, topic: &Topic, now: DateTime<Utc>) -> Result<Option<QueueMessage>> {
        let row = sqlx::query(
            r#"
            UPDATE queue_messages
            SET claimed_at = $2
            WHERE seq = (
                SELECT seq FROM queue_messages
                WHERE topic = $1 AND claimed_at IS NULL AND available_at <= $2
                ORDER BY seq
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, topic, payload, retry_count, enqueued_at, available_at
            "#,
        )
        .bind(topic.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_message).transpose()
    }

    async fn ack(&self, id: MessageId) -> Result<()> {
        sqlx::query("DELETE FROM queue_messages WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reschedule(
        &self,
        id: MessageId,
        retry_count: u32,
        available_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET retry_count = $2, available_at = $3, claimed_at = NULL
            WHERE id = $1 AND claimed_at IS NOT NULL
            "#,
        )
        .bind(id.as_uuid())
        .bind(to_i32(retry_count)?)
        .bind(available_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::Storage(format!("message {id} is not claimed")));
        }
        Ok(())
    }

    async fn dead_letter(&self, entry: DeadLetter) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM queue_messages WHERE id = $1")
            .bind(entry.id.as_uuid())
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO dead_letters (id, topic, payload, retry_count, enqueued_at, reason,
                                      last_error, failed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.topic.as_str())
        .bind(&entry.payload)
        .bind(to_i32(entry.retry_count)?)
        .bind(entry.enqueued_at)
        .bind(entry.reason.as_str())
        .bind(&entry.last_error)
        .bind(entry.failed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn depth(&self, topic: &Topic) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages WHERE topic = $1")
            .bind(topic.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn depths(&self) -> Result<BTreeMap<String, usize>> {
        let rows = sqlx::query("SELECT topic, COUNT(*) AS depth FROM queue_messages GROUP BY topic")
            .fetch_all(&self.pool)
            .await?;

        let mut depths = BTreeMap::new();
        for row in rows {
            let topic: String = row.try_get("topic")?;
            let depth: i64 = row.try_get("depth")?;
            depths.insert(topic, usize::try_from(depth).unwrap_or(0));
        }
        Ok(depths)
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r#"
            SELECT id, topic, payload, retry_count, enqueued_at, reason, last_error, failed_at
            FROM dead_letters
            ORDER BY seq DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_dead_letter).collect()
    }

    async fn release_stale_claims(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE queue_messages SET claimed_at = NULL WHERE claimed_at IS NOT NULL AND claimed_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::warn!(
                released = result.rows_affected(),
                "returned stale queue claims to the live queue"
            );
        }
        Ok(result.rows_affected())
    }
}
