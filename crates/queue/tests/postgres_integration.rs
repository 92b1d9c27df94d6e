//! PostgreSQL queue storage integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p queue --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use chrono::{Duration, Utc};
use queue::{
    DeadLetter, DeadLetterReason, PostgresQueueStorage, QueueError, QueueMessage, QueueStorage,
    Topic,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();

            sqlx::raw_sql(include_str!(
                "../../../migrations/002_create_queue_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();

            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh storage with its own pool and cleared tables
async fn get_test_storage() -> PostgresQueueStorage {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE queue_messages, dead_letters")
        .execute(&pool)
        .await
        .unwrap();

    PostgresQueueStorage::new(pool)
}

#[tokio::test]
#[serial]
async fn claim_in_sequence_order() {
    let storage = get_test_storage().await;
    let now = Utc::now();
    let first = QueueMessage::new(Topic::comment(), "1", now);
    let second = QueueMessage::new(Topic::comment(), "2", now);
    storage.push(first.clone()).await.unwrap();
    storage.push(second.clone()).await.unwrap();

    let claimed = storage.claim(&Topic::comment(), now).await.unwrap().unwrap();
    assert_eq!(claimed.id, first.id);

    // The claimed row is invisible to a second consumer.
    let next = storage.claim(&Topic::comment(), now).await.unwrap().unwrap();
    assert_eq!(next.id, second.id);
    assert!(storage.claim(&Topic::comment(), now).await.unwrap().is_none());
    assert_eq!(storage.depth(&Topic::comment()).await.unwrap(), 2);
}

#[tokio::test]
#[serial]
async fn reschedule_and_ack() {
    let storage = get_test_storage().await;
    let now = Utc::now();
    let message = QueueMessage::new(Topic::cart_expired(), "{}", now);
    storage.push(message.clone()).await.unwrap();

    storage.claim(&Topic::cart_expired(), now).await.unwrap();
    storage
        .reschedule(message.id, 1, now + Duration::seconds(2))
        .await
        .unwrap();

    assert!(
        storage
            .claim(&Topic::cart_expired(), now)
            .await
            .unwrap()
            .is_none()
    );
    let again = storage
        .claim(&Topic::cart_expired(), now + Duration::seconds(3))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.retry_count, 1);

    storage.ack(again.id).await.unwrap();
    assert_eq!(storage.depth(&Topic::cart_expired()).await.unwrap(), 0);
}

#[tokio::test]
#[serial]
async fn reschedule_unclaimed_message_fails() {
    let storage = get_test_storage().await;
    let message = QueueMessage::new(Topic::comment(), "{}", Utc::now());
    storage.push(message.clone()).await.unwrap();

    let result = storage.reschedule(message.id, 1, Utc::now()).await;
    assert!(matches!(result, Err(QueueError::Storage(_))));
}

#[tokio::test]
#[serial]
async fn dead_letter_moves_row() {
    let storage = get_test_storage().await;
    let now = Utc::now();
    let message = QueueMessage::new(Topic::comment(), "{oops", now);
    storage.push(message.clone()).await.unwrap();
    let claimed = storage.claim(&Topic::comment(), now).await.unwrap().unwrap();

    let entry = DeadLetter::from_message(
        claimed,
        DeadLetterReason::Malformed,
        Some("expected value".to_string()),
        now,
    );
    storage.dead_letter(entry).await.unwrap();

    assert_eq!(storage.depth(&Topic::comment()).await.unwrap(), 0);
    let letters = storage.dead_letters(5).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].id, message.id);
    assert_eq!(letters[0].reason, DeadLetterReason::Malformed);
    assert_eq!(letters[0].payload, "{oops");
}

#[tokio::test]
#[serial]
async fn stale_claims_are_released() {
    let storage = get_test_storage().await;
    let now = Utc::now();
    storage
        .push(QueueMessage::new(Topic::comment(), "{}", now))
        .await
        .unwrap();
    storage.claim(&Topic::comment(), now).await.unwrap();

    let released = storage
        .release_stale_claims(now + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(released, 1);
    assert!(storage.claim(&Topic::comment(), now).await.unwrap().is_some());

    let depths = storage.depths().await.unwrap();
    assert_eq!(depths.get("comment"), Some(&1));
}
