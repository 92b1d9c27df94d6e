//! API server entry point.

use std::sync::Arc;

use api::config::{Config, LogFormat};
use metrics_exporter_prometheus::PrometheusHandle;
use queue::{
    DeliveryQueue, InMemoryQueueStorage, PostgresQueueStorage, QueueStorage, Topic,
    WebhookDeliverer,
};
use store::{InMemoryStore, PostgresStore, Store};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() {
    // 1. Load configuration and initialize tracing
    let config = Config::from_env();
    init_tracing(&config);
    if config.uses_dev_secret() {
        tracing::warn!("CART_TOKEN_SECRET not set, using the development secret");
    }

    // 2. Install Prometheus metrics recorder
    let prometheus_builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let metrics_handle = prometheus_builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Pick the storage backend
    match config.database_url.clone() {
        Some(url) => {
            let pool = sqlx::PgPool::connect(&url)
                .await
                .expect("failed to connect to PostgreSQL");
            let store = PostgresStore::new(pool.clone());
            store
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL storage");
            run(config, metrics_handle, store, Arc::new(PostgresQueueStorage::new(pool))).await;
        }
        None => {
            tracing::info!("DATABASE_URL not set, using in-memory storage");
            run(
                config,
                metrics_handle,
                InMemoryStore::new(),
                Arc::new(InMemoryQueueStorage::new()),
            )
            .await;
        }
    }
}

async fn run<S: Store>(
    config: Config,
    metrics_handle: PrometheusHandle,
    store: S,
    queue_storage: Arc<dyn QueueStorage>,
) {
    // 4. Delivery queue; claims left by a previous process go back to the queue
    let deliverer =
        WebhookDeliverer::new(config.webhook_settings()).expect("failed to build webhook client");
    let queue = Arc::new(DeliveryQueue::new(
        queue_storage,
        Arc::new(deliverer),
        config.retry_policy(),
    ));
    match queue.recover(chrono::Utc::now()).await {
        Ok(0) => {}
        Ok(recovered) => tracing::info!(recovered, "returned stale claims to the queue"),
        Err(err) => tracing::error!(error = %err, "failed to recover stale claims"),
    }

    // 5. Application state and background workers
    let state =
        api::create_state(store, queue.clone(), &config).expect("invalid cart token secret");
    let consumer_token = CancellationToken::new();
    let consumers = queue.spawn_consumers(Topic::all(), consumer_token.clone());
    let scheduler = state.scheduler.start();
    let tracker = state.tracker.start();

    // 6. Build the application
    let app = api::create_app(state, metrics_handle);

    // 7. Start server
    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // 8. Stop background work
    scheduler.shutdown().await;
    tracker.shutdown().await;
    consumer_token.cancel();
    for consumer in consumers {
        if let Err(err) = consumer.await {
            tracing::error!(error = %err, "queue consumer ended abnormally");
        }
    }

    tracing::info!("server shut down gracefully");
}
