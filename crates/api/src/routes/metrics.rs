//! Prometheus metrics endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use queue::DeliveryQueue;

/// State of the metrics router.
#[derive(Clone)]
pub struct MetricsState {
    pub handle: PrometheusHandle,
    pub queue: Arc<DeliveryQueue>,
}

/// GET /metrics — returns Prometheus-formatted metrics.
///
/// Queue depth gauges are refreshed on every scrape.
pub async fn get(State(state): State<MetricsState>) -> impl IntoResponse {
    match state.queue.stats().await {
        Ok(stats) => {
            for (topic, depth) in stats.depths {
                metrics::gauge!("queue_depth", "topic" => topic).set(depth as f64);
            }
        }
        Err(err) => tracing::warn!(error = %err, "failed to read queue depth"),
    }

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.handle.render(),
    )
}
