//! Health and metrics handlers

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::Json};
use gilgate_core::Gateway;

use crate::runtime::types::HealthResponse;

/// GET /health - Worker and queue state
///
/// Answers 503 once every worker is stuck.
pub async fn health_check(
    State(gateway): State<Arc<Gateway>>,
) -> (StatusCode, Json<HealthResponse>) {
    let snapshot = gateway.snapshot();
    let (status, status_code) = if snapshot.stuck_workers == 0 {
        ("healthy", StatusCode::OK)
    } else if snapshot.stuck_workers < snapshot.workers {
        ("degraded", StatusCode::OK)
    } else {
        ("unhealthy", StatusCode::SERVICE_UNAVAILABLE)
    };

    (
        status_code,
        Json(HealthResponse {
            status: status.to_string(),
            service: "gilgate".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now(),
            workers: snapshot.workers,
            stuck_workers: snapshot.stuck_workers,
            queue_length: snapshot.queue_length,
            active_executions: snapshot.active_executions,
            parked_requests: snapshot.parked_requests,
        }),
    )
}

/// GET /metrics - Prometheus text exposition
pub async fn metrics_endpoint(
    State(gateway): State<Arc<Gateway>>,
) -> Result<String, (StatusCode, String)> {
    gateway.metrics().encode().map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
    })
}
