// Introspection routes
//
// Read-only views of the admission controller, worker pool and circuit breakers.

use axum::{extract::State, routing::get, Json, Router};
use bulwark_resilience::admission::{AdmissionStatus, QueueInfo};
use bulwark_resilience::reliability::CircuitMetrics;
use bulwark_resilience::worker::WorkerPoolStatus;

use crate::AppState;

/// Create status routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/admission/status", get(admission_status))
        .route("/v1/admission/queue", get(admission_queue))
        .route("/v1/workers/status", get(workers_status))
        .route("/v1/circuits", get(circuits))
}

/// GET /v1/admission/status - Per-endpoint usage and remaining capacity
pub async fn admission_status(State(state): State<AppState>) -> Json<AdmissionStatus> {
    Json(state.limiter.status())
}

/// GET /v1/admission/queue - Requests waiting for admission
pub async fn admission_queue(State(state): State<AppState>) -> Json<QueueInfo> {
    Json(state.limiter.queue_info())
}

/// GET /v1/workers/status - Worker counts, queue depth and task metrics
pub async fn workers_status(State(state): State<AppState>) -> Json<WorkerPoolStatus> {
    Json(state.pool.status())
}

/// GET /v1/circuits - Metrics for every circuit breaker
pub async fn circuits(State(state): State<AppState>) -> Json<Vec<CircuitMetrics>> {
    Json(state.engine.circuit_metrics())
}
