// Task HTTP routes
// Decision: Submission retries a full queue briefly through the retry engine before answering 503
// Decision: Built-in handlers (echo, checksum) make the pool usable without custom code

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bulwark_resilience::reliability::{PolicyTemplate, RetryPolicy};
use bulwark_resilience::worker::{TaskSpec, TaskState, WorkerPool, QUEUE_FULL};
use bulwark_resilience::ResilienceError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::ApiError;
use crate::AppState;

/// Create task routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/tasks", post(create_task))
        .route("/v1/tasks/:task_id", get(get_task))
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateTaskParams {
    /// Hold the response until the task finishes
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Serialize)]
pub struct TaskCreated {
    pub id: Uuid,
    #[serde(flatten)]
    pub state: Option<TaskState>,
}

/// Policy for submitting to a full queue
pub fn submit_policy(state: &AppState) -> RetryPolicy {
    state
        .engine
        .policies()
        .template(PolicyTemplate::FastTransient)
        .with_name("task_submit")
        .with_retryable_code(QUEUE_FULL)
}

/// POST /v1/tasks - Queue a task
pub async fn create_task(
    State(state): State<AppState>,
    Query(params): Query<CreateTaskParams>,
    Json(spec): Json<TaskSpec>,
) -> Result<Response, ApiError> {
    let pool = Arc::clone(&state.pool);
    let id = state
        .engine
        .execute_with_retry(
            || {
                let pool = Arc::clone(&pool);
                let spec = spec.clone();
                async move { pool.add_task(spec) }
            },
            submit_policy(&state),
            Some(spec.task_type.as_str()),
        )
        .await?;

    if params.wait {
        let result = state.pool.wait_for_result(id).await?;
        return Ok((StatusCode::OK, Json(TaskCreated {
            id,
            state: Some(TaskState::Finished { result }),
        }))
        .into_response());
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(TaskCreated {
            id,
            state: state.pool.task_state(id),
        }),
    )
        .into_response())
}

/// GET /v1/tasks/{task_id} - Where a task is, or its result
pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<TaskState>, ApiError> {
    state.pool.task_state(task_id).map(Json).ok_or_else(|| {
        ApiError(
            ResilienceError::client(format!("task {task_id} not found"))
                .with_code("TASK_NOT_FOUND")
                .with_status(404),
        )
    })
}

/// Register the handlers every deployment ships with
pub fn register_builtin_handlers(pool: &WorkerPool) {
    pool.register_handler("echo", |task| async move { Ok(task.data) });

    pool.register_handler("checksum", |task| async move {
        let bytes = serde_json::to_vec(&task.data).map_err(|e| {
            ResilienceError::validation("task data is not serializable").with_cause(e)
        })?;
        Ok(serde_json::json!({
            "algorithm": "sha256",
            "digest": sha256_hex(&bytes),
            "bytes": bytes.len(),
        }))
    });
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
