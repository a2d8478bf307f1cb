//! Task types for the worker pool

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, ResilienceError};
use crate::priority::Priority;
use crate::serde_millis::{duration_millis, option_duration_millis};

/// What a task handler produces
pub type TaskOutput = Result<serde_json::Value, ResilienceError>;

/// Task handler function type
pub type TaskHandler = Arc<
    dyn Fn(WorkerTask) -> Pin<Box<dyn Future<Output = TaskOutput> + Send>> + Send + Sync,
>;

/// A request to run a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Handler name
    #[serde(rename = "type")]
    pub task_type: String,

    #[serde(default)]
    pub data: serde_json::Value,

    #[serde(default)]
    pub priority: Priority,

    /// Overrides the pool's default task timeout
    #[serde(default, rename = "timeout_ms", with = "option_duration_millis")]
    pub timeout: Option<Duration>,
}

impl TaskSpec {
    pub fn new(task_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            data,
            priority: Priority::Medium,
            timeout: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A task accepted by the pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerTask {
    pub id: Uuid,
    pub task_type: String,
    pub data: serde_json::Value,
    pub priority: Priority,
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<u64>,
}

impl WorkerTask {
    pub fn from_spec(spec: TaskSpec, default_timeout: Duration) -> Self {
        Self {
            id: Uuid::now_v7(),
            task_type: spec.task_type,
            data: spec.data,
            priority: spec.priority,
            timeout: spec.timeout.unwrap_or(default_timeout),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            worker_id: None,
        }
    }
}

/// Why a task did not produce output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
}

impl From<&ResilienceError> for TaskFailure {
    fn from(err: &ResilienceError) -> Self {
        Self {
            kind: err.kind,
            code: err.code.clone(),
            message: err.message.clone(),
        }
    }
}

/// Final outcome of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub task_type: String,
    pub priority: Priority,
    /// `None` when the task never reached a worker
    pub worker_id: Option<u64>,
    pub success: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<TaskFailure>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    /// Time spent running, zero when the task never started
    #[serde(rename = "processing_ms", with = "duration_millis")]
    pub processing_time: Duration,
}

impl TaskResult {
    pub(crate) fn finished(task: &WorkerTask, output: &TaskOutput, processing_time: Duration) -> Self {
        let (output, error) = match output {
            Ok(value) => (Some(value.clone()), None),
            Err(err) => (None, Some(TaskFailure::from(err))),
        };
        Self {
            task_id: task.id,
            task_type: task.task_type.clone(),
            priority: task.priority,
            worker_id: task.worker_id,
            success: error.is_none(),
            output,
            error,
            created_at: task.created_at,
            started_at: task.started_at,
            completed_at: Utc::now(),
            processing_time,
        }
    }

    /// Result for a task that was dropped before running
    pub(crate) fn unstarted(task: &WorkerTask, err: &ResilienceError) -> Self {
        Self::finished(task, &Err(err.clone()), Duration::ZERO)
    }
}

/// Where a task currently is
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    Queued { position: usize },
    Running { worker_id: u64, started_at: Option<DateTime<Utc>> },
    Finished { result: TaskResult },
}
