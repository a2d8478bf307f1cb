//! Worker pool for background tasks
//!
//! This module provides:
//! - [`WorkerPool`] - Bounded set of workers draining one priority queue
//! - [`decide`] - Auto-scaling policy driven by queue depth and host pressure
//! - [`TaskSpec`] / [`TaskResult`] - What goes in and what comes out
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     WorkerPool                       │
//! │  add_task ──▶ PriorityQueue (high ▸ medium ▸ low)    │
//! │                    │                                 │
//! │                    ▼  dispatch to idle workers       │
//! │  [Worker 1] [Worker 2] ... [Worker N]                │
//! │      │  timeout + panic guard per task               │
//! │      ▼                                               │
//! │  results + waiters                                   │
//! │                                                      │
//! │  Scaler (interval) ── ResourceProbe ──▶ decide()     │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Workers that fail a task rest for `error_cooldown` before taking new work.

mod pool;
mod scaling;
mod task;

pub use pool::{
    Worker, WorkerInfo, WorkerPool, WorkerPoolConfig, WorkerPoolState, WorkerPoolStatus,
    WorkerStatus, QUEUE_FULL, TASK_PANICKED,
};
pub use scaling::{
    decide, ResourceProbe, ResourceUsage, ScalingDecision, ScalingInput, StaticProbe,
    SysinfoProbe,
};
pub use task::{TaskFailure, TaskHandler, TaskOutput, TaskResult, TaskSpec, TaskState, WorkerTask};
