//! Worker pool for background tasks
//!
//! Bounded set of workers fed from one priority queue, with auto-scaling
//! and graceful shutdown.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::scaling::{decide, ResourceProbe, ScalingDecision, ScalingInput, SysinfoProbe};
use super::task::{TaskHandler, TaskOutput, TaskResult, TaskSpec, TaskState, WorkerTask};
use crate::error::ResilienceError;
use crate::priority::PriorityQueue;
use crate::reliability::{run_with_timeout, TASK_TIMEOUT};
use crate::serde_millis::duration_millis;

/// Error code for a full task queue
pub const QUEUE_FULL: &str = "QUEUE_FULL";

/// Error code for a task handler that panicked
pub const TASK_PANICKED: &str = "TASK_PANICKED";

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerPoolConfig {
    pub min_workers: usize,

    pub max_workers: usize,

    /// Maximum number of queued (not yet running) tasks
    pub queue_capacity: usize,

    /// Timeout for tasks that do not set their own
    #[serde(with = "duration_millis")]
    pub default_task_timeout: Duration,

    /// How long a worker rests after a failed task
    #[serde(with = "duration_millis")]
    pub error_cooldown: Duration,

    /// Auto-scaling tick
    #[serde(with = "duration_millis")]
    pub scale_interval: Duration,

    /// Memory use ratio at which the host counts as under pressure
    pub memory_threshold: f64,

    /// CPU use ratio at which the host counts as under pressure
    pub cpu_threshold: f64,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Finished results kept for lookup, oldest evicted first
    pub max_retained_results: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 4,
            queue_capacity: 1000,
            default_task_timeout: Duration::from_secs(300),
            error_cooldown: Duration::from_secs(1),
            scale_interval: Duration::from_secs(5),
            memory_threshold: 0.85,
            cpu_threshold: 0.9,
            shutdown_timeout: Duration::from_secs(30),
            max_retained_results: 1000,
        }
    }
}

impl WorkerPoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker count bounds
    pub fn with_workers(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_default_task_timeout(mut self, timeout: Duration) -> Self {
        self.default_task_timeout = timeout;
        self
    }

    pub fn with_error_cooldown(mut self, cooldown: Duration) -> Self {
        self.error_cooldown = cooldown;
        self
    }

    pub fn with_scale_interval(mut self, interval: Duration) -> Self {
        self.scale_interval = interval;
        self
    }

    /// Set the pressure thresholds (0.0 - 1.0)
    pub fn with_pressure_thresholds(mut self, memory: f64, cpu: f64) -> Self {
        self.memory_threshold = memory.clamp(0.0, 1.0);
        self.cpu_threshold = cpu.clamp(0.0, 1.0);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_max_retained_results(mut self, max: usize) -> Self {
        self.max_retained_results = max;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.max_workers == 0 {
            return Err(ResilienceError::configuration("max_workers must be at least 1"));
        }
        if self.min_workers > self.max_workers {
            return Err(ResilienceError::configuration(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        if self.queue_capacity == 0 {
            return Err(ResilienceError::configuration("queue_capacity must be at least 1"));
        }
        if self.scale_interval.is_zero() {
            return Err(ResilienceError::configuration("scale_interval must be positive"));
        }
        Ok(())
    }
}

/// Lifecycle of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPoolState {
    /// Accepting tasks, not running them yet
    Created,
    /// Running tasks
    Running,
    /// Completing in-flight tasks, not accepting new ones
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    /// Cooling down after a failed task
    Error,
}

/// One worker slot
#[derive(Debug, Clone)]
pub struct Worker {
    pub id: u64,
    pub status: WorkerStatus,
    pub current_task: Option<Uuid>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub busy_time: Duration,
    pub last_active: Instant,
    pub last_active_at: DateTime<Utc>,
}

impl Worker {
    fn new(id: u64) -> Self {
        Self {
            id,
            status: WorkerStatus::Idle,
            current_task: None,
            tasks_completed: 0,
            tasks_failed: 0,
            busy_time: Duration::ZERO,
            last_active: Instant::now(),
            last_active_at: Utc::now(),
        }
    }
}

/// Worker entry in a [`WorkerPoolStatus`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: u64,
    pub status: WorkerStatus,
    pub current_task: Option<Uuid>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    #[serde(rename = "busy_ms", with = "duration_millis")]
    pub busy_time: Duration,
    pub last_active_at: DateTime<Utc>,
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerPoolStatus {
    pub state: WorkerPoolState,
    pub total_workers: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub error_workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Tasks dropped from the queue by shutdown
    pub tasks_aborted: u64,
    pub average_processing_ms: f64,
    /// Failed share of finished tasks
    pub error_rate: f64,
    pub workers: Vec<WorkerInfo>,
}

struct PoolState {
    lifecycle: WorkerPoolState,
    workers: BTreeMap<u64, Worker>,
    next_worker_id: u64,
    queue: PriorityQueue<WorkerTask>,
    running: HashMap<Uuid, WorkerTask>,
    results: HashMap<Uuid, TaskResult>,
    result_order: VecDeque<Uuid>,
    waiters: HashMap<Uuid, Vec<oneshot::Sender<TaskResult>>>,
    tasks_completed: u64,
    tasks_failed: u64,
    tasks_aborted: u64,
    processing_time: Duration,
}

impl PoolState {
    fn new() -> Self {
        Self {
            lifecycle: WorkerPoolState::Created,
            workers: BTreeMap::new(),
            next_worker_id: 1,
            queue: PriorityQueue::new(),
            running: HashMap::new(),
            results: HashMap::new(),
            result_order: VecDeque::new(),
            waiters: HashMap::new(),
            tasks_completed: 0,
            tasks_failed: 0,
            tasks_aborted: 0,
            processing_time: Duration::ZERO,
        }
    }

    fn add_worker(&mut self) -> u64 {
        let id = self.next_worker_id;
        self.next_worker_id += 1;
        self.workers.insert(id, Worker::new(id));
        id
    }

    fn idle_workers(&self) -> usize {
        self.workers
            .values()
            .filter(|w| w.status == WorkerStatus::Idle)
            .count()
    }
}

struct Shared {
    config: WorkerPoolConfig,
    handlers: RwLock<HashMap<String, TaskHandler>>,
    state: Mutex<PoolState>,
    probe: Arc<dyn ResourceProbe>,
    /// Signalled whenever the last running task finishes
    idle: Notify,
    shutdown_tx: watch::Sender<bool>,
}

/// Pool of workers executing queued tasks
///
/// # Example
///
/// ```
/// use bulwark_resilience::worker::{TaskSpec, WorkerPool, WorkerPoolConfig};
/// use bulwark_resilience::Priority;
/// use serde_json::json;
///
/// # let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
/// # rt.block_on(async {
/// let pool = WorkerPool::new(WorkerPoolConfig::default().with_workers(1, 2)).unwrap();
/// pool.register_handler("double", |task| async move {
///     let n = task.data.as_i64().unwrap_or(0);
///     Ok(json!(n * 2))
/// });
///
/// pool.start().unwrap();
/// let id = pool.add_task(TaskSpec::new("double", json!(21)).with_priority(Priority::High)).unwrap();
/// let result = pool.wait_for_result(id).await.unwrap();
/// assert_eq!(result.output, Some(json!(42)));
///
/// pool.shutdown().await.unwrap();
/// # });
/// ```
pub struct WorkerPool {
    shared: Arc<Shared>,
    scaler_handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Create a pool sampling host resources with [`SysinfoProbe`]
    pub fn new(config: WorkerPoolConfig) -> Result<Self, ResilienceError> {
        Self::with_probe(config, Arc::new(SysinfoProbe::new()))
    }

    pub fn with_probe(
        config: WorkerPoolConfig,
        probe: Arc<dyn ResourceProbe>,
    ) -> Result<Self, ResilienceError> {
        config.validate()?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                handlers: RwLock::new(HashMap::new()),
                state: Mutex::new(PoolState::new()),
                probe,
                idle: Notify::new(),
                shutdown_tx,
            }),
            scaler_handle: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.shared.config
    }

    /// Register the handler for a task type
    pub fn register_handler<F, Fut>(&self, task_type: &str, handler: F)
    where
        F: Fn(WorkerTask) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskOutput> + Send + 'static,
    {
        let handler: TaskHandler = Arc::new(move |task| Box::pin(handler(task)));
        self.shared
            .handlers
            .write()
            .insert(task_type.to_string(), handler);
    }

    pub fn has_handler(&self, task_type: &str) -> bool {
        self.shared.handlers.read().contains_key(task_type)
    }

    /// Start workers and the auto-scaler
    ///
    /// Tasks queued before this call start running now.
    #[instrument(skip(self), fields(min_workers = self.shared.config.min_workers, max_workers = self.shared.config.max_workers))]
    pub fn start(&self) -> Result<(), ResilienceError> {
        {
            let mut state = self.shared.state.lock();
            match state.lifecycle {
                WorkerPoolState::Created => {}
                WorkerPoolState::Running => {
                    return Err(ResilienceError::validation("worker pool is already running"))
                }
                WorkerPoolState::Draining | WorkerPoolState::Stopped => {
                    return Err(ResilienceError::validation("worker pool has been shut down"))
                }
            }

            state.lifecycle = WorkerPoolState::Running;
            while state.workers.len() < self.shared.config.min_workers {
                state.add_worker();
            }
            info!(
                workers = state.workers.len(),
                queued = state.queue.len(),
                "Starting worker pool"
            );
        }

        let handle = tokio::spawn(Shared::scaler_loop(
            Arc::clone(&self.shared),
            self.shared.shutdown_tx.subscribe(),
        ));
        *self.scaler_handle.lock() = Some(handle);

        self.shared.dispatch();
        Ok(())
    }

    /// Queue a task, returning its id
    pub fn add_task(&self, spec: TaskSpec) -> Result<Uuid, ResilienceError> {
        let mut ids = self.add_tasks(vec![spec])?;
        ids.pop()
            .ok_or_else(|| ResilienceError::unknown("task was not queued"))
    }

    /// Queue a batch of tasks, all or none
    pub fn add_tasks(&self, specs: Vec<TaskSpec>) -> Result<Vec<Uuid>, ResilienceError> {
        for spec in &specs {
            if !self.has_handler(&spec.task_type) {
                return Err(ResilienceError::validation(format!(
                    "no handler registered for task type '{}'",
                    spec.task_type
                ))
                .with_code("UNKNOWN_TASK_TYPE")
                .with_status(400));
            }
        }

        let ids = {
            let mut state = self.shared.state.lock();
            if matches!(
                state.lifecycle,
                WorkerPoolState::Draining | WorkerPoolState::Stopped
            ) {
                return Err(ResilienceError::rejected("worker pool is shutting down")
                    .with_status(503));
            }

            let capacity = self.shared.config.queue_capacity;
            if state.queue.len() + specs.len() > capacity {
                warn!(
                    queue_depth = state.queue.len(),
                    requested = specs.len(),
                    capacity,
                    "Task queue full"
                );
                return Err(ResilienceError::rejected(format!(
                    "task queue is full ({} of {capacity})",
                    state.queue.len()
                ))
                .with_code(QUEUE_FULL)
                .with_status(503)
                .with_details(serde_json::json!({
                    "queue_depth": state.queue.len(),
                    "queue_capacity": capacity,
                })));
            }

            let default_timeout = self.shared.config.default_task_timeout;
            specs
                .into_iter()
                .map(|spec| {
                    let task = WorkerTask::from_spec(spec, default_timeout);
                    let id = task.id;
                    let position = state.queue.push(task.priority, task);
                    debug!(task_id = %id, position, "Task queued");
                    id
                })
                .collect::<Vec<_>>()
        };

        self.shared.dispatch();
        Ok(ids)
    }

    /// Result of a finished task, if it is still retained
    pub fn get_task_result(&self, task_id: Uuid) -> Option<TaskResult> {
        self.shared.state.lock().results.get(&task_id).cloned()
    }

    /// Where a task currently is, `None` for unknown or evicted tasks
    pub fn task_state(&self, task_id: Uuid) -> Option<TaskState> {
        let state = self.shared.state.lock();
        if let Some(result) = state.results.get(&task_id) {
            return Some(TaskState::Finished {
                result: result.clone(),
            });
        }
        if let Some(task) = state.running.get(&task_id) {
            return Some(TaskState::Running {
                worker_id: task.worker_id.unwrap_or_default(),
                started_at: task.started_at,
            });
        }
        let queued = state
            .queue
            .iter()
            .position(|(_, task)| task.id == task_id)
            .map(|position| TaskState::Queued { position });
        queued
    }

    /// Wait for a task to finish
    ///
    /// Resolves as soon as the worker completes the task; tasks dropped by
    /// shutdown resolve with an `Aborted` failure.
    pub async fn wait_for_result(&self, task_id: Uuid) -> Result<TaskResult, ResilienceError> {
        let rx = {
            let mut state = self.shared.state.lock();
            if let Some(result) = state.results.get(&task_id) {
                return Ok(result.clone());
            }
            let known = state.running.contains_key(&task_id)
                || state.queue.iter().any(|(_, task)| task.id == task_id);
            if !known {
                return Err(ResilienceError::client(format!("unknown task {task_id}"))
                    .with_code("TASK_NOT_FOUND")
                    .with_status(404));
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.entry(task_id).or_default().push(tx);
            rx
        };

        rx.await
            .map_err(|_| ResilienceError::aborted("worker pool dropped before the task finished"))
    }

    /// Wait for every task in `task_ids`, in order
    pub async fn collect_results(
        &self,
        task_ids: &[Uuid],
    ) -> Result<Vec<TaskResult>, ResilienceError> {
        futures::future::try_join_all(task_ids.iter().map(|id| self.wait_for_result(*id))).await
    }

    /// Resize the pool, returning the new worker count
    ///
    /// `target` is clamped to the configured bounds. Only idle workers are
    /// removed, least recently active first, so the result may stay above
    /// `target` while workers are busy.
    pub fn scale(&self, target: usize) -> usize {
        self.shared.scale_to(target)
    }

    pub fn status(&self) -> WorkerPoolStatus {
        let state = self.shared.state.lock();
        let config = &self.shared.config;

        let count = |status: WorkerStatus| state.workers.values().filter(|w| w.status == status).count();
        let finished = state.tasks_completed + state.tasks_failed;
        let (average_processing_ms, error_rate) = if finished == 0 {
            (0.0, 0.0)
        } else {
            (
                state.processing_time.as_secs_f64() * 1000.0 / finished as f64,
                state.tasks_failed as f64 / finished as f64,
            )
        };

        WorkerPoolStatus {
            state: state.lifecycle,
            total_workers: state.workers.len(),
            idle_workers: count(WorkerStatus::Idle),
            busy_workers: count(WorkerStatus::Busy),
            error_workers: count(WorkerStatus::Error),
            min_workers: config.min_workers,
            max_workers: config.max_workers,
            queue_depth: state.queue.len(),
            queue_capacity: config.queue_capacity,
            tasks_completed: state.tasks_completed,
            tasks_failed: state.tasks_failed,
            tasks_aborted: state.tasks_aborted,
            average_processing_ms,
            error_rate,
            workers: state
                .workers
                .values()
                .map(|w| WorkerInfo {
                    id: w.id,
                    status: w.status,
                    current_task: w.current_task,
                    tasks_completed: w.tasks_completed,
                    tasks_failed: w.tasks_failed,
                    busy_time: w.busy_time,
                    last_active_at: w.last_active_at,
                })
                .collect(),
        }
    }

    /// Shut down gracefully
    ///
    /// Queued tasks are aborted, running tasks get up to the shutdown
    /// timeout to finish.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), ResilienceError> {
        let aborted = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            if matches!(
                state.lifecycle,
                WorkerPoolState::Draining | WorkerPoolState::Stopped
            ) {
                return Ok(());
            }
            state.lifecycle = WorkerPoolState::Draining;

            let queued: Vec<WorkerTask> = state.queue.drain().map(|(_, task)| task).collect();
            let reason = ResilienceError::aborted("worker pool shut down before the task started");
            for task in &queued {
                state.tasks_aborted += 1;
                self.shared
                    .store_result(state, TaskResult::unstarted(task, &reason));
            }
            queued.len()
        };

        info!(aborted, "Initiating graceful shutdown");
        let _ = self.shared.shutdown_tx.send(true);

        let scaler = self.scaler_handle.lock().take();
        if let Some(handle) = scaler {
            let _ = handle.await;
        }

        let deadline = Instant::now() + self.shared.config.shutdown_timeout;
        loop {
            let in_flight = self.shared.state.lock().running.len();
            if in_flight == 0 {
                debug!("All tasks completed");
                break;
            }

            if tokio::time::timeout_at(deadline, self.shared.idle.notified())
                .await
                .is_err()
            {
                warn!(in_flight, "Shutdown timeout reached");
                self.shared.state.lock().lifecycle = WorkerPoolState::Stopped;
                return Err(ResilienceError::timeout("graceful shutdown timed out")
                    .with_code("SHUTDOWN_TIMEOUT")
                    .with_details(serde_json::json!({ "in_flight": in_flight })));
            }
        }

        {
            let mut state = self.shared.state.lock();
            state.lifecycle = WorkerPoolState::Stopped;
            state.workers.clear();
        }
        info!("Worker pool stopped");
        Ok(())
    }
}

impl Shared {
    /// Hand queued tasks to idle workers
    fn dispatch(self: &Arc<Self>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.lifecycle != WorkerPoolState::Running {
            return;
        }

        while !state.queue.is_empty() {
            let Some(worker_id) = state
                .workers
                .values()
                .find(|w| w.status == WorkerStatus::Idle)
                .map(|w| w.id)
            else {
                break;
            };
            let Some((_, mut task)) = state.queue.pop_front() else {
                break;
            };

            let handler = self.handlers.read().get(&task.task_type).cloned();
            let Some(handler) = handler else {
                let err = ResilienceError::validation(format!(
                    "no handler registered for task type '{}'",
                    task.task_type
                ));
                warn!(task_id = %task.id, task_type = %task.task_type, "No handler registered");
                state.tasks_failed += 1;
                self.store_result(state, TaskResult::unstarted(&task, &err));
                continue;
            };

            if let Some(worker) = state.workers.get_mut(&worker_id) {
                worker.status = WorkerStatus::Busy;
                worker.current_task = Some(task.id);
                worker.last_active = Instant::now();
            }
            task.started_at = Some(Utc::now());
            task.worker_id = Some(worker_id);
            state.running.insert(task.id, task.clone());

            debug!(task_id = %task.id, worker_id, task_type = %task.task_type, "Task assigned");
            tokio::spawn(Self::run_task(Arc::clone(self), worker_id, task, handler));
        }
    }

    async fn run_task(self: Arc<Self>, worker_id: u64, task: WorkerTask, handler: TaskHandler) {
        let task_id = task.id;
        let limit = task.timeout;
        let started = Instant::now();

        let execution = async move {
            match AssertUnwindSafe(handler(task)).catch_unwind().await {
                Ok(output) => output,
                Err(_) => Err(ResilienceError::unknown("task handler panicked").with_code(TASK_PANICKED)),
            }
        };
        let output = run_with_timeout(execution, Some(limit), TASK_TIMEOUT).await;

        let failed = self.finish_task(worker_id, task_id, output, started.elapsed());
        if failed {
            tokio::time::sleep(self.config.error_cooldown).await;
            let mut state = self.state.lock();
            if let Some(worker) = state.workers.get_mut(&worker_id) {
                if worker.status == WorkerStatus::Error {
                    worker.status = WorkerStatus::Idle;
                }
            }
        }

        self.dispatch();
    }

    /// Record a task outcome, returning whether it failed
    fn finish_task(&self, worker_id: u64, task_id: Uuid, output: TaskOutput, elapsed: Duration) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(task) = state.running.remove(&task_id) else {
            return false;
        };

        let failed = output.is_err();
        let result = TaskResult::finished(&task, &output, elapsed);

        if let Some(worker) = state.workers.get_mut(&worker_id) {
            worker.current_task = None;
            worker.busy_time += elapsed;
            worker.last_active = Instant::now();
            worker.last_active_at = result.completed_at;
            if failed {
                worker.tasks_failed += 1;
                worker.status = WorkerStatus::Error;
            } else {
                worker.tasks_completed += 1;
                worker.status = WorkerStatus::Idle;
            }
        }

        state.processing_time += elapsed;
        match &output {
            Ok(_) => {
                state.tasks_completed += 1;
                debug!(%task_id, worker_id, elapsed_ms = elapsed.as_millis() as u64, "Task completed");
            }
            Err(err) => {
                state.tasks_failed += 1;
                warn!(%task_id, worker_id, code = %err.code, error = %err, "Task failed");
            }
        }

        self.store_result(state, result);
        if state.running.is_empty() {
            self.idle.notify_one();
        }
        failed
    }

    fn store_result(&self, state: &mut PoolState, result: TaskResult) {
        let task_id = result.task_id;
        if let Some(waiters) = state.waiters.remove(&task_id) {
            for waiter in waiters {
                // Waiters that gave up need nothing
                let _ = waiter.send(result.clone());
            }
        }

        state.results.insert(task_id, result);
        state.result_order.push_back(task_id);
        while state.results.len() > self.config.max_retained_results {
            match state.result_order.pop_front() {
                Some(oldest) => {
                    state.results.remove(&oldest);
                }
                None => break,
            }
        }
    }

    fn scale_to(self: &Arc<Self>, target: usize) -> usize {
        let target = target.clamp(self.config.min_workers, self.config.max_workers);
        let count = {
            let mut state = self.state.lock();
            let current = state.workers.len();

            if target > current {
                for _ in current..target {
                    state.add_worker();
                }
                info!(from = current, to = target, "Scaled worker pool up");
            } else if target < current {
                let mut idle: Vec<(Instant, u64)> = state
                    .workers
                    .values()
                    .filter(|w| w.status == WorkerStatus::Idle)
                    .map(|w| (w.last_active, w.id))
                    .collect();
                idle.sort();
                for (_, id) in idle.into_iter().take(current - target) {
                    state.workers.remove(&id);
                }
                info!(from = current, to = state.workers.len(), "Scaled worker pool down");
            }
            state.workers.len()
        };

        self.dispatch();
        count
    }

    fn autoscale(self: &Arc<Self>) {
        let usage = self.probe.sample();
        let under_pressure = usage.memory_ratio >= self.config.memory_threshold
            || usage.cpu_ratio >= self.config.cpu_threshold;

        let input = {
            let state = self.state.lock();
            ScalingInput {
                workers: state.workers.len(),
                idle_workers: state.idle_workers(),
                queue_depth: state.queue.len(),
                min_workers: self.config.min_workers,
                max_workers: self.config.max_workers,
                under_pressure,
            }
        };

        if let ScalingDecision::ScaleTo(target) = decide(input) {
            debug!(
                workers = input.workers,
                queue_depth = input.queue_depth,
                memory_ratio = usage.memory_ratio,
                cpu_ratio = usage.cpu_ratio,
                target,
                "Auto-scaling"
            );
            self.scale_to(target);
        }
    }

    async fn scaler_loop(shared: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(shared.config.scale_interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if shared.state.lock().lifecycle != WorkerPoolState::Running {
                        break;
                    }
                    shared.autoscale();
                }
                _ = shutdown_rx.changed() => {
                    debug!("Scaler loop: shutdown requested");
                    break;
                }
            }
        }

        debug!("Scaler loop exited");
    }
}
