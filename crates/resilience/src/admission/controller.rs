//! Admission controller
//!
//! Requests that fit their endpoint's quotas are admitted immediately when
//! nobody is waiting. Everything else joins one priority queue drained by a
//! single background task, which admits the head as soon as capacity frees
//! up and rejects it when the wait would be too long or its admission
//! retries run out.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::config::{AdmissionConfig, EndpointLimits};
use super::cost::{CostEstimator, DefaultCostEstimator};
use super::headers::RateLimitHeaders;
use super::queue::{QueueEntry, QueueInfo, QueuedRequest, Waiter};
use super::tracker::{Admission, DenyReason, EndpointTracker};
use crate::error::ResilienceError;
use crate::priority::{Priority, PriorityQueue};
use crate::reliability::{backoff_delay, BackoffStrategy, JitterMode};

/// Error code for requests refused by admission control
pub const ADMISSION_REJECTED: &str = "ADMISSION_REJECTED";

/// Per-endpoint usage in an [`AdmissionStatus`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub endpoint: String,
    pub limits: EndpointLimits,
    pub requests_in_window: u32,
    pub tokens_in_window: u64,
    pub daily_requests: u32,
    pub daily_tokens: u64,
    /// `None` when the quota is unlimited
    pub remaining_requests: Option<u32>,
    pub remaining_tokens: Option<u64>,
    pub remaining_daily_requests: Option<u32>,
    pub remaining_daily_tokens: Option<u64>,
    /// When the oldest in-window request leaves the window
    pub window_resets_at: Option<DateTime<Utc>>,
    pub daily_resets_at: DateTime<Utc>,
    pub queued: usize,
}

/// Read-only view of the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionStatus {
    pub endpoints: Vec<EndpointStatus>,
    pub queue_depth: usize,
    pub admitted: u64,
    pub rejected: u64,
    pub abandoned: u64,
}

/// Maps monotonic instants onto wall-clock time
#[derive(Debug, Clone, Copy)]
struct Clock {
    instant: Instant,
    utc: DateTime<Utc>,
}

impl Clock {
    fn new() -> Self {
        Self {
            instant: Instant::now(),
            utc: Utc::now(),
        }
    }

    fn to_utc(&self, at: Instant) -> DateTime<Utc> {
        let offset = |d: Duration| chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero());
        if at >= self.instant {
            self.utc + offset(at - self.instant)
        } else {
            self.utc - offset(self.instant - at)
        }
    }
}

#[derive(Default)]
struct State {
    trackers: HashMap<String, EndpointTracker>,
    queue: PriorityQueue<Waiter>,
    draining: bool,
    admitted: u64,
    rejected: u64,
    abandoned: u64,
}

impl State {
    /// Pop the queue head and charge its cost once its caller has the permit
    fn admit_head(&mut self, endpoint: &str, now: Instant) {
        let Some((_, waiter)) = self.queue.pop_front() else {
            return;
        };
        let cost = waiter.request.cost;
        let waited = now.duration_since(waiter.request.enqueued_at);

        if waiter.respond(Ok(())) {
            if let Some(tracker) = self.trackers.get_mut(endpoint) {
                tracker.record(cost, now);
            }
            self.admitted += 1;
            debug!(
                endpoint = %endpoint,
                waited_ms = waited.as_millis() as u64,
                "Queued request admitted"
            );
        } else {
            self.abandoned += 1;
            debug!(endpoint = %endpoint, "Admitted request was abandoned");
        }
    }
}

struct Inner {
    config: AdmissionConfig,
    estimator: Box<dyn CostEstimator>,
    clock: Clock,
    state: Mutex<State>,
}

/// Sliding-window admission control with a priority wait queue
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        Self::with_estimator(config, DefaultCostEstimator::default())
    }

    pub fn with_estimator(config: AdmissionConfig, estimator: impl CostEstimator + 'static) -> Self {
        let mut state = State::default();
        for (endpoint, limits) in &config.endpoints {
            state
                .trackers
                .insert(endpoint.clone(), EndpointTracker::new(*limits, config.window));
        }

        Self {
            inner: Arc::new(Inner {
                config,
                estimator: Box::new(estimator),
                clock: Clock::new(),
                state: Mutex::new(state),
            }),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.inner.config
    }

    /// Estimated token cost of a payload sent to `endpoint`
    pub fn estimate_cost(&self, endpoint: &str, payload_bytes: usize) -> u64 {
        self.inner.estimator.estimate(endpoint, payload_bytes)
    }

    /// Wait until a request is admitted
    ///
    /// Resolves once the request fits `endpoint`'s quotas. Fails with a
    /// `Rejected` error when the required wait exceeds the configured
    /// maximum or `max_retries` admission backoff rounds pass without
    /// capacity. Dropping the future gives up the place in the queue
    /// without consuming quota.
    #[instrument(skip(self))]
    pub async fn request_permission(
        &self,
        endpoint: &str,
        cost: u64,
        priority: Priority,
        max_retries: u32,
    ) -> Result<(), ResilienceError> {
        let rx = {
            let mut state = self.inner.state.lock();
            let now = Instant::now();

            if state.queue.is_empty() {
                let tracker = self.inner.tracker(&mut state, endpoint);
                if tracker.check(cost, now).is_admit() {
                    tracker.record(cost, now);
                    state.admitted += 1;
                    debug!("Request admitted");
                    return Ok(());
                }
            }

            let (tx, rx) = oneshot::channel();
            let request = QueuedRequest::new(endpoint, cost, priority, max_retries);
            let position = state.queue.push(
                priority,
                Waiter {
                    request,
                    responder: tx,
                },
            );
            debug!(position, depth = state.queue.len(), "Request queued");

            if !state.draining {
                state.draining = true;
                tokio::spawn(Inner::drain(Arc::clone(&self.inner)));
            }
            rx
        };

        rx.await
            .unwrap_or_else(|_| Err(ResilienceError::rejected("admission controller stopped")))
    }

    /// Whether a request costing `cost` would be admitted right now
    ///
    /// Changes no state. Always false while other requests are queued.
    pub fn can_proceed(&self, endpoint: &str, cost: u64) -> bool {
        let state = self.inner.state.lock();
        if !state.queue.is_empty() {
            return false;
        }
        let now = Instant::now();
        match state.trackers.get(endpoint) {
            Some(tracker) => tracker.check(cost, now).is_admit(),
            None => EndpointTracker::new(self.inner.config.limits_for(endpoint), self.inner.config.window)
                .check(cost, now)
                .is_admit(),
        }
    }

    /// Usage of every known endpoint, sorted by name
    pub fn status(&self) -> AdmissionStatus {
        let state = self.inner.state.lock();
        let now = Instant::now();

        let mut queued: HashMap<&str, usize> = HashMap::new();
        for (_, waiter) in state.queue.iter() {
            *queued.entry(waiter.request.endpoint.as_str()).or_default() += 1;
        }

        let mut endpoints: Vec<EndpointStatus> = state
            .trackers
            .iter()
            .map(|(name, tracker)| {
                self.inner
                    .endpoint_status(name, tracker, now, queued.get(name.as_str()).copied().unwrap_or(0))
            })
            .collect();
        endpoints.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));

        AdmissionStatus {
            endpoints,
            queue_depth: state.queue.len(),
            admitted: state.admitted,
            rejected: state.rejected,
            abandoned: state.abandoned,
        }
    }

    /// Queue contents in service order
    pub fn queue_info(&self) -> QueueInfo {
        let state = self.inner.state.lock();
        let clock = &self.inner.clock;

        let mut by_priority = BTreeMap::new();
        let mut by_endpoint = BTreeMap::new();
        let mut entries = Vec::with_capacity(state.queue.len());
        for (priority, waiter) in state.queue.iter() {
            let request = &waiter.request;
            *by_priority.entry(priority).or_insert(0) += 1;
            *by_endpoint.entry(request.endpoint.clone()).or_insert(0) += 1;
            entries.push(QueueEntry {
                id: request.id,
                endpoint: request.endpoint.clone(),
                cost: request.cost,
                priority,
                enqueued_at: clock.to_utc(request.enqueued_at),
                retry_count: request.retry_count,
                max_retries: request.max_retries,
            });
        }

        QueueInfo {
            depth: entries.len(),
            by_priority,
            by_endpoint,
            oldest_enqueued_at: entries.iter().map(|e| e.enqueued_at).min(),
            entries,
        }
    }

    /// Rate-limit headers describing `endpoint`'s current usage
    pub fn rate_limit_headers(&self, endpoint: &str) -> RateLimitHeaders {
        let state = self.inner.state.lock();
        let now = Instant::now();
        let status = match state.trackers.get(endpoint) {
            Some(tracker) => self.inner.endpoint_status(endpoint, tracker, now, 0),
            None => {
                let tracker = EndpointTracker::new(
                    self.inner.config.limits_for(endpoint),
                    self.inner.config.window,
                );
                self.inner.endpoint_status(endpoint, &tracker, now, 0)
            }
        };
        RateLimitHeaders::from_status(&status, self.inner.clock.to_utc(now))
    }
}

impl Inner {
    fn tracker<'a>(&self, state: &'a mut State, endpoint: &str) -> &'a mut EndpointTracker {
        state
            .trackers
            .entry(endpoint.to_string())
            .or_insert_with(|| EndpointTracker::new(self.config.limits_for(endpoint), self.config.window))
    }

    fn endpoint_status(
        &self,
        endpoint: &str,
        tracker: &EndpointTracker,
        now: Instant,
        queued: usize,
    ) -> EndpointStatus {
        let limits = *tracker.limits();
        let usage = tracker.snapshot(now);
        let remaining = |limit: u64, used: u64| (limit > 0).then(|| limit.saturating_sub(used));

        EndpointStatus {
            endpoint: endpoint.to_string(),
            limits,
            requests_in_window: usage.requests_in_window,
            tokens_in_window: usage.tokens_in_window,
            daily_requests: usage.daily_requests,
            daily_tokens: usage.daily_tokens,
            remaining_requests: remaining(
                limits.requests_per_minute as u64,
                usage.requests_in_window as u64,
            )
            .map(|r| r as u32),
            remaining_tokens: remaining(limits.tokens_per_minute, usage.tokens_in_window),
            remaining_daily_requests: remaining(
                limits.requests_per_day as u64,
                usage.daily_requests as u64,
            )
            .map(|r| r as u32),
            remaining_daily_tokens: remaining(limits.tokens_per_day, usage.daily_tokens),
            window_resets_at: usage.window_frees_at.map(|at| self.clock.to_utc(at)),
            daily_resets_at: self.clock.to_utc(usage.daily_resets_at),
            queued,
        }
    }

    /// Serve the queue head until the queue is empty
    async fn drain(inner: Arc<Inner>) {
        debug!("Admission drain loop started");
        loop {
            let pause = {
                let mut guard = inner.state.lock();
                let state = &mut *guard;

                let abandoned = state.queue.retain(|w| !w.is_abandoned());
                if abandoned > 0 {
                    state.abandoned += abandoned as u64;
                    debug!(abandoned, "Dropped abandoned admission requests");
                }

                let Some(head) = state.queue.front_mut() else {
                    state.draining = false;
                    debug!("Admission drain loop idle");
                    return;
                };

                let now = Instant::now();
                let endpoint = head.request.endpoint.clone();
                let tracker = state
                    .trackers
                    .entry(endpoint.clone())
                    .or_insert_with(|| {
                        EndpointTracker::new(inner.config.limits_for(&endpoint), inner.config.window)
                    });
                tracker.prune(now);

                match tracker.check(head.request.cost, now) {
                    Admission::Admit => {
                        state.admit_head(&endpoint, now);
                        None
                    }
                    Admission::Deny { wait, reason } => {
                        let max_wait = inner.config.max_wait;
                        if wait > max_wait || head.request.retry_count >= head.request.max_retries {
                            let err = inner.rejection(&head.request, wait, reason);
                            if let Some((_, waiter)) = state.queue.pop_front() {
                                warn!(
                                    endpoint = %endpoint,
                                    reason = reason.as_str(),
                                    retry_count = waiter.request.retry_count,
                                    "Request rejected by admission control"
                                );
                                state.rejected += 1;
                                waiter.respond(Err(err));
                            }
                            None
                        } else {
                            let backoff = backoff_delay(
                                BackoffStrategy::Exponential,
                                JitterMode::Equal,
                                head.request.retry_count,
                                inner.config.backoff_base,
                                max_wait,
                                &mut rand::thread_rng(),
                            );
                            head.request.retry_count += 1;
                            let pause = wait.max(backoff).min(max_wait);
                            debug!(
                                endpoint = %endpoint,
                                reason = reason.as_str(),
                                retry_count = head.request.retry_count,
                                pause_ms = pause.as_millis() as u64,
                                "Waiting for admission capacity"
                            );
                            Some(pause)
                        }
                    }
                }
            };

            if let Some(pause) = pause {
                tokio::time::sleep(pause).await;
            }
        }
    }

    fn rejection(&self, request: &QueuedRequest, wait: Duration, reason: DenyReason) -> ResilienceError {
        let message = if reason == DenyReason::CostExceedsLimit {
            format!(
                "request cost {} exceeds the quota of endpoint '{}'",
                request.cost, request.endpoint
            )
        } else if wait > self.config.max_wait {
            format!(
                "endpoint '{}' has no capacity for {}ms, longer than the {}ms maximum wait",
                request.endpoint,
                wait.as_millis(),
                self.config.max_wait.as_millis()
            )
        } else {
            format!(
                "endpoint '{}' still over quota after {} admission retries",
                request.endpoint, request.retry_count
            )
        };

        let mut err = ResilienceError::rejected(message)
            .with_code(ADMISSION_REJECTED)
            .with_status(429)
            .with_details(serde_json::json!({
                "endpoint": request.endpoint,
                "reason": reason.as_str(),
                "priority": request.priority,
                "retry_count": request.retry_count,
                "request_id": request.id,
            }));
        if reason != DenyReason::CostExceedsLimit {
            err = err.with_retry_after(wait);
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn controller(rpm: u32, window: Duration) -> AdmissionController {
        AdmissionController::new(
            AdmissionConfig::default()
                .with_window(window)
                .with_endpoint("chat", EndpointLimits::default().with_requests_per_minute(rpm)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_sixth_request_in_window_is_rejected() {
        let limiter = controller(5, Duration::from_secs(60));

        for _ in 0..5 {
            limiter
                .request_permission("chat", 1, Priority::Medium, 3)
                .await
                .unwrap();
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        let err = limiter
            .request_permission("chat", 1, Priority::Medium, 3)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Rejected);
        assert_eq!(err.code, ADMISSION_REJECTED);
        assert_eq!(err.retry_after, Some(Duration::from_secs(55)));
        assert_eq!(limiter.status().endpoints[0].requests_in_window, 5);

        // The oldest request leaves the window, freeing exactly one slot
        tokio::time::advance(Duration::from_secs(55)).await;
        limiter
            .request_permission("chat", 1, Priority::Medium, 3)
            .await
            .unwrap();
        assert!(!limiter.can_proceed("chat", 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_wait_is_queued_then_admitted() {
        let limiter = controller(1, Duration::from_secs(10));
        limiter.request_permission("chat", 0, Priority::Medium, 3).await.unwrap();

        let start = Instant::now();
        limiter.request_permission("chat", 0, Priority::Medium, 3).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert_eq!(limiter.status().admitted, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_retries_exhausted() {
        let limiter = controller(1, Duration::from_secs(10));
        limiter.request_permission("chat", 0, Priority::Medium, 0).await.unwrap();

        let err = limiter
            .request_permission("chat", 0, Priority::Medium, 0)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Rejected);
        assert_eq!(err.details.as_ref().unwrap()["reason"], "requests_per_minute");
        assert_eq!(limiter.status().rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_order_with_fifo_tie_break() {
        let limiter = controller(1, Duration::from_secs(10));
        limiter.request_permission("chat", 0, Priority::Medium, 5).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for (name, priority) in [
            ("low", Priority::Low),
            ("high", Priority::High),
            ("medium-1", Priority::Medium),
            ("medium-2", Priority::Medium),
        ] {
            let limiter = limiter.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                limiter.request_permission("chat", 0, priority, 5).await.unwrap();
                order.lock().push(name);
            }));
            tokio::task::yield_now().await;
        }

        let info = limiter.queue_info();
        assert_eq!(info.depth, 4);
        assert_eq!(info.entries[0].priority, Priority::High);
        assert_eq!(info.entries[3].priority, Priority::Low);

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock(), vec!["high", "medium-1", "medium-2", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_waiter_releases_its_place() {
        let limiter = controller(1, Duration::from_secs(10));
        limiter.request_permission("chat", 0, Priority::Medium, 3).await.unwrap();

        let gave_up = tokio::time::timeout(
            Duration::from_secs(1),
            limiter.request_permission("chat", 0, Priority::High, 3),
        )
        .await;
        assert!(gave_up.is_err());

        limiter.request_permission("chat", 0, Priority::Low, 3).await.unwrap();

        let status = limiter.status();
        assert_eq!(status.abandoned, 1);
        assert_eq!(status.admitted, 2);
        assert_eq!(status.queue_depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permit_for_departed_caller_is_not_charged() {
        let limiter = controller(5, Duration::from_secs(60));
        limiter.request_permission("chat", 1, Priority::Medium, 3).await.unwrap();

        let waiter = |cost| {
            let (tx, rx) = oneshot::channel();
            let request = QueuedRequest::new("chat", cost, Priority::Medium, 3);
            (Waiter { request, responder: tx }, rx)
        };

        {
            let mut state = limiter.inner.state.lock();
            let (departed, rx) = waiter(7);
            state.queue.push(Priority::Medium, departed);
            drop(rx);
            state.admit_head("chat", Instant::now());
        }
        let status = limiter.status();
        assert_eq!(status.abandoned, 1);
        assert_eq!(status.admitted, 1);
        assert_eq!(status.endpoints[0].requests_in_window, 1);
        assert_eq!(status.endpoints[0].tokens_in_window, 1);

        let mut rx = {
            let mut state = limiter.inner.state.lock();
            let (present, rx) = waiter(7);
            state.queue.push(Priority::Medium, present);
            state.admit_head("chat", Instant::now());
            rx
        };
        assert!(rx.try_recv().unwrap().is_ok());
        let status = limiter.status();
        assert_eq!(status.admitted, 2);
        assert_eq!(status.endpoints[0].requests_in_window, 2);
        assert_eq!(status.endpoints[0].tokens_in_window, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_cost_is_rejected_without_retry_after() {
        let limiter = AdmissionController::new(
            AdmissionConfig::default()
                .with_endpoint("embed", EndpointLimits::default().with_tokens_per_minute(100)),
        );

        let err = limiter
            .request_permission("embed", 500, Priority::High, 3)
            .await
            .unwrap_err();
        assert_eq!(err.details.as_ref().unwrap()["reason"], "cost_exceeds_limit");
        assert!(err.retry_after.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_is_idempotent() {
        let limiter = controller(5, Duration::from_secs(60));
        limiter.request_permission("chat", 3, Priority::Medium, 3).await.unwrap();
        limiter.request_permission("search", 0, Priority::Medium, 3).await.unwrap();

        let first = limiter.status();
        assert_eq!(first, limiter.status());
        assert_eq!(limiter.queue_info(), limiter.queue_info());

        assert_eq!(first.endpoints.len(), 2);
        assert_eq!(first.endpoints[0].endpoint, "chat");
        assert_eq!(first.endpoints[0].remaining_requests, Some(4));
        assert_eq!(first.endpoints[1].remaining_requests, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_endpoint_admits_immediately() {
        let limiter = AdmissionController::new(AdmissionConfig::default());
        for _ in 0..100 {
            limiter
                .request_permission("anything", 1_000, Priority::Low, 0)
                .await
                .unwrap();
        }
        assert!(limiter.can_proceed("anything", u64::MAX));
        assert_eq!(limiter.estimate_cost("anything", 40), 60);
    }
}
