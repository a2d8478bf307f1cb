//! Retry engine
//!
//! Drives the retry-with-backoff state machine for one logical call:
//! attempts are strictly sequential, and the backoff sleep is the only
//! point where the engine itself waits.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::budget::{BudgetRegistry, BudgetUsage};
use super::circuit_breaker::{CircuitBreakerRegistry, CircuitMetrics, CircuitState};
use super::condition::RetryConditionEvaluator;
use super::delay::DelayCalculator;
use super::policy::{PolicyRef, PolicyRegistry, RetryPolicy};
use super::timeout::{run_with_timeout, ATTEMPT_TIMEOUT};
use crate::error::{ErrorKind, ResilienceError};

/// Operation id used for breaker and budget keys when the caller gives none
pub const DEFAULT_OPERATION_ID: &str = "default";

/// Mutable state of one `execute_with_retry` call
#[derive(Debug, Clone)]
pub struct RetryContext {
    pub operation_id: String,
    /// Current attempt, 0 for the initial call
    pub attempt: u32,
    pub max_attempts: u32,
    pub remaining_attempts: u32,
    /// Errors from every failed attempt so far, oldest first
    pub errors: Vec<ResilienceError>,
    /// Time spent in backoff sleeps
    pub total_delay: Duration,
    pub started_at: Instant,
    pub last_delay: Option<Duration>,
    pub next_delay: Option<Duration>,
    pub circuit_state: Option<CircuitState>,
    pub budget: Option<BudgetUsage>,
}

impl RetryContext {
    pub fn new(operation_id: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            operation_id: operation_id.into(),
            attempt: 0,
            max_attempts,
            remaining_attempts: max_attempts,
            errors: Vec::new(),
            total_delay: Duration::ZERO,
            started_at: Instant::now(),
            last_delay: None,
            next_delay: None,
            circuit_state: None,
            budget: None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn last_error(&self) -> Option<&ResilienceError> {
        self.errors.last()
    }
}

/// Outcome of a single attempt
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub success: bool,
    pub error: Option<ResilienceError>,
    /// Backoff applied after this attempt, if another one followed
    pub delay: Option<Duration>,
    pub timestamp: DateTime<Utc>,
    pub duration: Duration,
}

/// Full outcome of a retried call
#[derive(Debug)]
pub struct RetryResult<T> {
    pub outcome: Result<T, ResilienceError>,
    pub total_attempts: u32,
    pub total_time: Duration,
    pub total_delay: Duration,
    pub attempts: Vec<AttemptRecord>,
    pub policy: RetryPolicy,
    pub context: RetryContext,
}

impl<T> RetryResult<T> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn value(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&ResilienceError> {
        self.outcome.as_ref().err()
    }

    pub fn into_result(self) -> Result<T, ResilienceError> {
        self.outcome
    }
}

/// Executes operations under retry policies
///
/// Owns the circuit breaker and budget registries, so every call made
/// through the same engine shares breaker and budget state per
/// (policy, operation) key.
///
/// # Example
///
/// ```
/// use bulwark_resilience::reliability::{JitterMode, RetryEngine, RetryPolicy};
/// use bulwark_resilience::ResilienceError;
/// use std::time::Duration;
///
/// # let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
/// # rt.block_on(async {
/// let engine = RetryEngine::new();
/// let policy = RetryPolicy::new("lookup")
///     .with_jitter(JitterMode::None)
///     .with_base_delay(Duration::from_millis(1));
///
/// let value = engine
///     .execute_with_retry(|| async { Ok::<_, ResilienceError>(42) }, policy, Some("user"))
///     .await
///     .unwrap();
/// assert_eq!(value, 42);
/// # });
/// ```
#[derive(Debug, Clone)]
pub struct RetryEngine {
    policies: Arc<PolicyRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    budgets: Arc<BudgetRegistry>,
}

impl Default for RetryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryEngine {
    pub fn new() -> Self {
        Self::with_policies(PolicyRegistry::new())
    }

    pub fn with_policies(policies: PolicyRegistry) -> Self {
        Self {
            policies: Arc::new(policies),
            breakers: Arc::new(CircuitBreakerRegistry::new()),
            budgets: Arc::new(BudgetRegistry::new()),
        }
    }

    pub fn policies(&self) -> &PolicyRegistry {
        &self.policies
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn budgets(&self) -> &BudgetRegistry {
        &self.budgets
    }

    /// Metrics for every breaker created so far
    pub fn circuit_metrics(&self) -> Vec<CircuitMetrics> {
        self.breakers.snapshot()
    }

    /// Run `op` under `policy`, returning its value or the final error
    ///
    /// The final error carries the attempt history in `details`.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        op: F,
        policy: impl Into<PolicyRef>,
        operation_id: Option<&str>,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        self.execute_with_retry_result(op, policy, operation_id)
            .await?
            .into_result()
    }

    /// Run `op` under a policy reference, returning the full [`RetryResult`]
    ///
    /// Fails without running `op` only when the policy cannot be resolved.
    pub async fn execute_with_retry_result<T, F, Fut>(
        &self,
        op: F,
        policy: impl Into<PolicyRef>,
        operation_id: Option<&str>,
    ) -> Result<RetryResult<T>, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let policy = self.policies.resolve(&policy.into())?;
        Ok(self.execute_policy(op, &policy, operation_id).await)
    }

    /// Run `op` under an already resolved policy
    #[instrument(skip(self, op, policy), fields(policy = %policy.name))]
    pub async fn execute_policy<T, F, Fut>(
        &self,
        mut op: F,
        policy: &RetryPolicy,
        operation_id: Option<&str>,
    ) -> RetryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let operation_id = operation_id.unwrap_or(DEFAULT_OPERATION_ID).to_string();

        let mut ctx = RetryContext::new(operation_id.clone(), policy.max_attempts);
        let mut records: Vec<AttemptRecord> = Vec::new();

        let breaker = policy
            .circuit_breaker
            .as_ref()
            .map(|config| self.breakers.get_or_create(&policy.name, &operation_id, config));
        let budget = policy
            .budget
            .as_ref()
            .map(|config| self.budgets.get_or_create(&policy.name, &operation_id, config));

        let mut attempt: u32 = 0;
        let final_error = loop {
            ctx.attempt = attempt;
            ctx.remaining_attempts = policy.max_attempts.saturating_sub(attempt);
            ctx.circuit_state = breaker.as_ref().map(|b| b.state());
            ctx.budget = budget.as_ref().map(|b| b.usage());

            let timestamp = Utc::now();
            let started = Instant::now();
            let outcome = match &breaker {
                Some(breaker) => {
                    breaker
                        .execute(|| run_with_timeout(op(), policy.timeout_per_attempt, ATTEMPT_TIMEOUT))
                        .await
                }
                None => run_with_timeout(op(), policy.timeout_per_attempt, ATTEMPT_TIMEOUT).await,
            };

            let mut err = match outcome {
                Ok(value) => {
                    if let Some(budget) = &budget {
                        budget.record_success();
                        ctx.budget = Some(budget.usage());
                    }
                    ctx.circuit_state = breaker.as_ref().map(|b| b.state());
                    records.push(AttemptRecord {
                        attempt,
                        success: true,
                        error: None,
                        delay: None,
                        timestamp,
                        duration: started.elapsed(),
                    });
                    if attempt > 0 {
                        info!(attempts = attempt + 1, "Operation succeeded after retry");
                    }
                    return Self::finish(Ok(value), records, policy, ctx);
                }
                Err(err) => err,
            };

            if err.kind == ErrorKind::CircuitOpen && err.cause.is_none() {
                if let Some(previous) = ctx.last_error() {
                    err = err.with_cause(previous.clone());
                }
            }

            ctx.errors.push(err.clone());
            ctx.circuit_state = breaker.as_ref().map(|b| b.state());
            let mut record = AttemptRecord {
                attempt,
                success: false,
                error: Some(err.clone()),
                delay: None,
                timestamp,
                duration: started.elapsed(),
            };

            if attempt >= policy.max_attempts {
                records.push(record);
                warn!(attempts = attempt + 1, code = %err.code, "Retries exhausted");
                break err;
            }

            if !RetryConditionEvaluator::should_retry(&err, attempt, policy, &ctx) {
                records.push(record);
                debug!(attempt, code = %err.code, kind = %err.kind, "Error is not retryable");
                break err;
            }

            let mut delay = DelayCalculator::calculate_delay(attempt, policy, &ctx);
            if let Some(retry_after) = err.retry_after {
                delay = delay.max(retry_after.min(policy.max_delay));
            }
            ctx.next_delay = Some(delay);

            if Self::is_cancelled(policy) {
                records.push(record);
                warn!(attempt, "Retry aborted by cancellation");
                break Self::aborted(err);
            }

            if let Some(budget) = &budget {
                if !budget.try_consume(delay) {
                    records.push(record);
                    let usage = budget.usage();
                    ctx.budget = Some(usage);
                    warn!(
                        attempt,
                        attempts_used = usage.attempts_used,
                        "Retry budget exhausted"
                    );
                    break ResilienceError::new(
                        ErrorKind::BudgetExhausted,
                        format!("retry budget exhausted for '{}'", budget.key()),
                    )
                    .with_details(serde_json::json!({
                        "key": budget.key(),
                        "attempts_used": usage.attempts_used,
                        "time_used_ms": usage.time_used.as_millis() as u64,
                    }))
                    .with_cause(err);
                }
            }

            record.delay = Some(delay);
            records.push(record);

            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                code = %err.code,
                "Scheduling retry"
            );

            let sleep_started = Instant::now();
            let cancelled = match &policy.cancellation {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => true,
                        _ = tokio::time::sleep(delay) => false,
                    }
                }
                None => {
                    tokio::time::sleep(delay).await;
                    false
                }
            };
            ctx.total_delay += sleep_started.elapsed();
            ctx.last_delay = Some(delay);
            ctx.next_delay = None;

            if cancelled {
                warn!(attempt, "Retry aborted during backoff");
                break Self::aborted(err);
            }

            attempt += 1;
        };

        let final_error = Self::attach_history(final_error, &ctx.operation_id, &records);
        Self::finish(Err(final_error), records, policy, ctx)
    }

    fn finish<T>(
        outcome: Result<T, ResilienceError>,
        attempts: Vec<AttemptRecord>,
        policy: &RetryPolicy,
        context: RetryContext,
    ) -> RetryResult<T> {
        RetryResult {
            outcome,
            total_attempts: attempts.len() as u32,
            total_time: context.elapsed(),
            total_delay: context.total_delay,
            attempts,
            policy: policy.clone(),
            context,
        }
    }

    fn is_cancelled(policy: &RetryPolicy) -> bool {
        policy
            .cancellation
            .as_ref()
            .is_some_and(|token| token.is_cancelled())
    }

    fn aborted(cause: ResilienceError) -> ResilienceError {
        ResilienceError::aborted("operation cancelled before the next retry").with_cause(cause)
    }

    fn attach_history(
        err: ResilienceError,
        operation_id: &str,
        records: &[AttemptRecord],
    ) -> ResilienceError {
        let history: Vec<_> = records
            .iter()
            .map(|r| {
                serde_json::json!({
                    "attempt": r.attempt,
                    "code": r.error.as_ref().map(|e| e.code.as_str()),
                    "message": r.error.as_ref().map(|e| e.message.as_str()),
                    "delay_ms": r.delay.map(|d| d.as_millis() as u64),
                })
            })
            .collect();

        let mut details = serde_json::json!({
            "operation_id": operation_id,
            "attempts": records.len(),
            "history": history,
        });
        if let Some(original) = err.details.clone() {
            details["error"] = original;
        }
        err.with_details(details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::delay::{BackoffStrategy, JitterMode};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fixed(max_attempts: u32, delay_ms: u64) -> RetryPolicy {
        RetryPolicy::new("test")
            .with_max_attempts(max_attempts)
            .with_strategy(BackoffStrategy::Fixed)
            .with_jitter(JitterMode::None)
            .with_base_delay(Duration::from_millis(delay_ms))
            .with_max_delay(Duration::from_secs(10))
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_first_try() {
        let engine = RetryEngine::new();
        let result = engine
            .execute_policy(|| async { Ok::<_, ResilienceError>("ok") }, &fixed(3, 100), None)
            .await;

        assert!(result.is_success());
        assert_eq!(result.total_attempts, 1);
        assert_eq!(result.total_delay, Duration::ZERO);
        assert_eq!(result.context.operation_id, DEFAULT_OPERATION_ID);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let engine = RetryEngine::new();
        let calls = AtomicU32::new(0);

        let result = engine
            .execute_policy(
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ResilienceError::network("reset"))
                    } else {
                        Ok(5)
                    }
                },
                &fixed(3, 100),
                Some("op"),
            )
            .await;

        assert_eq!(result.value(), Some(&5));
        assert_eq!(result.total_attempts, 3);
        assert_eq!(result.total_delay, Duration::from_millis(200));
        assert_eq!(result.context.errors.len(), 2);
        assert!(result.attempts[2].success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_fails_immediately() {
        let engine = RetryEngine::new();
        let calls = AtomicU32::new(0);

        let result = engine
            .execute_policy(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ResilienceError::from_status(400, "bad request"))
                },
                &fixed(3, 100),
                Some("op"),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let err = result.error().unwrap();
        assert_eq!(err.kind, ErrorKind::Client);
        assert_eq!(err.details.as_ref().unwrap()["attempts"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_retryable() {
        let engine = RetryEngine::new();
        let calls = AtomicU32::new(0);
        let policy = fixed(1, 10).with_timeout_per_attempt(Duration::from_millis(50));

        let result = engine
            .execute_policy(
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    Ok::<_, ResilienceError>("late")
                },
                &policy,
                Some("op"),
            )
            .await;

        assert!(result.is_success());
        let first = result.attempts[0].error.as_ref().unwrap();
        assert_eq!(first.code, ATTEMPT_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_raises_delay() {
        let engine = RetryEngine::new();
        let calls = AtomicU32::new(0);

        let result = engine
            .execute_policy(
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(ResilienceError::rate_limited("slow down")
                            .with_retry_after(Duration::from_secs(2)))
                    } else {
                        Ok(())
                    }
                },
                &fixed(1, 100),
                Some("op"),
            )
            .await;

        assert!(result.is_success());
        assert_eq!(result.attempts[0].delay, Some(Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_policy_name_fails_fast() {
        let engine = RetryEngine::new();
        let calls = AtomicU32::new(0);

        let err = engine
            .execute_with_retry(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ResilienceError>(())
                },
                PolicyRef::Template("hyper aggressive".into()),
                None,
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Configuration);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
