//! Circuit breaker
//!
//! One breaker per (policy, operation) key, owned by a
//! [`CircuitBreakerRegistry`] for the lifetime of the engine.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, ResilienceError};
use crate::serde_millis::{duration_millis, option_duration_millis};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure threshold exceeded - all calls rejected
    Open,

    /// Testing if service recovered - calls allowed, first failure reopens
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  failure threshold  ┌─────────┐  open timeout   ┌──────────┐
/// │ Closed  │ ─────────────────► │  Open   │ ──────────────► │ HalfOpen │
/// └─────────┘                     └─────────┘ ◄────────────── └──────────┘
///      ▲                                        any failure        │
///      │              success threshold                            │
///      └───────────────────────────────────────────────────────────┘
/// ```
///
/// # Example
///
/// ```
/// use bulwark_resilience::reliability::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_failure_threshold(5)
///     .with_open_timeout(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit
    pub failure_threshold: u32,

    /// Consecutive successes required to close the circuit (in half-open state)
    pub success_threshold: u32,

    /// Time after the last failure before a trial call is let through
    #[serde(with = "duration_millis")]
    pub open_timeout: Duration,

    /// Calls that must be observed while closed before the circuit may open
    #[serde(default)]
    pub minimum_throughput: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(60),
            minimum_throughput: 0,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold to open the circuit
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the success threshold to close the circuit
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set the open timeout (time before trying again after opening)
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Require a minimum number of calls before the circuit can open
    pub fn with_minimum_throughput(mut self, calls: u32) -> Self {
        self.minimum_throughput = calls;
        self
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitMetrics {
    pub key: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    #[serde(with = "option_duration_millis")]
    pub since_last_failure: Option<Duration>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    calls_while_closed: u32,
    last_failure_at: Option<Instant>,
    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            calls_while_closed: 0,
            last_failure_at: None,
            total_calls: 0,
            total_successes: 0,
            total_failures: 0,
            total_rejections: 0,
        }
    }
}

/// In-process circuit breaker
///
/// The breaker only decides whether a call may run and tracks outcomes; it
/// never retries. All state changes happen under a short lock that is never
/// held across an await point.
///
/// # Example
///
/// ```
/// use bulwark_resilience::reliability::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
/// use bulwark_resilience::ResilienceError;
///
/// # let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
/// # rt.block_on(async {
/// let breaker = CircuitBreaker::new("thumbnails", CircuitBreakerConfig::default());
/// let value = breaker
///     .execute(|| async { Ok::<_, ResilienceError>(42) })
///     .await
///     .unwrap();
/// assert_eq!(value, 42);
/// assert_eq!(breaker.state(), CircuitState::Closed);
/// # });
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    key: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a new breaker in the closed state
    pub fn new(key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            key: key.into(),
            config,
            inner: Mutex::new(BreakerState::new()),
        }
    }

    /// Get the circuit breaker key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Get the circuit breaker configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state without attempting a transition
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Snapshot of counters and state
    pub fn metrics(&self) -> CircuitMetrics {
        let s = self.inner.lock();
        CircuitMetrics {
            key: self.key.clone(),
            state: s.state,
            consecutive_failures: s.consecutive_failures,
            consecutive_successes: s.consecutive_successes,
            total_calls: s.total_calls,
            total_successes: s.total_successes,
            total_failures: s.total_failures,
            total_rejections: s.total_rejections,
            since_last_failure: s.last_failure_at.map(|at| at.elapsed()),
        }
    }

    /// Check if a call may proceed
    ///
    /// Moves an open breaker to half-open once the open timeout has elapsed
    /// since the last failure.
    pub fn try_acquire(&self) -> Result<(), ResilienceError> {
        let mut s = self.inner.lock();

        if s.state == CircuitState::Open {
            let elapsed = s.last_failure_at.map(|at| at.elapsed());
            match elapsed {
                Some(elapsed) if elapsed >= self.config.open_timeout => {
                    s.state = CircuitState::HalfOpen;
                    s.consecutive_successes = 0;
                    info!(key = %self.key, "Circuit breaker half-open, allowing trial call");
                }
                _ => {
                    s.total_rejections += 1;
                    let retry_after = elapsed
                        .map(|e| self.config.open_timeout.saturating_sub(e))
                        .unwrap_or(self.config.open_timeout);
                    debug!(key = %self.key, ?retry_after, "Circuit breaker rejected call");
                    return Err(ResilienceError::new(
                        ErrorKind::CircuitOpen,
                        format!("circuit breaker '{}' is open", self.key),
                    )
                    .with_retry_after(retry_after)
                    .with_details(serde_json::json!({
                        "key": self.key,
                        "consecutive_failures": s.consecutive_failures,
                    })));
                }
            }
        }

        s.total_calls += 1;
        if s.state == CircuitState::Closed {
            s.calls_while_closed = s.calls_while_closed.saturating_add(1);
        }
        Ok(())
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut s = self.inner.lock();
        s.total_successes += 1;

        match s.state {
            CircuitState::Closed => {
                s.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                s.consecutive_successes += 1;
                if s.consecutive_successes >= self.config.success_threshold {
                    Self::close(&mut s);
                    info!(key = %self.key, "Circuit breaker closed");
                }
            }
            CircuitState::Open => {
                // Late result from a call admitted before the circuit opened
            }
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let mut s = self.inner.lock();
        s.total_failures += 1;
        s.last_failure_at = Some(Instant::now());

        match s.state {
            CircuitState::Closed => {
                s.consecutive_failures += 1;
                if s.consecutive_failures >= self.config.failure_threshold
                    && s.calls_while_closed >= self.config.minimum_throughput
                {
                    s.state = CircuitState::Open;
                    s.consecutive_successes = 0;
                    warn!(
                        key = %self.key,
                        failures = s.consecutive_failures,
                        open_timeout_ms = self.config.open_timeout.as_millis() as u64,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                s.state = CircuitState::Open;
                s.consecutive_successes = 0;
                warn!(key = %self.key, "Circuit breaker reopened after half-open failure");
            }
            CircuitState::Open => {}
        }
    }

    /// Run `op` through the breaker
    ///
    /// The operation is not invoked at all when the circuit is open.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        self.try_acquire()?;

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    /// Force the breaker closed (for admin operations and tests)
    pub fn reset(&self) {
        let mut s = self.inner.lock();
        Self::close(&mut s);
        info!(key = %self.key, "Circuit breaker reset");
    }

    fn close(s: &mut BreakerState) {
        s.state = CircuitState::Closed;
        s.consecutive_failures = 0;
        s.consecutive_successes = 0;
        s.calls_while_closed = 0;
    }
}

/// Process-local registry of breakers keyed by (policy name, operation id)
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry key for a policy/operation pair
    pub fn key(policy_name: &str, operation_id: &str) -> String {
        format!("{policy_name}:{operation_id}")
    }

    /// Get the breaker for a key, creating it with `config` on first use
    pub fn get_or_create(
        &self,
        policy_name: &str,
        operation_id: &str,
        config: &CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        let key = Self::key(policy_name, operation_id);
        self.breakers
            .entry(key.clone())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(key, config.clone())))
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(key).map(|b| Arc::clone(b.value()))
    }

    /// Metrics for every breaker, sorted by key
    pub fn snapshot(&self) -> Vec<CircuitMetrics> {
        let mut all: Vec<_> = self.breakers.iter().map(|b| b.metrics()).collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.reset();
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            "test_service",
            CircuitBreakerConfig::default()
                .with_failure_threshold(5)
                .with_success_threshold(2)
                .with_open_timeout(Duration::from_secs(30)),
        )
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), ResilienceError> {
        b.execute(|| async { Err::<(), _>(ResilienceError::server("boom")) })
            .await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<(), ResilienceError> {
        b.execute(|| async { Ok(()) }).await
    }

    #[test]
    fn test_default_config() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.success_threshold, 2);
        assert_eq!(config.open_timeout, Duration::from_secs(60));
        assert_eq!(config.minimum_throughput, 0);
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_skips_operation() {
        let b = breaker();
        for _ in 0..5 {
            assert!(fail(&b).await.is_err());
        }
        assert_eq!(b.state(), CircuitState::Open);

        let invoked = AtomicU32::new(0);
        let result = b
            .execute(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::CircuitOpen);
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(b.metrics().total_rejections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_then_closed() {
        let b = breaker();
        for _ in 0..5 {
            let _ = fail(&b).await;
        }

        tokio::time::advance(Duration::from_secs(31)).await;

        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);

        // Counting restarts from zero once closed
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.metrics().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let b = breaker();
        for _ in 0..5 {
            let _ = fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;

        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(succeed(&b).await.unwrap_err().kind, ErrorKind::CircuitOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stays_open_before_timeout() {
        let b = breaker();
        for _ in 0..5 {
            let _ = fail(&b).await;
        }
        tokio::time::advance(Duration::from_secs(10)).await;

        let err = succeed(&b).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::CircuitOpen);
        assert_eq!(err.retry_after, Some(Duration::from_secs(20)));
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let b = breaker();
        for _ in 0..4 {
            let _ = fail(&b).await;
        }
        succeed(&b).await.unwrap();
        for _ in 0..4 {
            let _ = fail(&b).await;
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_minimum_throughput() {
        let b = CircuitBreaker::new(
            "throughput",
            CircuitBreakerConfig::default()
                .with_failure_threshold(2)
                .with_minimum_throughput(4),
        );

        let _ = fail(&b).await;
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Closed);
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Closed);
        let _ = fail(&b).await;
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_reset() {
        let b = breaker();
        for _ in 0..5 {
            let _ = fail(&b).await;
        }
        b.reset();
        assert_eq!(b.state(), CircuitState::Closed);
        succeed(&b).await.unwrap();
    }

    #[test]
    fn test_registry_keys_by_policy_and_operation() {
        let registry = CircuitBreakerRegistry::new();
        let config = CircuitBreakerConfig::default();

        let a = registry.get_or_create("standard_api", "upload", &config);
        let b = registry.get_or_create("standard_api", "upload", &config);
        let c = registry.get_or_create("standard_api", "download", &config);

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);

        let keys: Vec<_> = registry.snapshot().into_iter().map(|m| m.key).collect();
        assert_eq!(keys, vec!["standard_api:download", "standard_api:upload"]);
    }

    #[test]
    fn test_serialization() {
        let config = CircuitBreakerConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: CircuitBreakerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }
}
