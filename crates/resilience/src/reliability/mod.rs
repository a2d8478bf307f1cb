//! Reliability patterns for calls to external services
//!
//! This module provides:
//! - [`RetryEngine`] - Retry-with-backoff state machine
//! - [`RetryPolicy`] - Retry configuration, with named templates and services
//! - [`CircuitBreaker`] - Per-key CLOSED/OPEN/HALF_OPEN breaker
//! - [`BudgetTracker`] - Rolling cap on retry count and retry time

mod budget;
mod circuit_breaker;
mod condition;
mod delay;
mod engine;
mod policy;
mod timeout;

pub use budget::{BudgetConfig, BudgetRegistry, BudgetTracker, BudgetUsage};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitMetrics, CircuitState,
};
pub use condition::RetryConditionEvaluator;
pub use delay::{backoff_delay, BackoffStrategy, DelayCalculator, DelayFn, JitterMode};
pub use engine::{AttemptRecord, RetryContext, RetryEngine, RetryResult, DEFAULT_OPERATION_ID};
pub use policy::{
    PolicyOverride, PolicyRef, PolicyRegistry, PolicyTemplate, RetryPolicy, RetryPredicate,
    ServiceKind,
};
pub use timeout::{run_with_timeout, ATTEMPT_TIMEOUT, TASK_TIMEOUT};
