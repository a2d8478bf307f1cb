//! Retry policy definitions and named policy resolution

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::budget::BudgetConfig;
use super::circuit_breaker::CircuitBreakerConfig;
use super::delay::{BackoffStrategy, DelayFn, JitterMode};
use super::engine::RetryContext;
use crate::error::{ErrorKind, ResilienceError, Severity};
use crate::serde_millis::{duration_millis, option_duration_millis};

/// Custom retry predicate: `(error, attempt, context) -> retry?`
#[derive(Clone)]
pub struct RetryPredicate(
    pub Arc<dyn Fn(&ResilienceError, u32, &RetryContext) -> bool + Send + Sync>,
);

impl RetryPredicate {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&ResilienceError, u32, &RetryContext) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for RetryPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RetryPredicate(..)")
    }
}

/// Immutable retry configuration
///
/// # Example
///
/// ```
/// use bulwark_resilience::reliability::{BackoffStrategy, JitterMode, RetryPolicy};
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new("thumbnails")
///     .with_max_attempts(3)
///     .with_strategy(BackoffStrategy::Fixed)
///     .with_jitter(JitterMode::None)
///     .with_base_delay(Duration::from_millis(500));
///
/// assert_eq!(policy.max_attempts, 3);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Name used to key circuit breakers and budgets
    pub name: String,

    /// Maximum number of retries after the initial attempt
    pub max_attempts: u32,

    /// Delay unit the strategy scales
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    /// Upper bound for any computed delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    pub strategy: BackoffStrategy,

    pub jitter: JitterMode,

    /// Time limit for a single attempt
    #[serde(default, with = "option_duration_millis")]
    pub timeout_per_attempt: Option<Duration>,

    /// Gate attempts through a circuit breaker when set
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,

    /// Cap cumulative retries when set
    #[serde(default)]
    pub budget: Option<BudgetConfig>,

    /// Error codes that are always retried
    #[serde(default)]
    pub retryable_error_codes: HashSet<String>,

    /// Error codes that are never retried
    #[serde(default)]
    pub non_retryable_error_codes: HashSet<String>,

    /// When set, only these kinds may be retried
    #[serde(default)]
    pub retryable_kinds: Option<HashSet<ErrorKind>>,

    /// When set, only these severities may be retried
    #[serde(default)]
    pub retryable_severities: Option<HashSet<Severity>>,

    /// Overrides every other retry rule when set
    #[serde(skip)]
    pub custom_predicate: Option<RetryPredicate>,

    /// Used by [`BackoffStrategy::Custom`]
    #[serde(skip)]
    pub custom_delay: Option<DelayFn>,

    /// Suppresses further retries once cancelled
    #[serde(skip)]
    pub cancellation: Option<CancellationToken>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new("default")
    }
}

impl RetryPolicy {
    /// Create a policy with sensible defaults
    ///
    /// - 3 retries
    /// - 1 second base delay, 30 second cap
    /// - exponential backoff with full jitter
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
            jitter: JitterMode::Full,
            timeout_per_attempt: None,
            circuit_breaker: None,
            budget: None,
            retryable_error_codes: HashSet::new(),
            non_retryable_error_codes: HashSet::new(),
            retryable_kinds: None,
            retryable_severities: None,
            custom_predicate: None,
            custom_delay: None,
            cancellation: None,
        }
    }

    /// A policy that never retries
    pub fn no_retry(name: impl Into<String>) -> Self {
        Self::new(name)
            .with_max_attempts(0)
            .with_base_delay(Duration::ZERO)
            .with_jitter(JitterMode::None)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_jitter(mut self, jitter: JitterMode) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_timeout_per_attempt(mut self, timeout: Duration) -> Self {
        self.timeout_per_attempt = Some(timeout);
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    pub fn with_budget(mut self, config: BudgetConfig) -> Self {
        self.budget = Some(config);
        self
    }

    pub fn with_retryable_code(mut self, code: impl Into<String>) -> Self {
        self.retryable_error_codes.insert(code.into());
        self
    }

    pub fn with_non_retryable_code(mut self, code: impl Into<String>) -> Self {
        self.non_retryable_error_codes.insert(code.into());
        self
    }

    /// Restrict retries to the given kinds
    pub fn with_retryable_kinds(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.retryable_kinds = Some(kinds.into_iter().collect());
        self
    }

    /// Restrict retries to the given severities
    pub fn with_retryable_severities(
        mut self,
        severities: impl IntoIterator<Item = Severity>,
    ) -> Self {
        self.retryable_severities = Some(severities.into_iter().collect());
        self
    }

    pub fn with_custom_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.custom_predicate = Some(predicate);
        self
    }

    /// Set a custom delay function and switch to [`BackoffStrategy::Custom`]
    pub fn with_custom_delay(mut self, delay: DelayFn) -> Self {
        self.custom_delay = Some(delay);
        self.strategy = BackoffStrategy::Custom;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Apply configured overrides on top of this policy
    pub fn with_override(mut self, o: &PolicyOverride) -> Self {
        if let Some(max_attempts) = o.max_attempts {
            self.max_attempts = max_attempts;
        }
        if let Some(base_delay) = o.base_delay {
            self.base_delay = base_delay;
        }
        if let Some(max_delay) = o.max_delay {
            self.max_delay = max_delay;
        }
        self
    }

    /// Check the policy is internally consistent
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.name.trim().is_empty() {
            return Err(ResilienceError::configuration("retry policy name is empty"));
        }
        if self.base_delay > self.max_delay {
            return Err(ResilienceError::configuration(format!(
                "retry policy '{}': base delay {:?} exceeds max delay {:?}",
                self.name, self.base_delay, self.max_delay
            )));
        }
        if let Some(cb) = &self.circuit_breaker {
            if cb.failure_threshold == 0 || cb.success_threshold == 0 {
                return Err(ResilienceError::configuration(format!(
                    "retry policy '{}': circuit breaker thresholds must be positive",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// Partial policy values loaded from configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOverride {
    pub max_attempts: Option<u32>,
    #[serde(default, with = "option_duration_millis")]
    pub base_delay: Option<Duration>,
    #[serde(default, with = "option_duration_millis")]
    pub max_delay: Option<Duration>,
}

impl PolicyOverride {
    pub fn is_empty(&self) -> bool {
        self.max_attempts.is_none() && self.base_delay.is_none() && self.max_delay.is_none()
    }
}

fn normalize_name(name: &str) -> String {
    name.trim()
        .to_ascii_lowercase()
        .replace(['-', ' '], "_")
}

/// Built-in policy templates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyTemplate {
    /// Quick retries for blips expected to clear in under a second
    FastTransient,
    /// General remote API calls
    StandardApi,
    /// Few, widely spaced retries guarded by breaker and budget
    Conservative,
    /// Long-running background work
    Background,
}

impl PolicyTemplate {
    pub const ALL: [PolicyTemplate; 4] = [
        PolicyTemplate::FastTransient,
        PolicyTemplate::StandardApi,
        PolicyTemplate::Conservative,
        PolicyTemplate::Background,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FastTransient => "fast_transient",
            Self::StandardApi => "standard_api",
            Self::Conservative => "conservative",
            Self::Background => "background",
        }
    }

    /// The template's policy
    pub fn policy(&self) -> RetryPolicy {
        match self {
            Self::FastTransient => RetryPolicy::new(self.as_str())
                .with_max_attempts(3)
                .with_base_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_secs(1))
                .with_jitter(JitterMode::Full)
                .with_timeout_per_attempt(Duration::from_secs(5)),
            Self::StandardApi => RetryPolicy::new(self.as_str())
                .with_max_attempts(3)
                .with_base_delay(Duration::from_secs(1))
                .with_max_delay(Duration::from_secs(10))
                .with_jitter(JitterMode::Equal)
                .with_timeout_per_attempt(Duration::from_secs(30))
                .with_circuit_breaker(CircuitBreakerConfig::default()),
            Self::Conservative => RetryPolicy::new(self.as_str())
                .with_max_attempts(5)
                .with_base_delay(Duration::from_secs(2))
                .with_max_delay(Duration::from_secs(60))
                .with_jitter(JitterMode::Decorrelated)
                .with_timeout_per_attempt(Duration::from_secs(60))
                .with_circuit_breaker(
                    CircuitBreakerConfig::default()
                        .with_failure_threshold(3)
                        .with_open_timeout(Duration::from_secs(120)),
                )
                .with_budget(
                    BudgetConfig::default()
                        .with_max_total_attempts(20)
                        .with_max_total_time(Duration::from_secs(300))
                        .with_window(Duration::from_secs(600)),
                ),
            Self::Background => RetryPolicy::new(self.as_str())
                .with_max_attempts(8)
                .with_base_delay(Duration::from_secs(5))
                .with_max_delay(Duration::from_secs(300))
                .with_strategy(BackoffStrategy::Linear)
                .with_jitter(JitterMode::Full)
                .with_budget(
                    BudgetConfig::default()
                        .with_max_total_attempts(50)
                        .with_max_total_time(Duration::from_secs(1800))
                        .with_window(Duration::from_secs(3600)),
                ),
        }
    }
}

impl fmt::Display for PolicyTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyTemplate {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = normalize_name(s);
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == wanted)
            .ok_or_else(|| unknown_name("retry template", s, Self::ALL.map(|t| t.as_str())))
    }
}

/// Services with a dedicated policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    BlobStorage,
    ExternalApi,
    Database,
    MediaProcessing,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 4] = [
        ServiceKind::BlobStorage,
        ServiceKind::ExternalApi,
        ServiceKind::Database,
        ServiceKind::MediaProcessing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BlobStorage => "blob_storage",
            Self::ExternalApi => "external_api",
            Self::Database => "database",
            Self::MediaProcessing => "media_processing",
        }
    }

    /// The service's policy
    pub fn policy(&self) -> RetryPolicy {
        match self {
            Self::BlobStorage => PolicyTemplate::StandardApi
                .policy()
                .with_name(self.as_str())
                .with_max_attempts(4)
                .with_base_delay(Duration::from_millis(500))
                .with_max_delay(Duration::from_secs(8))
                .with_retryable_code("IO_CONNECTIONRESET")
                .with_retryable_code("HTTP_503")
                .with_non_retryable_code("HTTP_404")
                .with_circuit_breaker(
                    CircuitBreakerConfig::default().with_open_timeout(Duration::from_secs(30)),
                ),
            Self::ExternalApi => PolicyTemplate::StandardApi
                .policy()
                .with_name(self.as_str())
                .with_max_delay(Duration::from_secs(30))
                .with_retryable_code("HTTP_429")
                .with_budget(
                    BudgetConfig::default()
                        .with_max_total_attempts(30)
                        .with_max_total_time(Duration::from_secs(600))
                        .with_window(Duration::from_secs(900)),
                ),
            Self::Database => PolicyTemplate::FastTransient
                .policy()
                .with_name(self.as_str())
                .with_base_delay(Duration::from_millis(200))
                .with_max_delay(Duration::from_secs(2))
                .with_retryable_kinds([ErrorKind::Network, ErrorKind::Timeout])
                .with_circuit_breaker(
                    CircuitBreakerConfig::default()
                        .with_failure_threshold(10)
                        .with_success_threshold(3)
                        .with_open_timeout(Duration::from_secs(15)),
                ),
            Self::MediaProcessing => RetryPolicy::new(self.as_str())
                .with_max_attempts(2)
                .with_base_delay(Duration::from_secs(3))
                .with_max_delay(Duration::from_secs(30))
                .with_strategy(BackoffStrategy::Fixed)
                .with_jitter(JitterMode::Equal)
                .with_timeout_per_attempt(Duration::from_secs(120)),
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = normalize_name(s);
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == wanted)
            .ok_or_else(|| unknown_name("service", s, Self::ALL.map(|k| k.as_str())))
    }
}

fn unknown_name<const N: usize>(what: &str, name: &str, valid: [&str; N]) -> ResilienceError {
    ResilienceError::configuration(format!(
        "unknown {what} '{name}', valid names: {}",
        valid.join(", ")
    ))
    .with_code("UNKNOWN_POLICY")
    .with_details(serde_json::json!({ "valid": valid.to_vec() }))
}

/// A policy given inline or by name
#[derive(Debug, Clone)]
pub enum PolicyRef {
    Inline(Box<RetryPolicy>),
    Template(String),
    Service(String),
}

impl From<RetryPolicy> for PolicyRef {
    fn from(policy: RetryPolicy) -> Self {
        Self::Inline(Box::new(policy))
    }
}

impl From<PolicyTemplate> for PolicyRef {
    fn from(template: PolicyTemplate) -> Self {
        Self::Template(template.as_str().to_string())
    }
}

impl From<ServiceKind> for PolicyRef {
    fn from(service: ServiceKind) -> Self {
        Self::Service(service.as_str().to_string())
    }
}

/// Resolves named templates and services to concrete policies
///
/// Built once at startup; configured overrides are applied here so the
/// engine only ever sees finished policies.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    templates: HashMap<PolicyTemplate, RetryPolicy>,
    services: HashMap<ServiceKind, RetryPolicy>,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyRegistry {
    /// Registry holding the built-in policies
    pub fn new() -> Self {
        Self {
            templates: PolicyTemplate::ALL.iter().map(|t| (*t, t.policy())).collect(),
            services: ServiceKind::ALL.iter().map(|s| (*s, s.policy())).collect(),
        }
    }

    /// Registry with per-template overrides applied
    pub fn with_overrides(overrides: &HashMap<PolicyTemplate, PolicyOverride>) -> Self {
        let mut registry = Self::new();
        for (template, o) in overrides {
            if let Some(policy) = registry.templates.remove(template) {
                registry.templates.insert(*template, policy.with_override(o));
            }
        }
        registry
    }

    /// Replace the policy used for a service
    pub fn set_service_policy(&mut self, service: ServiceKind, policy: RetryPolicy) {
        self.services.insert(service, policy);
    }

    pub fn template(&self, template: PolicyTemplate) -> RetryPolicy {
        self.templates
            .get(&template)
            .cloned()
            .unwrap_or_else(|| template.policy())
    }

    pub fn service(&self, service: ServiceKind) -> RetryPolicy {
        self.services
            .get(&service)
            .cloned()
            .unwrap_or_else(|| service.policy())
    }

    /// Resolve a reference, failing fast on unknown names
    pub fn resolve(&self, policy: &PolicyRef) -> Result<RetryPolicy, ResilienceError> {
        let resolved = match policy {
            PolicyRef::Inline(policy) => policy.as_ref().clone(),
            PolicyRef::Template(name) => self.template(name.parse()?),
            PolicyRef::Service(name) => self.service(name.parse()?),
        };
        resolved.validate()?;
        Ok(resolved)
    }
}
