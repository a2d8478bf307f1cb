//! Unified error type for the resilience core
//!
//! Every failure surfaced by the retry engine, circuit breakers, admission
//! controller and worker pool is a [`ResilienceError`]. Callers dispatch on
//! [`ErrorKind`] instead of on concrete types.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Boxed underlying cause
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection refused/reset, DNS failures and similar transient faults
    Network,
    /// An attempt or task exceeded its allotted time
    Timeout,
    /// Quota exceeded on the remote side
    RateLimit,
    /// 5xx-class failure from a remote service
    Server,
    /// 4xx-class failure caused by the request itself
    Client,
    /// Input rejected before any call was made
    Validation,
    /// Missing credentials, unknown policy names, bad settings
    Configuration,
    /// Call blocked by an open circuit breaker
    CircuitOpen,
    /// Retry refused because the retry budget is spent
    BudgetExhausted,
    /// Caller cancelled the operation
    Aborted,
    /// Admission control or a full queue refused the work
    Rejected,
    /// Anything that could not be classified
    Unknown,
}

impl ErrorKind {
    /// All kinds, in declaration order
    pub const ALL: [ErrorKind; 12] = [
        ErrorKind::Network,
        ErrorKind::Timeout,
        ErrorKind::RateLimit,
        ErrorKind::Server,
        ErrorKind::Client,
        ErrorKind::Validation,
        ErrorKind::Configuration,
        ErrorKind::CircuitOpen,
        ErrorKind::BudgetExhausted,
        ErrorKind::Aborted,
        ErrorKind::Rejected,
        ErrorKind::Unknown,
    ];

    /// Whether the default retry heuristic treats this kind as transient
    pub fn is_retryable_by_default(&self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimit | Self::Server | Self::Unknown
        )
    }

    /// Severity used by policy-level severity allow-lists
    pub fn severity(&self) -> Severity {
        match self {
            Self::Timeout | Self::RateLimit | Self::Aborted | Self::Rejected => Severity::Low,
            Self::Network | Self::Server | Self::Unknown => Severity::Medium,
            Self::Client | Self::Validation | Self::CircuitOpen | Self::BudgetExhausted => {
                Severity::High
            }
            Self::Configuration => Severity::Critical,
        }
    }

    /// Stable snake_case name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::RateLimit => "rate_limit",
            Self::Server => "server",
            Self::Client => "client",
            Self::Validation => "validation",
            Self::Configuration => "configuration",
            Self::CircuitOpen => "circuit_open",
            Self::BudgetExhausted => "budget_exhausted",
            Self::Aborted => "aborted",
            Self::Rejected => "rejected",
            Self::Unknown => "unknown",
        }
    }

    fn default_code(&self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::RateLimit => "RATE_LIMIT_EXCEEDED",
            Self::Server => "SERVER_ERROR",
            Self::Client => "CLIENT_ERROR",
            Self::Validation => "VALIDATION_ERROR",
            Self::Configuration => "CONFIGURATION_ERROR",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::BudgetExhausted => "RETRY_BUDGET_EXHAUSTED",
            Self::Aborted => "ABORTED",
            Self::Rejected => "REJECTED",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Error returned by every component of the resilience core
///
/// # Example
///
/// ```
/// use bulwark_resilience::{ErrorKind, ResilienceError};
///
/// let err = ResilienceError::from_status(503, "upstream unavailable");
/// assert_eq!(err.kind, ErrorKind::Server);
/// assert_eq!(err.code, "HTTP_503");
/// ```
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ResilienceError {
    /// Failure classification
    pub kind: ErrorKind,

    /// Human-readable message
    pub message: String,

    /// Machine-readable code, matched by retryable/non-retryable code sets
    pub code: String,

    /// Numeric status (HTTP status for remote failures)
    pub status: Option<u16>,

    /// Structured diagnostic payload
    pub details: Option<serde_json::Value>,

    /// Server-specified or computed wait before trying again
    pub retry_after: Option<Duration>,

    /// Underlying error, if this one wraps another
    #[source]
    pub cause: Option<Cause>,
}

impl ResilienceError {
    /// Create an error of the given kind with the kind's default code
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: kind.default_code().to_string(),
            status: None,
            details: None,
            retry_after: None,
            cause: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, message).with_status(429)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Server, message)
    }

    pub fn client(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Client, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Aborted, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Rejected, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    /// Classify a remote failure by its HTTP status
    ///
    /// 408 and 425 are timeout-class, 429 is rate-limit, other 4xx are
    /// client errors, 5xx are server errors.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            408 | 425 => ErrorKind::Timeout,
            429 => ErrorKind::RateLimit,
            400..=499 => ErrorKind::Client,
            500..=599 => ErrorKind::Server,
            _ => ErrorKind::Unknown,
        };
        let mut err = Self::new(kind, message).with_status(status);
        err.code = format!("HTTP_{status}");
        err
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    /// Set the numeric status
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach structured details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Set the suggested wait before trying again
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Attach the underlying cause
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Severity of this error's kind
    pub fn severity(&self) -> Severity {
        self.kind.severity()
    }

    /// Whether the error came from the remote side rejecting the request itself
    pub fn is_client_error(&self) -> bool {
        matches!(self.status, Some(400..=499))
    }

    /// Compact JSON rendering for logs and API responses
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind,
            "code": self.code,
            "message": self.message,
            "status": self.status,
            "retry_after_ms": self.retry_after.map(|d| d.as_millis() as u64),
            "details": self.details,
        })
    }
}

impl From<std::io::Error> for ResilienceError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;

        let kind = match err.kind() {
            Io::TimedOut => ErrorKind::Timeout,
            Io::ConnectionRefused
            | Io::ConnectionReset
            | Io::ConnectionAborted
            | Io::NotConnected
            | Io::BrokenPipe
            | Io::AddrNotAvailable
            | Io::UnexpectedEof
            | Io::Interrupted => ErrorKind::Network,
            Io::InvalidInput | Io::InvalidData => ErrorKind::Validation,
            Io::PermissionDenied => ErrorKind::Configuration,
            _ => ErrorKind::Unknown,
        };
        let code = format!("IO_{:?}", err.kind()).to_uppercase();
        Self::new(kind, err.to_string())
            .with_code(code)
            .with_cause(err)
    }
}

impl From<anyhow::Error> for ResilienceError {
    fn from(err: anyhow::Error) -> Self {
        Self::unknown(format!("{err:#}"))
    }
}
