//! Admission limits and controller settings

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ResilienceError;
use crate::serde_millis::duration_millis;

/// Quotas for one endpoint, `0` meaning unlimited
///
/// Per-minute quotas apply to the controller's sliding window, daily quotas
/// reset at local midnight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointLimits {
    pub requests_per_minute: u32,
    pub tokens_per_minute: u64,
    pub requests_per_day: u32,
    pub tokens_per_day: u64,
}

impl EndpointLimits {
    pub fn new(
        requests_per_minute: u32,
        tokens_per_minute: u64,
        requests_per_day: u32,
        tokens_per_day: u64,
    ) -> Self {
        Self {
            requests_per_minute,
            tokens_per_minute,
            requests_per_day,
            tokens_per_day,
        }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_requests_per_minute(mut self, limit: u32) -> Self {
        self.requests_per_minute = limit;
        self
    }

    pub fn with_tokens_per_minute(mut self, limit: u64) -> Self {
        self.tokens_per_minute = limit;
        self
    }

    pub fn with_requests_per_day(mut self, limit: u32) -> Self {
        self.requests_per_day = limit;
        self
    }

    pub fn with_tokens_per_day(mut self, limit: u64) -> Self {
        self.tokens_per_day = limit;
        self
    }

    pub fn is_unlimited(&self) -> bool {
        *self == Self::unlimited()
    }
}

impl fmt::Display for EndpointLimits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.requests_per_minute,
            self.tokens_per_minute,
            self.requests_per_day,
            self.tokens_per_day
        )
    }
}

/// Parses `rpm/tpm/rpd/tpd`; trailing fields may be omitted
impl FromStr for EndpointLimits {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split('/').map(str::trim).collect();
        if fields.is_empty() || fields.len() > 4 || fields.iter().any(|f| f.is_empty()) {
            return Err(ResilienceError::configuration(format!(
                "invalid endpoint limits '{s}', expected rpm/tpm/rpd/tpd"
            )));
        }

        let number = |i: usize| -> Result<u64, ResilienceError> {
            match fields.get(i) {
                None => Ok(0),
                Some(raw) => raw.parse::<u64>().map_err(|e| {
                    ResilienceError::configuration(format!(
                        "invalid endpoint limits '{s}': '{raw}' is not a number"
                    ))
                    .with_cause(e)
                }),
            }
        };
        let small = |i: usize| -> Result<u32, ResilienceError> {
            let value = number(i)?;
            u32::try_from(value).map_err(|e| {
                ResilienceError::configuration(format!(
                    "invalid endpoint limits '{s}': {value} is too large"
                ))
                .with_cause(e)
            })
        };

        Ok(Self {
            requests_per_minute: small(0)?,
            tokens_per_minute: number(1)?,
            requests_per_day: small(2)?,
            tokens_per_day: number(3)?,
        })
    }
}

/// Admission controller configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AdmissionConfig {
    /// Sliding window the per-minute quotas apply to
    #[serde(with = "duration_millis")]
    pub window: Duration,

    /// Longest wait a queued request will accept before being rejected
    #[serde(with = "duration_millis")]
    pub max_wait: Duration,

    /// First step of the per-request admission backoff
    #[serde(with = "duration_millis")]
    pub backoff_base: Duration,

    /// Admission retries used when the caller does not choose
    pub default_max_retries: u32,

    /// Limits for endpoints without an explicit entry
    pub default_limits: EndpointLimits,

    /// Per-endpoint limits
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointLimits>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_wait: Duration::from_secs(30),
            backoff_base: Duration::from_millis(500),
            default_max_retries: 3,
            default_limits: EndpointLimits::unlimited(),
            endpoints: HashMap::new(),
        }
    }
}

impl AdmissionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn with_default_max_retries(mut self, retries: u32) -> Self {
        self.default_max_retries = retries;
        self
    }

    pub fn with_default_limits(mut self, limits: EndpointLimits) -> Self {
        self.default_limits = limits;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>, limits: EndpointLimits) -> Self {
        self.endpoints.insert(endpoint.into(), limits);
        self
    }

    pub fn limits_for(&self, endpoint: &str) -> EndpointLimits {
        self.endpoints
            .get(endpoint)
            .copied()
            .unwrap_or(self.default_limits)
    }
}
