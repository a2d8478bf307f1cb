//! Rate-limit response headers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::controller::EndpointStatus;
use crate::error::ResilienceError;

pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";
pub const RETRY_AFTER: &str = "retry-after";

/// Header values derived from admission state
///
/// `reset` is a Unix timestamp in seconds, `retry_after` a number of
/// seconds. Unlimited endpoints produce no limit headers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset: Option<i64>,
    pub retry_after: Option<u64>,
}

impl RateLimitHeaders {
    /// Headers for an endpoint's per-minute request quota
    pub fn from_status(status: &EndpointStatus, now: DateTime<Utc>) -> Self {
        let limit = status.limits.requests_per_minute;
        if limit == 0 {
            return Self::default();
        }

        Self {
            limit: Some(limit),
            remaining: status.remaining_requests,
            reset: Some(status.window_resets_at.unwrap_or(now).timestamp()),
            retry_after: None,
        }
    }

    /// Headers for a request that was refused
    ///
    /// `Retry-After` is the error's suggested wait rounded up to whole
    /// seconds, at least one. Permanent rejections carry no wait and get no
    /// `Retry-After`.
    pub fn rejected(err: &ResilienceError) -> Self {
        Self {
            retry_after: err
                .retry_after
                .map(|d| d.as_millis().div_ceil(1000).max(1) as u64),
            ..Self::default()
        }
    }

    /// Combine with headers from another source, preferring values set on `self`
    pub fn merge(self, other: Self) -> Self {
        Self {
            limit: self.limit.or(other.limit),
            remaining: self.remaining.or(other.remaining),
            reset: self.reset.or(other.reset),
            retry_after: self.retry_after.or(other.retry_after),
        }
    }

    /// Header name/value pairs for the values that are set
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::with_capacity(4);
        if let Some(limit) = self.limit {
            pairs.push((X_RATELIMIT_LIMIT, limit.to_string()));
        }
        if let Some(remaining) = self.remaining {
            pairs.push((X_RATELIMIT_REMAINING, remaining.to_string()));
        }
        if let Some(reset) = self.reset {
            pairs.push((X_RATELIMIT_RESET, reset.to_string()));
        }
        if let Some(retry_after) = self.retry_after {
            pairs.push((RETRY_AFTER, retry_after.to_string()));
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::admission::{AdmissionConfig, AdmissionController, EndpointLimits};
    use crate::priority::Priority;

    #[tokio::test(start_paused = true)]
    async fn test_headers_track_usage() {
        let limiter = AdmissionController::new(
            AdmissionConfig::default()
                .with_endpoint("chat", EndpointLimits::default().with_requests_per_minute(10)),
        );

        let before = limiter.rate_limit_headers("chat");
        assert_eq!(before.limit, Some(10));
        assert_eq!(before.remaining, Some(10));

        limiter
            .request_permission("chat", 0, Priority::Medium, 0)
            .await
            .unwrap();
        let after = limiter.rate_limit_headers("chat");
        assert_eq!(after.remaining, Some(9));
        assert!(after.reset.unwrap() >= before.reset.unwrap());
        assert!(after.retry_after.is_none());

        assert!(limiter.rate_limit_headers("unlisted").to_pairs().is_empty());
    }

    #[test]
    fn test_rejected_rounds_retry_after_up() {
        let err = ResilienceError::rejected("full").with_retry_after(Duration::from_millis(1200));
        let headers = RateLimitHeaders::rejected(&err);
        assert_eq!(headers.retry_after, Some(2));
        assert_eq!(headers.to_pairs(), vec![(RETRY_AFTER, "2".to_string())]);

        let instant = ResilienceError::rejected("full").with_retry_after(Duration::ZERO);
        assert_eq!(RateLimitHeaders::rejected(&instant).retry_after, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cost_over_limit_has_no_retry_after() {
        let limiter = AdmissionController::new(
            AdmissionConfig::default()
                .with_endpoint("chat", EndpointLimits::default().with_tokens_per_minute(100)),
        );

        let err = limiter
            .request_permission("chat", 500, Priority::Medium, 0)
            .await
            .unwrap_err();
        assert!(err.retry_after.is_none());

        let headers = RateLimitHeaders::rejected(&err);
        assert!(headers.retry_after.is_none());
        assert!(headers.to_pairs().is_empty());
    }

    #[test]
    fn test_merge_prefers_self() {
        let usage = RateLimitHeaders {
            limit: Some(5),
            remaining: Some(0),
            reset: Some(100),
            retry_after: None,
        };
        let merged = RateLimitHeaders::rejected(
            &ResilienceError::rejected("x").with_retry_after(Duration::from_secs(3)),
        )
        .merge(usage);
        assert_eq!(merged.limit, Some(5));
        assert_eq!(merged.retry_after, Some(3));
    }
}
