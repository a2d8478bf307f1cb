//! Retry decision rules

use tracing::trace;

use super::engine::RetryContext;
use super::policy::RetryPolicy;
use crate::error::{ErrorKind, ResilienceError};

/// Decides whether a failed attempt may be retried
///
/// Rules are applied in order, the first one that decides wins:
///
/// 1. the policy's custom predicate
/// 2. `non_retryable_error_codes`
/// 3. `retryable_error_codes`
/// 4. kind/severity allow-lists (may only refuse)
/// 5. the default heuristic: 4xx is final except timeout and rate-limit
///    statuses; 5xx, network, timeout and unclassified errors are retried
pub struct RetryConditionEvaluator;

impl RetryConditionEvaluator {
    pub fn should_retry(
        error: &ResilienceError,
        attempt: u32,
        policy: &RetryPolicy,
        context: &RetryContext,
    ) -> bool {
        if let Some(predicate) = &policy.custom_predicate {
            return (predicate.0)(error, attempt, context);
        }

        if policy.non_retryable_error_codes.contains(&error.code) {
            trace!(code = %error.code, "Error code is marked non-retryable");
            return false;
        }
        if policy.retryable_error_codes.contains(&error.code) {
            return true;
        }

        if let Some(kinds) = &policy.retryable_kinds {
            if !kinds.contains(&error.kind) {
                return false;
            }
        }
        if let Some(severities) = &policy.retryable_severities {
            if !severities.contains(&error.severity()) {
                return false;
            }
        }

        Self::default_heuristic(error)
    }

    /// Classification used when no policy rule applies
    pub fn default_heuristic(error: &ResilienceError) -> bool {
        // Synthetic errors are final for the call that produced them
        if matches!(
            error.kind,
            ErrorKind::CircuitOpen | ErrorKind::BudgetExhausted | ErrorKind::Aborted
        ) {
            return false;
        }

        match error.status {
            Some(408 | 425 | 429) => true,
            Some(400..=499) => false,
            Some(500..=599) => true,
            _ => error.kind.is_retryable_by_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Severity;
    use crate::reliability::policy::RetryPredicate;

    fn ctx() -> RetryContext {
        RetryContext::new("op", 3)
    }

    fn check(error: &ResilienceError, policy: &RetryPolicy) -> bool {
        RetryConditionEvaluator::should_retry(error, 0, policy, &ctx())
    }

    #[test]
    fn test_default_heuristic() {
        let policy = RetryPolicy::new("p");

        assert!(check(&ResilienceError::from_status(503, "down"), &policy));
        assert!(check(&ResilienceError::from_status(429, "quota"), &policy));
        assert!(check(&ResilienceError::from_status(408, "slow"), &policy));
        assert!(!check(&ResilienceError::from_status(404, "missing"), &policy));
        assert!(!check(&ResilienceError::from_status(400, "bad"), &policy));

        assert!(check(&ResilienceError::network("reset"), &policy));
        assert!(check(&ResilienceError::timeout("slow"), &policy));
        assert!(check(&ResilienceError::unknown("?"), &policy));
        assert!(!check(&ResilienceError::validation("bad"), &policy));
        assert!(!check(&ResilienceError::configuration("no key"), &policy));
        assert!(!check(&ResilienceError::new(ErrorKind::CircuitOpen, "open"), &policy));
    }

    #[test]
    fn test_code_lists_override_heuristic() {
        let policy = RetryPolicy::new("p")
            .with_retryable_code("HTTP_404")
            .with_non_retryable_code("HTTP_503");

        assert!(check(&ResilienceError::from_status(404, "eventually consistent"), &policy));
        assert!(!check(&ResilienceError::from_status(503, "down"), &policy));
    }

    #[test]
    fn test_non_retryable_beats_retryable() {
        let policy = RetryPolicy::new("p")
            .with_retryable_code("FLAKY")
            .with_non_retryable_code("FLAKY");
        let err = ResilienceError::network("x").with_code("FLAKY");
        assert!(!check(&err, &policy));
    }

    #[test]
    fn test_allow_lists_only_refuse() {
        let policy = RetryPolicy::new("p").with_retryable_kinds([ErrorKind::Network]);
        assert!(check(&ResilienceError::network("reset"), &policy));
        assert!(!check(&ResilienceError::server("500"), &policy));

        // Allow-listing a kind does not make it retryable on its own
        let policy = RetryPolicy::new("p").with_retryable_kinds([ErrorKind::Validation]);
        assert!(!check(&ResilienceError::validation("bad"), &policy));

        let policy = RetryPolicy::new("p").with_retryable_severities([Severity::Low]);
        assert!(check(&ResilienceError::timeout("slow"), &policy));
        assert!(!check(&ResilienceError::network("reset"), &policy));
    }

    #[test]
    fn test_custom_predicate_decides_unconditionally() {
        let policy = RetryPolicy::new("p")
            .with_non_retryable_code("HTTP_503")
            .with_custom_predicate(RetryPredicate::new(|err, attempt, _| {
                err.status == Some(503) && attempt < 1
            }));

        let err = ResilienceError::from_status(503, "down");
        assert!(RetryConditionEvaluator::should_retry(&err, 0, &policy, &ctx()));
        assert!(!RetryConditionEvaluator::should_retry(&err, 1, &policy, &ctx()));
    }
}
