//! Request cost estimation
//!
//! Cost is measured in tokens, the unit the per-minute and daily token
//! quotas are expressed in.

use std::collections::HashMap;

/// Estimates the token cost of a request before it is admitted
pub trait CostEstimator: Send + Sync {
    fn estimate(&self, endpoint: &str, payload_bytes: usize) -> u64;
}

impl<F> CostEstimator for F
where
    F: Fn(&str, usize) -> u64 + Send + Sync,
{
    fn estimate(&self, endpoint: &str, payload_bytes: usize) -> u64 {
        self(endpoint, payload_bytes)
    }
}

/// Roughly four payload bytes per token, plus a fixed overhead per endpoint
///
/// Overheads are matched by endpoint prefix, longest prefix first.
#[derive(Debug, Clone)]
pub struct DefaultCostEstimator {
    bytes_per_token: u64,
    default_overhead: u64,
    overheads: HashMap<String, u64>,
}

impl Default for DefaultCostEstimator {
    fn default() -> Self {
        Self {
            bytes_per_token: 4,
            default_overhead: 50,
            overheads: HashMap::new(),
        }
    }
}

impl DefaultCostEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bytes_per_token(mut self, bytes: u64) -> Self {
        self.bytes_per_token = bytes.max(1);
        self
    }

    pub fn with_default_overhead(mut self, tokens: u64) -> Self {
        self.default_overhead = tokens;
        self
    }

    /// Fixed overhead for endpoints starting with `prefix`
    pub fn with_overhead(mut self, prefix: impl Into<String>, tokens: u64) -> Self {
        self.overheads.insert(prefix.into(), tokens);
        self
    }

    fn overhead_for(&self, endpoint: &str) -> u64 {
        self.overheads
            .iter()
            .filter(|(prefix, _)| endpoint.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, tokens)| *tokens)
            .unwrap_or(self.default_overhead)
    }
}

impl CostEstimator for DefaultCostEstimator {
    fn estimate(&self, endpoint: &str, payload_bytes: usize) -> u64 {
        (payload_bytes as u64).div_ceil(self.bytes_per_token) + self.overhead_for(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_estimate() {
        let estimator = DefaultCostEstimator::new();
        assert_eq!(estimator.estimate("anything", 0), 50);
        assert_eq!(estimator.estimate("anything", 400), 150);
        assert_eq!(estimator.estimate("anything", 401), 151);
    }

    #[test]
    fn test_longest_prefix_overhead_wins() {
        let estimator = DefaultCostEstimator::new()
            .with_overhead("media", 1000)
            .with_overhead("media/thumbnail", 10);

        assert_eq!(estimator.estimate("media/transcode", 0), 1000);
        assert_eq!(estimator.estimate("media/thumbnail", 8), 12);
        assert_eq!(estimator.estimate("chat", 0), 50);
    }

    #[test]
    fn test_closure_estimator() {
        let flat = |_: &str, _: usize| 7u64;
        assert_eq!(flat.estimate("x", 10_000), 7);
    }
}
