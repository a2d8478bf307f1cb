//! Retry budgets
//!
//! A budget caps the total retries (count and time spent waiting) for one
//! (policy, operation) key within a rolling window, independent of the
//! per-call attempt limit.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::serde_millis::duration_millis;

/// Budget configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BudgetConfig {
    /// Maximum retries within one window
    pub max_total_attempts: u32,

    /// Maximum cumulative retry delay within one window
    #[serde(with = "duration_millis")]
    pub max_total_time: Duration,

    /// Window length; usage resets when it elapses
    #[serde(with = "duration_millis")]
    pub window: Duration,

    /// Clear usage as soon as an operation succeeds
    pub reset_on_success: bool,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_total_attempts: 10,
            max_total_time: Duration::from_secs(60),
            window: Duration::from_secs(300),
            reset_on_success: true,
        }
    }
}

impl BudgetConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_total_attempts(mut self, attempts: u32) -> Self {
        self.max_total_attempts = attempts;
        self
    }

    pub fn with_max_total_time(mut self, time: Duration) -> Self {
        self.max_total_time = time;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_reset_on_success(mut self, reset: bool) -> Self {
        self.reset_on_success = reset;
        self
    }
}

/// Usage snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetUsage {
    pub attempts_used: u32,
    #[serde(with = "duration_millis")]
    pub time_used: Duration,
    #[serde(with = "duration_millis")]
    pub window_remaining: Duration,
}

#[derive(Debug)]
struct BudgetState {
    attempts_used: u32,
    time_used: Duration,
    window_start: Instant,
}

/// Tracks retry usage for one key
#[derive(Debug)]
pub struct BudgetTracker {
    key: String,
    config: BudgetConfig,
    state: Mutex<BudgetState>,
}

impl BudgetTracker {
    pub fn new(key: impl Into<String>, config: BudgetConfig) -> Self {
        Self {
            key: key.into(),
            config,
            state: Mutex::new(BudgetState {
                attempts_used: 0,
                time_used: Duration::ZERO,
                window_start: Instant::now(),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Whether one more retry waiting `proposed_delay` fits the budget
    pub fn can_retry(&self, proposed_delay: Duration) -> bool {
        let mut s = self.state.lock();
        self.roll_window(&mut s);
        self.fits(&s, proposed_delay)
    }

    /// Check and charge one retry under a single lock
    ///
    /// Concurrent callers sharing a key can never push usage past the ceiling.
    pub fn try_consume(&self, delay: Duration) -> bool {
        let mut s = self.state.lock();
        self.roll_window(&mut s);
        if !self.fits(&s, delay) {
            return false;
        }
        s.attempts_used = s.attempts_used.saturating_add(1);
        s.time_used = s.time_used.saturating_add(delay);
        true
    }

    fn fits(&self, s: &BudgetState, proposed_delay: Duration) -> bool {
        let attempts_ok = s.attempts_used < self.config.max_total_attempts;
        let time_ok = s.time_used.saturating_add(proposed_delay) <= self.config.max_total_time;

        if !(attempts_ok && time_ok) {
            debug!(
                key = %self.key,
                attempts_used = s.attempts_used,
                time_used_ms = s.time_used.as_millis() as u64,
                proposed_delay_ms = proposed_delay.as_millis() as u64,
                "Retry budget would be exceeded"
            );
        }
        attempts_ok && time_ok
    }

    /// Charge one retry and its delay
    pub fn record_attempt(&self, delay: Duration) {
        let mut s = self.state.lock();
        self.roll_window(&mut s);
        s.attempts_used = s.attempts_used.saturating_add(1);
        s.time_used = s.time_used.saturating_add(delay);
    }

    /// Note a successful operation, clearing usage if configured
    pub fn record_success(&self) {
        if self.config.reset_on_success {
            self.reset();
        }
    }

    pub fn usage(&self) -> BudgetUsage {
        let mut s = self.state.lock();
        self.roll_window(&mut s);
        BudgetUsage {
            attempts_used: s.attempts_used,
            time_used: s.time_used,
            window_remaining: self.config.window.saturating_sub(s.window_start.elapsed()),
        }
    }

    pub fn reset(&self) {
        let mut s = self.state.lock();
        s.attempts_used = 0;
        s.time_used = Duration::ZERO;
        s.window_start = Instant::now();
    }

    fn roll_window(&self, s: &mut BudgetState) {
        if s.window_start.elapsed() >= self.config.window {
            s.attempts_used = 0;
            s.time_used = Duration::ZERO;
            s.window_start = Instant::now();
        }
    }
}

/// Process-local registry of budget trackers keyed by (policy name, operation id)
#[derive(Debug, Default)]
pub struct BudgetRegistry {
    trackers: DashMap<String, Arc<BudgetTracker>>,
}

impl BudgetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(
        &self,
        policy_name: &str,
        operation_id: &str,
        config: &BudgetConfig,
    ) -> Arc<BudgetTracker> {
        let key = format!("{policy_name}:{operation_id}");
        self.trackers
            .entry(key.clone())
            .or_insert_with(|| Arc::new(BudgetTracker::new(key, config.clone())))
            .clone()
    }

    pub fn get(&self, key: &str) -> Option<Arc<BudgetTracker>> {
        self.trackers.get(key).map(|t| Arc::clone(t.value()))
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(attempts: u32, time: Duration) -> BudgetTracker {
        BudgetTracker::new(
            "svc:op",
            BudgetConfig::default()
                .with_max_total_attempts(attempts)
                .with_max_total_time(time)
                .with_window(Duration::from_secs(60)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_ceiling() {
        let t = tracker(2, Duration::from_secs(100));

        assert!(t.can_retry(Duration::from_millis(10)));
        t.record_attempt(Duration::from_millis(10));
        assert!(t.can_retry(Duration::from_millis(10)));
        t.record_attempt(Duration::from_millis(10));
        assert!(!t.can_retry(Duration::from_millis(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_ceiling_includes_proposed_delay() {
        let t = tracker(100, Duration::from_secs(5));

        t.record_attempt(Duration::from_secs(4));
        assert!(t.can_retry(Duration::from_secs(1)));
        assert!(!t.can_retry(Duration::from_millis(1001)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_rolls_over() {
        let t = tracker(1, Duration::from_secs(100));
        t.record_attempt(Duration::ZERO);
        assert!(!t.can_retry(Duration::ZERO));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(t.can_retry(Duration::ZERO));
        assert_eq!(t.usage().attempts_used, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_on_success() {
        let t = tracker(1, Duration::from_secs(100));
        t.record_attempt(Duration::from_secs(1));
        t.record_success();
        assert_eq!(t.usage().attempts_used, 0);

        let keep = BudgetTracker::new(
            "svc:keep",
            BudgetConfig::default()
                .with_max_total_attempts(1)
                .with_reset_on_success(false),
        );
        keep.record_attempt(Duration::ZERO);
        keep.record_success();
        assert_eq!(keep.usage().attempts_used, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_usage_snapshot() {
        let t = tracker(5, Duration::from_secs(100));
        t.record_attempt(Duration::from_millis(1500));
        tokio::time::advance(Duration::from_secs(20)).await;

        let usage = t.usage();
        assert_eq!(usage.attempts_used, 1);
        assert_eq!(usage.time_used, Duration::from_millis(1500));
        assert_eq!(usage.window_remaining, Duration::from_secs(40));
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_consume_charges_only_when_it_fits() {
        let t = tracker(2, Duration::from_secs(3));

        assert!(t.try_consume(Duration::from_secs(2)));
        assert!(!t.try_consume(Duration::from_secs(2)));
        assert_eq!(t.usage().attempts_used, 1);
        assert!(t.try_consume(Duration::from_secs(1)));
        assert!(!t.try_consume(Duration::ZERO));
        assert_eq!(t.usage().time_used, Duration::from_secs(3));
    }

    #[test]
    fn test_try_consume_is_atomic_across_threads() {
        let t = Arc::new(BudgetTracker::new(
            "svc:shared",
            BudgetConfig::default()
                .with_max_total_attempts(1)
                .with_max_total_time(Duration::from_secs(100)),
        ));
        let barrier = Arc::new(std::sync::Barrier::new(8));

        let granted: usize = (0..8)
            .map(|_| {
                let t = Arc::clone(&t);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    t.try_consume(Duration::ZERO)
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();

        assert_eq!(granted, 1);
        assert_eq!(t.usage().attempts_used, 1);
    }

    #[test]
    fn test_registry_shares_trackers() {
        let registry = BudgetRegistry::new();
        let config = BudgetConfig::default();
        let a = registry.get_or_create("p", "op", &config);
        let b = registry.get_or_create("p", "op", &config);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.key(), "p:op");
    }
}
