//! Backoff delay calculation
//!
//! Pure functions: given the attempt number, strategy and jitter mode they
//! produce the wait before the next attempt. Randomness is injected so the
//! result is deterministic under a seeded generator.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::engine::RetryContext;
use super::policy::RetryPolicy;

/// How the base delay grows with the attempt number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base * 2^attempt`
    #[default]
    Exponential,
    /// `base * (attempt + 1)`
    Linear,
    /// `base`
    Fixed,
    /// Policy-supplied function, exponential when none is set
    Custom,
}

/// Randomisation applied to the base delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterMode {
    /// Use the base delay as is
    None,
    /// Uniform in `[0, delay]`
    #[default]
    Full,
    /// `delay/2 + uniform(0, delay/2)`
    Equal,
    /// `delay/2^attempt + uniform(0, delay)`
    Decorrelated,
}

/// Custom delay function: `(attempt, base_delay, context) -> delay`
#[derive(Clone)]
pub struct DelayFn(pub Arc<dyn Fn(u32, Duration, &RetryContext) -> Duration + Send + Sync>);

impl DelayFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(u32, Duration, &RetryContext) -> Duration + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for DelayFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DelayFn(..)")
    }
}

/// Computes retry delays for a [`RetryPolicy`]
pub struct DelayCalculator;

impl DelayCalculator {
    /// Delay before the retry that follows `attempt` (0-based)
    pub fn calculate_delay(attempt: u32, policy: &RetryPolicy, context: &RetryContext) -> Duration {
        Self::calculate_delay_with_rng(attempt, policy, context, &mut rand::thread_rng())
    }

    /// Same as [`calculate_delay`](Self::calculate_delay) with an explicit random source
    pub fn calculate_delay_with_rng<R: Rng + ?Sized>(
        attempt: u32,
        policy: &RetryPolicy,
        context: &RetryContext,
        rng: &mut R,
    ) -> Duration {
        let base = match (policy.strategy, &policy.custom_delay) {
            (BackoffStrategy::Custom, Some(custom)) => {
                millis_f64((custom.0)(attempt, policy.base_delay, context))
            }
            (strategy, _) => strategy_millis(strategy, attempt, policy.base_delay),
        };

        finish(base, policy.jitter, attempt, policy.max_delay, rng)
    }
}

/// Strategy/jitter computation without a policy or context
///
/// Used by layers that back off on their own schedule (admission queue
/// items) and share only the arithmetic with the retry engine.
pub fn backoff_delay<R: Rng + ?Sized>(
    strategy: BackoffStrategy,
    jitter: JitterMode,
    attempt: u32,
    base_delay: Duration,
    max_delay: Duration,
    rng: &mut R,
) -> Duration {
    let base = strategy_millis(strategy, attempt, base_delay);
    finish(base, jitter, attempt, max_delay, rng)
}

fn strategy_millis(strategy: BackoffStrategy, attempt: u32, base_delay: Duration) -> f64 {
    let base = millis_f64(base_delay);
    match strategy {
        BackoffStrategy::Exponential | BackoffStrategy::Custom => {
            base * 2f64.powi(attempt.min(1023) as i32)
        }
        BackoffStrategy::Linear => base * (attempt as f64 + 1.0),
        BackoffStrategy::Fixed => base,
    }
}

fn finish<R: Rng + ?Sized>(
    delay_ms: f64,
    jitter: JitterMode,
    attempt: u32,
    max_delay: Duration,
    rng: &mut R,
) -> Duration {
    let max_ms = millis_f64(max_delay);
    // Keep the jitter arithmetic finite for very large attempt numbers
    let delay_ms = if delay_ms.is_finite() {
        delay_ms.min(f64::MAX / 4.0)
    } else {
        f64::MAX / 4.0
    };

    let jittered = match jitter {
        JitterMode::None => delay_ms,
        JitterMode::Full => uniform(rng, delay_ms),
        JitterMode::Equal => delay_ms / 2.0 + uniform(rng, delay_ms / 2.0),
        JitterMode::Decorrelated => {
            delay_ms / 2f64.powi(attempt.min(1023) as i32) + uniform(rng, delay_ms)
        }
    };

    Duration::from_millis(jittered.clamp(0.0, max_ms) as u64)
}

fn uniform<R: Rng + ?Sized>(rng: &mut R, upper: f64) -> f64 {
    if upper <= 0.0 {
        0.0
    } else {
        rng.gen_range(0.0..=upper)
    }
}

fn millis_f64(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn policy(strategy: BackoffStrategy, jitter: JitterMode) -> RetryPolicy {
        RetryPolicy::new("test")
            .with_strategy(strategy)
            .with_jitter(jitter)
            .with_base_delay(Duration::from_millis(1000))
            .with_max_delay(Duration::from_secs(30))
    }

    fn ctx() -> RetryContext {
        RetryContext::new("op", 5)
    }

    #[test]
    fn test_exponential_without_jitter() {
        let p = policy(BackoffStrategy::Exponential, JitterMode::None);
        assert_eq!(DelayCalculator::calculate_delay(0, &p, &ctx()), Duration::from_millis(1000));
        assert_eq!(DelayCalculator::calculate_delay(1, &p, &ctx()), Duration::from_millis(2000));
        assert_eq!(DelayCalculator::calculate_delay(2, &p, &ctx()), Duration::from_millis(4000));
    }

    #[test]
    fn test_linear_and_fixed() {
        let linear = policy(BackoffStrategy::Linear, JitterMode::None);
        assert_eq!(DelayCalculator::calculate_delay(2, &linear, &ctx()), Duration::from_millis(3000));

        let fixed = policy(BackoffStrategy::Fixed, JitterMode::None);
        assert_eq!(DelayCalculator::calculate_delay(7, &fixed, &ctx()), Duration::from_millis(1000));
    }

    #[test]
    fn test_clamped_to_max_delay() {
        let p = policy(BackoffStrategy::Exponential, JitterMode::None)
            .with_max_delay(Duration::from_millis(2500));
        assert_eq!(DelayCalculator::calculate_delay(2, &p, &ctx()), Duration::from_millis(2500));
        assert_eq!(DelayCalculator::calculate_delay(200, &p, &ctx()), Duration::from_millis(2500));
        assert_eq!(
            DelayCalculator::calculate_delay(u32::MAX, &p, &ctx()),
            Duration::from_millis(2500)
        );
    }

    #[test]
    fn test_custom_strategy() {
        let p = policy(BackoffStrategy::Custom, JitterMode::None).with_custom_delay(DelayFn::new(
            |attempt, base, _ctx| base / 10 * (attempt + 1),
        ));
        assert_eq!(DelayCalculator::calculate_delay(4, &p, &ctx()), Duration::from_millis(500));

        // Falls back to exponential without a function
        let fallback = policy(BackoffStrategy::Custom, JitterMode::None);
        assert_eq!(
            DelayCalculator::calculate_delay(1, &fallback, &ctx()),
            Duration::from_millis(2000)
        );
    }

    #[test]
    fn test_jitter_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        for jitter in [JitterMode::Full, JitterMode::Equal, JitterMode::Decorrelated] {
            let p = policy(BackoffStrategy::Exponential, jitter);
            for attempt in 0..12 {
                let d = DelayCalculator::calculate_delay_with_rng(attempt, &p, &ctx(), &mut rng);
                assert!(d <= p.max_delay, "{jitter:?} attempt {attempt} gave {d:?}");
            }
        }

        let equal = policy(BackoffStrategy::Fixed, JitterMode::Equal);
        for _ in 0..50 {
            let d = DelayCalculator::calculate_delay_with_rng(0, &equal, &ctx(), &mut rng);
            assert!(d >= Duration::from_millis(500) && d <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_decorrelated_floor() {
        let mut rng = StdRng::seed_from_u64(42);
        let p = policy(BackoffStrategy::Exponential, JitterMode::Decorrelated);
        // delay/2^attempt is the base delay for exponential growth
        for attempt in 0..4 {
            let d = DelayCalculator::calculate_delay_with_rng(attempt, &p, &ctx(), &mut rng);
            assert!(d >= Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_seeded_rng_is_deterministic() {
        let p = policy(BackoffStrategy::Exponential, JitterMode::Full);
        let a = DelayCalculator::calculate_delay_with_rng(3, &p, &ctx(), &mut StdRng::seed_from_u64(1));
        let b = DelayCalculator::calculate_delay_with_rng(3, &p, &ctx(), &mut StdRng::seed_from_u64(1));
        assert_eq!(a, b);
    }

    #[test]
    fn test_backoff_delay_helper() {
        let mut rng = StdRng::seed_from_u64(3);
        let d = backoff_delay(
            BackoffStrategy::Exponential,
            JitterMode::None,
            3,
            Duration::from_millis(500),
            Duration::from_secs(30),
            &mut rng,
        );
        assert_eq!(d, Duration::from_millis(4000));
    }
}
