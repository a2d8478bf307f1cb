//! Sliding-window usage for a single endpoint

use std::collections::VecDeque;
use std::time::Duration;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::config::EndpointLimits;

const ONE_DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Which quota blocked a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    RequestsPerMinute,
    TokensPerMinute,
    RequestsPerDay,
    TokensPerDay,
    /// The cost alone exceeds a quota, so waiting cannot help
    CostExceedsLimit,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestsPerMinute => "requests_per_minute",
            Self::TokensPerMinute => "tokens_per_minute",
            Self::RequestsPerDay => "requests_per_day",
            Self::TokensPerDay => "tokens_per_day",
            Self::CostExceedsLimit => "cost_exceeds_limit",
        }
    }
}

/// Result of checking a request against an endpoint's quotas
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admit,
    /// Not now; `wait` is the time until enough capacity frees up
    Deny { wait: Duration, reason: DenyReason },
}

impl Admission {
    pub fn is_admit(&self) -> bool {
        matches!(self, Self::Admit)
    }
}

/// Usage counters at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub requests_in_window: u32,
    pub tokens_in_window: u64,
    pub daily_requests: u32,
    pub daily_tokens: u64,
    /// When the oldest in-window entry leaves the window
    pub window_frees_at: Option<Instant>,
    pub daily_resets_at: Instant,
}

/// Request and token timestamps for one endpoint
///
/// Per-minute quotas count entries younger than the window; daily counters
/// roll over at the next local midnight.
#[derive(Debug)]
pub struct EndpointTracker {
    limits: EndpointLimits,
    window: Duration,
    requests: VecDeque<Instant>,
    tokens: VecDeque<(Instant, u64)>,
    daily_requests: u32,
    daily_tokens: u64,
    daily_reset_at: Instant,
}

impl EndpointTracker {
    pub fn new(limits: EndpointLimits, window: Duration) -> Self {
        Self {
            limits,
            window,
            requests: VecDeque::new(),
            tokens: VecDeque::new(),
            daily_requests: 0,
            daily_tokens: 0,
            daily_reset_at: Instant::now() + until_local_midnight(),
        }
    }

    pub fn limits(&self) -> &EndpointLimits {
        &self.limits
    }

    /// Check whether a request costing `cost` tokens fits right now
    ///
    /// Does not change any state.
    pub fn check(&self, cost: u64, now: Instant) -> Admission {
        let limits = &self.limits;

        if (limits.tokens_per_minute > 0 && cost > limits.tokens_per_minute)
            || (limits.tokens_per_day > 0 && cost > limits.tokens_per_day)
        {
            return Admission::Deny {
                wait: Duration::MAX,
                reason: DenyReason::CostExceedsLimit,
            };
        }

        let usage = self.snapshot(now);
        let until_daily_reset = usage.daily_resets_at.saturating_duration_since(now);

        if limits.requests_per_day > 0 && usage.daily_requests >= limits.requests_per_day {
            return Admission::Deny {
                wait: until_daily_reset,
                reason: DenyReason::RequestsPerDay,
            };
        }
        if limits.tokens_per_day > 0 && usage.daily_tokens + cost > limits.tokens_per_day {
            return Admission::Deny {
                wait: until_daily_reset,
                reason: DenyReason::TokensPerDay,
            };
        }

        if limits.requests_per_minute > 0
            && usage.requests_in_window >= limits.requests_per_minute
        {
            // The oldest entries leave first; one free slot is enough
            let excess = (usage.requests_in_window - limits.requests_per_minute) as usize;
            let wait = self
                .live_requests(now)
                .nth(excess)
                .map(|at| self.expires_in(at, now))
                .unwrap_or(Duration::ZERO);
            return Admission::Deny {
                wait,
                reason: DenyReason::RequestsPerMinute,
            };
        }

        if limits.tokens_per_minute > 0 && usage.tokens_in_window + cost > limits.tokens_per_minute
        {
            let mut to_free = usage.tokens_in_window + cost - limits.tokens_per_minute;
            let mut wait = Duration::ZERO;
            for (at, amount) in self.live_tokens(now) {
                wait = self.expires_in(at, now);
                to_free = to_free.saturating_sub(amount);
                if to_free == 0 {
                    break;
                }
            }
            return Admission::Deny {
                wait,
                reason: DenyReason::TokensPerMinute,
            };
        }

        Admission::Admit
    }

    /// Record an admitted request
    pub fn record(&mut self, cost: u64, now: Instant) {
        self.prune(now);
        self.roll_daily(now);

        self.requests.push_back(now);
        if cost > 0 {
            self.tokens.push_back((now, cost));
        }
        self.daily_requests = self.daily_requests.saturating_add(1);
        self.daily_tokens = self.daily_tokens.saturating_add(cost);
    }

    /// Drop entries that have left the window
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        while self
            .requests
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) >= window)
        {
            self.requests.pop_front();
        }
        while self
            .tokens
            .front()
            .is_some_and(|(at, _)| now.saturating_duration_since(*at) >= window)
        {
            self.tokens.pop_front();
        }
    }

    pub fn snapshot(&self, now: Instant) -> UsageSnapshot {
        let (daily_requests, daily_tokens, daily_resets_at) = if now >= self.daily_reset_at {
            (0, 0, self.next_daily_reset(now))
        } else {
            (self.daily_requests, self.daily_tokens, self.daily_reset_at)
        };

        UsageSnapshot {
            requests_in_window: self.live_requests(now).count() as u32,
            tokens_in_window: self.live_tokens(now).map(|(_, amount)| amount).sum(),
            daily_requests,
            daily_tokens,
            window_frees_at: self.live_requests(now).next().map(|at| at + self.window),
            daily_resets_at,
        }
    }

    fn live_requests(&self, now: Instant) -> impl Iterator<Item = Instant> + '_ {
        self.requests
            .iter()
            .copied()
            .filter(move |at| now.saturating_duration_since(*at) < self.window)
    }

    fn live_tokens(&self, now: Instant) -> impl Iterator<Item = (Instant, u64)> + '_ {
        self.tokens
            .iter()
            .copied()
            .filter(move |(at, _)| now.saturating_duration_since(*at) < self.window)
    }

    fn expires_in(&self, at: Instant, now: Instant) -> Duration {
        (at + self.window).saturating_duration_since(now)
    }

    fn roll_daily(&mut self, now: Instant) {
        if now >= self.daily_reset_at {
            self.daily_requests = 0;
            self.daily_tokens = 0;
            self.daily_reset_at = self.next_daily_reset(now);
        }
    }

    fn next_daily_reset(&self, now: Instant) -> Instant {
        let mut next = self.daily_reset_at;
        while next <= now {
            next += ONE_DAY;
        }
        next
    }
}

/// Time until the next local midnight
fn until_local_midnight() -> Duration {
    let now = Local::now();
    now.date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .and_then(|midnight| midnight.and_local_timezone(Local).earliest())
        .and_then(|midnight| (midnight - now).to_std().ok())
        .unwrap_or(ONE_DAY)
}
