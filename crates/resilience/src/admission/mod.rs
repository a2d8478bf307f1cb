//! Admission control for rate-limited endpoints
//!
//! [`AdmissionController`] enforces per-endpoint request and token quotas
//! over a sliding window (plus daily quotas) and parks requests that do not
//! fit in a priority queue. Admission backoff here is independent of any
//! retry policy the caller applies around the admitted operation.

mod config;
mod controller;
mod cost;
mod headers;
mod queue;
mod tracker;

pub use config::{AdmissionConfig, EndpointLimits};
pub use controller::{AdmissionController, AdmissionStatus, EndpointStatus, ADMISSION_REJECTED};
pub use cost::{CostEstimator, DefaultCostEstimator};
pub use headers::{
    RateLimitHeaders, RETRY_AFTER, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use queue::{QueueEntry, QueueInfo, QueuedRequest};
pub use tracker::{Admission, DenyReason, EndpointTracker, UsageSnapshot};
