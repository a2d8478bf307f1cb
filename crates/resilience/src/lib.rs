//! # Resilient Execution Core
//!
//! In-process protection for calls to slow, rate-limited or flaky services.
//!
//! ## Features
//!
//! - **Retries**: Configurable retry policies with backoff, jitter and per-attempt timeouts
//! - **Circuit breakers**: Stop calling a dependency that keeps failing, probe it after a cooldown
//! - **Retry budgets**: Cap the retries and retry time spent on one operation in a rolling window
//! - **Admission control**: Sliding-window request and token quotas with a priority wait queue
//! - **Worker pool**: Auto-scaling pool for background tasks with priorities and timeouts
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        RetryEngine                           │
//! │  (attempt loop: condition ▸ delay ▸ budget ▸ sleep)         │
//! │        │ CircuitBreakerRegistry   │ BudgetRegistry          │
//! └─────────────────────────────────────────────────────────────┘
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   AdmissionController                        │
//! │  (per-endpoint windows, priority queue, drain loop)         │
//! └─────────────────────────────────────────────────────────────┘
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                            │
//! │  (priority queue, workers, auto-scaler, graceful shutdown)  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The three components are independent. An application builds one of each
//! at startup (see [`config::CoreConfig`]) and shares them by cloning.
//!
//! ## Example
//!
//! ```
//! use bulwark_resilience::prelude::*;
//!
//! # let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
//! # rt.block_on(async {
//! let engine = RetryEngine::new();
//! let value = engine
//!     .execute_with_retry(
//!         || async { Ok::<_, ResilienceError>(42) },
//!         PolicyTemplate::FastTransient,
//!         Some("answer"),
//!     )
//!     .await
//!     .unwrap();
//! assert_eq!(value, 42);
//! # });
//! ```

pub mod admission;
pub mod config;
pub mod error;
pub mod priority;
pub mod reliability;
pub mod worker;

mod serde_millis;

/// Prelude for common imports
pub mod prelude {
    pub use crate::admission::{AdmissionConfig, AdmissionController, EndpointLimits};
    pub use crate::config::CoreConfig;
    pub use crate::error::{ErrorKind, ResilienceError, Severity};
    pub use crate::priority::Priority;
    pub use crate::reliability::{
        BackoffStrategy, BudgetConfig, CircuitBreakerConfig, JitterMode, PolicyTemplate,
        RetryEngine, RetryPolicy, ServiceKind,
    };
    pub use crate::worker::{TaskSpec, WorkerPool, WorkerPoolConfig};
}

// Re-export key types at crate root
pub use admission::{AdmissionConfig, AdmissionController};
pub use config::CoreConfig;
pub use error::{ErrorKind, ResilienceError, Severity};
pub use priority::Priority;
pub use reliability::{RetryEngine, RetryPolicy};
pub use worker::{WorkerPool, WorkerPoolConfig};
