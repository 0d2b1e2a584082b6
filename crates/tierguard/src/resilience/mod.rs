//! Failure handling for remote tiers.
//!
//! - [`classify`]: normalize a raw failure into one of six [`ErrorCategory`] values.
//! - [`retry`]: per-category retry budgets with exponential backoff.
//! - [`breaker`]: per-tier circuit breaker (CLOSED / OPEN / HALF_OPEN).
//! - [`metrics`]: lock-free outcome counters and snapshots.

pub mod breaker;
pub mod classify;
pub mod metrics;
pub mod retry;

pub use breaker::{Admission, BreakerConfig, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use classify::{
    ClassificationRule, ErrorCategory, ErrorClassifier, FailureKind, TierFailure, UnknownCategory,
};
pub use metrics::{MetricsSnapshot, OutcomeMetrics};
pub use retry::{RetryPolicy, RetryPolicyTable};
