//! Per-category retry policies with exponential backoff.
//!
//! Each [`ErrorCategory`] maps to one [`RetryPolicy`]. Transient categories
//! (rate limits, network and server errors) are retried with a delay of
//! `base_delay * 2^attempt`; auth and bad-request failures are never retried.
//! There is no delay ceiling: `max_attempts` bounds the total wait.

use super::classify::ErrorCategory;
use std::collections::BTreeMap;
use std::time::Duration;

/// Growth factor between successive retry delays.
pub const BACKOFF_MULTIPLIER: u32 = 2;

/// Retry behavior for one error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first call (0 = fail immediately).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    pub retryable: bool,
}

impl RetryPolicy {
    /// A retryable policy.
    pub const fn retry(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            retryable: true,
        }
    }

    /// A policy that never retries.
    pub const fn never() -> Self {
        Self {
            max_attempts: 0,
            base_delay: Duration::ZERO,
            retryable: false,
        }
    }

    /// Enforce `retryable == false ⇒ max_attempts == 0`.
    pub fn normalized(self) -> Self {
        if self.retryable { self } else { Self::never() }
    }

    /// Whether another retry may follow the failure at `attempt` (0-indexed).
    pub fn allows_retry(&self, attempt: u32) -> bool {
        self.retryable && attempt < self.max_attempts
    }

    /// Delay before retrying after the failure at `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = BACKOFF_MULTIPLIER.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor)
    }
}

/// Category → policy mapping. Read-only once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicyTable {
    policies: BTreeMap<ErrorCategory, RetryPolicy>,
}

impl Default for RetryPolicyTable {
    fn default() -> Self {
        let policies = BTreeMap::from([
            (
                ErrorCategory::RateLimit,
                RetryPolicy::retry(3, Duration::from_secs(60)),
            ),
            (
                ErrorCategory::NetworkError,
                RetryPolicy::retry(5, Duration::from_secs(1)),
            ),
            (
                ErrorCategory::ServerError,
                RetryPolicy::retry(3, Duration::from_secs(2)),
            ),
            (ErrorCategory::AuthError, RetryPolicy::never()),
            (ErrorCategory::BadRequest, RetryPolicy::never()),
            (
                ErrorCategory::Unknown,
                RetryPolicy::retry(1, Duration::from_secs(5)),
            ),
        ]);
        Self { policies }
    }
}

impl RetryPolicyTable {
    /// A table with no entries; every lookup uses the built-in `unknown` policy.
    pub fn empty() -> Self {
        Self {
            policies: BTreeMap::new(),
        }
    }

    /// Replace the policy for one category. Categories that are never
    /// retryable keep [`RetryPolicy::never`] whatever is passed.
    pub fn with_policy(mut self, category: ErrorCategory, policy: RetryPolicy) -> Self {
        let policy = if category.is_retryable() {
            policy.normalized()
        } else {
            RetryPolicy::never()
        };
        self.policies.insert(category, policy);
        self
    }

    /// The policy for `category`, falling back to the `unknown` entry.
    pub fn policy_for(&self, category: ErrorCategory) -> RetryPolicy {
        if !category.is_retryable() {
            return RetryPolicy::never();
        }
        self.policies
            .get(&category)
            .or_else(|| self.policies.get(&ErrorCategory::Unknown))
            .copied()
            .unwrap_or(RetryPolicy::retry(1, Duration::from_secs(5)))
    }

    /// Iterate over configured entries in category order.
    pub fn iter(&self) -> impl Iterator<Item = (ErrorCategory, RetryPolicy)> + '_ {
        self.policies.iter().map(|(c, p)| (*c, *p))
    }
}
