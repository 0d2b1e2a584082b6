//! Outcome counters for polling collectors.
//!
//! Every counter is an independent atomic, so writers never block and a
//! snapshot never observes a torn value. Snapshots are consistent per field
//! only: two counters in one snapshot may come from slightly different
//! instants.

use super::breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
use super::classify::ErrorCategory;
use crate::cache::CacheStats;
use crate::types::TierId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Additive counters shared by every concurrent resolve.
#[derive(Debug)]
pub struct OutcomeMetrics {
    total_errors: AtomicU64,
    by_category: [AtomicU64; ErrorCategory::ALL.len()],
    consecutive_failures: AtomicU64,
    successes: [AtomicU64; 3],
    local_fallthroughs: AtomicU64,
    breaker_skips: AtomicU64,
    terminal_failures: AtomicU64,
    breakers: Vec<Arc<CircuitBreaker>>,
}

impl Default for OutcomeMetrics {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl OutcomeMetrics {
    /// Create counters that also report the state of `breakers`. The first
    /// breaker is the one surfaced as `breaker_state`.
    pub fn new(breakers: Vec<Arc<CircuitBreaker>>) -> Self {
        Self {
            total_errors: AtomicU64::new(0),
            by_category: Default::default(),
            consecutive_failures: AtomicU64::new(0),
            successes: Default::default(),
            local_fallthroughs: AtomicU64::new(0),
            breaker_skips: AtomicU64::new(0),
            terminal_failures: AtomicU64::new(0),
            breakers,
        }
    }

    /// Count one failed remote attempt.
    pub fn record_failure(&self, category: ErrorCategory) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        self.by_category[category_index(category)].fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a tier success. A remote success ends the failure streak.
    pub fn record_success(&self, tier: TierId) {
        self.successes[tier_index(tier)].fetch_add(1, Ordering::Relaxed);
        if tier != TierId::Local {
            self.consecutive_failures.store(0, Ordering::Relaxed);
        }
    }

    pub fn record_local_fallthrough(&self) {
        self.local_fallthroughs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_breaker_skip(&self) {
        self.breaker_skips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_terminal_failure(&self) {
        self.terminal_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let tiers: BTreeMap<TierId, BreakerSnapshot> = self
            .breakers
            .iter()
            .map(|b| (b.tier(), b.snapshot()))
            .collect();
        MetricsSnapshot {
            total_errors: load(&self.total_errors),
            rate_limit_errors: load(&self.by_category[category_index(ErrorCategory::RateLimit)]),
            network_errors: load(&self.by_category[category_index(ErrorCategory::NetworkError)]),
            server_errors: load(&self.by_category[category_index(ErrorCategory::ServerError)]),
            auth_errors: load(&self.by_category[category_index(ErrorCategory::AuthError)]),
            bad_request_errors: load(&self.by_category[category_index(ErrorCategory::BadRequest)]),
            unknown_errors: load(&self.by_category[category_index(ErrorCategory::Unknown)]),
            consecutive_failures: load(&self.consecutive_failures),
            breaker_state: self
                .breakers
                .first()
                .map_or(BreakerState::Closed, |b| b.state()),
            tiers,
            successes: [TierId::Local, TierId::Primary, TierId::Secondary]
                .into_iter()
                .map(|t| (t, load(&self.successes[tier_index(t)])))
                .collect(),
            local_fallthroughs: load(&self.local_fallthroughs),
            breaker_skips: load(&self.breaker_skips),
            terminal_failures: load(&self.terminal_failures),
            cache: None,
        }
    }
}

fn category_index(category: ErrorCategory) -> usize {
    match category {
        ErrorCategory::RateLimit => 0,
        ErrorCategory::NetworkError => 1,
        ErrorCategory::ServerError => 2,
        ErrorCategory::AuthError => 3,
        ErrorCategory::BadRequest => 4,
        ErrorCategory::Unknown => 5,
    }
}

fn tier_index(tier: TierId) -> usize {
    match tier {
        TierId::Local => 0,
        TierId::Primary => 1,
        TierId::Secondary => 2,
    }
}

/// Read-only aggregate view of [`OutcomeMetrics`].
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub total_errors: u64,
    pub rate_limit_errors: u64,
    pub network_errors: u64,
    pub server_errors: u64,
    pub auth_errors: u64,
    pub bad_request_errors: u64,
    pub unknown_errors: u64,
    /// Remote attempt failures since the last remote success.
    pub consecutive_failures: u64,
    /// State of the primary remote tier's breaker.
    pub breaker_state: BreakerState,
    /// Breaker state for every remote tier.
    pub tiers: BTreeMap<TierId, BreakerSnapshot>,
    pub successes: BTreeMap<TierId, u64>,
    pub local_fallthroughs: u64,
    pub breaker_skips: u64,
    pub terminal_failures: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
}

impl MetricsSnapshot {
    /// Count for one category.
    pub fn errors_for(&self, category: ErrorCategory) -> u64 {
        match category {
            ErrorCategory::RateLimit => self.rate_limit_errors,
            ErrorCategory::NetworkError => self.network_errors,
            ErrorCategory::ServerError => self.server_errors,
            ErrorCategory::AuthError => self.auth_errors,
            ErrorCategory::BadRequest => self.bad_request_errors,
            ErrorCategory::Unknown => self.unknown_errors,
        }
    }

    pub fn with_cache(mut self, stats: CacheStats) -> Self {
        self.cache = Some(stats);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::breaker::BreakerConfig;

    #[test]
    fn failures_count_per_category() {
        let m = OutcomeMetrics::default();
        m.record_failure(ErrorCategory::RateLimit);
        m.record_failure(ErrorCategory::RateLimit);
        m.record_failure(ErrorCategory::AuthError);
        let snap = m.snapshot();
        assert_eq!(snap.total_errors, 3);
        assert_eq!(snap.errors_for(ErrorCategory::RateLimit), 2);
        assert_eq!(snap.auth_errors, 1);
        assert_eq!(snap.network_errors, 0);
        assert_eq!(snap.consecutive_failures, 3);
    }

    #[test]
    fn remote_success_resets_streak_but_not_totals() {
        let m = OutcomeMetrics::default();
        m.record_failure(ErrorCategory::ServerError);
        m.record_local_fallthrough();
        m.record_success(TierId::Local);
        assert_eq!(m.snapshot().consecutive_failures, 1);

        m.record_success(TierId::Secondary);
        let snap = m.snapshot();
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.total_errors, 1);
        assert_eq!(snap.successes[&TierId::Secondary], 1);
        assert_eq!(snap.successes[&TierId::Primary], 0);
        assert_eq!(snap.local_fallthroughs, 1);
    }

    #[test]
    fn snapshot_reports_breakers() {
        let primary = Arc::new(CircuitBreaker::new(
            TierId::Primary,
            BreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            },
        ));
        let secondary = Arc::new(CircuitBreaker::new(TierId::Secondary, BreakerConfig::default()));
        let m = OutcomeMetrics::new(vec![primary.clone(), secondary]);
        assert_eq!(m.snapshot().breaker_state, BreakerState::Closed);

        primary.record_failure();
        let snap = m.snapshot();
        assert_eq!(snap.breaker_state, BreakerState::Open);
        assert_eq!(snap.tiers[&TierId::Secondary].state, BreakerState::Closed);
        assert_eq!(snap.tiers[&TierId::Primary].trips, 1);
    }

    #[test]
    fn concurrent_writers_lose_no_updates() {
        let m = Arc::new(OutcomeMetrics::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = Arc::clone(&m);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.record_failure(ErrorCategory::NetworkError);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.snapshot().network_errors, 4000);
    }

    #[test]
    fn snapshot_serializes() {
        let json = serde_json::to_value(OutcomeMetrics::default().snapshot()).unwrap();
        assert_eq!(json["breaker_state"], "CLOSED");
        assert_eq!(json["successes"]["primary"], 0);
        assert!(json.get("cache").is_none());
    }
}
