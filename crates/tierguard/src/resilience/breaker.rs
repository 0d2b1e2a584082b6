//! Per-tier circuit breaker.
//!
//! ```text
//! CLOSED ──[failure_threshold consecutive failures]──► OPEN
//!    ▲                                                  │
//!    │                               [cool_down since last failure,
//!    │                                checked on the next allow()]
//!    │                                                  ▼
//!    └──[success_threshold successes]──────────── HALF_OPEN
//!                                                       │
//!                                      [any failure] ───┘──► OPEN
//! ```
//!
//! All state lives in one [`BreakerCore`] value. Every change goes through
//! [`BreakerCore::transition`], a pure `(state, event) -> state` function;
//! [`CircuitBreaker`] only serializes access to it behind a mutex, so the
//! trip decision is always made from a single consistent failure count.
//!
//! HALF_OPEN admits one probe at a time: `admit()` returns
//! [`Admission::Probe`] once and then [`Admission::Refused`] until that
//! probe's outcome is recorded or the probe is released. Each probe carries
//! a sequence number so a release only ever frees the probe it names.

use crate::types::TierId;
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 10;
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 3;
pub const DEFAULT_COOL_DOWN: Duration = Duration::from_secs(60);

/// Breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures that trip a CLOSED breaker.
    pub failure_threshold: u32,
    /// Consecutive HALF_OPEN successes that close it again.
    pub success_threshold: u32,
    /// Time since the last failure before an OPEN breaker may probe.
    pub cool_down: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            cool_down: DEFAULT_COOL_DOWN,
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "CLOSED"),
            BreakerState::Open => write!(f, "OPEN"),
            BreakerState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    /// A caller asks whether it may attempt a call.
    Query { now: Instant },
    Success,
    Failure { now: Instant },
    /// Probe `seq` ended with no outcome, e.g. it was cancelled.
    Release { seq: u64 },
}

/// What a query was granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Refused,
    /// An ordinary call through a CLOSED breaker.
    Normal,
    /// The single HALF_OPEN trial call, numbered by `seq`.
    Probe { seq: u64 },
}

impl Admission {
    pub fn is_admitted(self) -> bool {
        !matches!(self, Admission::Refused)
    }
}

/// Complete breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerCore {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    pub last_failure_at: Option<Instant>,
    pub probe_in_flight: bool,
    /// Sequence number of the most recently admitted probe.
    pub probe_seq: u64,
    /// Number of CLOSED → OPEN transitions so far.
    pub trips: u64,
}

impl Default for BreakerCore {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            last_failure_at: None,
            probe_in_flight: false,
            probe_seq: 0,
            trips: 0,
        }
    }
}

impl BreakerCore {
    /// Apply one event.
    pub fn transition(self, event: BreakerEvent, config: &BreakerConfig) -> BreakerCore {
        use BreakerState::*;
        match (self.state, event) {
            (Closed, BreakerEvent::Query { .. }) => self,
            (Open, BreakerEvent::Query { now }) => {
                let cooled = self
                    .last_failure_at
                    .is_none_or(|t| now.saturating_duration_since(t) >= config.cool_down);
                if cooled {
                    BreakerCore {
                        state: HalfOpen,
                        half_open_successes: 0,
                        probe_in_flight: true,
                        probe_seq: self.probe_seq + 1,
                        ..self
                    }
                } else {
                    self
                }
            }
            (HalfOpen, BreakerEvent::Query { .. }) if self.probe_in_flight => self,
            (HalfOpen, BreakerEvent::Query { .. }) => BreakerCore {
                probe_in_flight: true,
                probe_seq: self.probe_seq + 1,
                ..self
            },

            (Closed, BreakerEvent::Success) => BreakerCore {
                consecutive_failures: 0,
                ..self
            },
            (HalfOpen, BreakerEvent::Success) => {
                let successes = self.half_open_successes.saturating_add(1);
                if successes >= config.success_threshold {
                    BreakerCore {
                        state: Closed,
                        consecutive_failures: 0,
                        half_open_successes: 0,
                        probe_in_flight: false,
                        ..self
                    }
                } else {
                    BreakerCore {
                        half_open_successes: successes,
                        probe_in_flight: false,
                        ..self
                    }
                }
            }
            (Open, BreakerEvent::Success) => self,

            (HalfOpen, BreakerEvent::Release { seq })
                if self.probe_in_flight && seq == self.probe_seq =>
            {
                BreakerCore {
                    probe_in_flight: false,
                    ..self
                }
            }
            (_, BreakerEvent::Release { .. }) => self,

            (Closed, BreakerEvent::Failure { now }) => {
                let failures = self.consecutive_failures.saturating_add(1);
                let tripped = failures >= config.failure_threshold;
                BreakerCore {
                    state: if tripped { Open } else { Closed },
                    consecutive_failures: failures,
                    last_failure_at: Some(now),
                    trips: self.trips + u64::from(tripped),
                    ..self
                }
            }
            (HalfOpen | Open, BreakerEvent::Failure { now }) => BreakerCore {
                state: Open,
                consecutive_failures: self.consecutive_failures.saturating_add(1),
                half_open_successes: 0,
                last_failure_at: Some(now),
                probe_in_flight: false,
                ..self
            },
        }
    }

    /// What the query that moved `before` to `self` was granted.
    pub fn admission(&self, before: &BreakerCore) -> Admission {
        match self.state {
            BreakerState::Closed => Admission::Normal,
            BreakerState::HalfOpen if self.probe_seq != before.probe_seq => Admission::Probe {
                seq: self.probe_seq,
            },
            BreakerState::HalfOpen | BreakerState::Open => Admission::Refused,
        }
    }
}

/// Point-in-time view of one breaker.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub trips: u64,
}

/// Thread-safe circuit breaker for one tier.
#[derive(Debug)]
pub struct CircuitBreaker {
    tier: TierId,
    config: BreakerConfig,
    core: Mutex<BreakerCore>,
}

impl CircuitBreaker {
    pub fn new(tier: TierId, config: BreakerConfig) -> Self {
        let config = BreakerConfig {
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            ..config
        };
        Self {
            tier,
            config,
            core: Mutex::new(BreakerCore::default()),
        }
    }

    pub fn tier(&self) -> TierId {
        self.tier
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Whether a call may be attempted now. May move OPEN → HALF_OPEN.
    pub fn allow(&self) -> bool {
        self.admit().is_admitted()
    }

    pub fn allow_at(&self, now: Instant) -> bool {
        self.admit_at(now).is_admitted()
    }

    /// Ask to attempt a call now. Hold on to the result: a cancelled call
    /// hands it back through [`release`](Self::release).
    pub fn admit(&self) -> Admission {
        self.admit_at(Instant::now())
    }

    pub fn admit_at(&self, now: Instant) -> Admission {
        let (before, after) = self.apply(BreakerEvent::Query { now });
        if before.state == BreakerState::Open && after.state == BreakerState::HalfOpen {
            info!(tier = %self.tier, "circuit half-open, admitting probe");
        }
        after.admission(&before)
    }

    pub fn record_success(&self) {
        let (before, after) = self.apply(BreakerEvent::Success);
        if before.state == BreakerState::HalfOpen && after.state == BreakerState::Closed {
            info!(tier = %self.tier, "circuit closed after recovery");
        }
    }

    /// Give back an admission whose call never produced an outcome. Only a
    /// probe that is still the one in flight is freed; anything else is a
    /// no-op.
    pub fn release(&self, admission: Admission) {
        if let Admission::Probe { seq } = admission {
            self.apply(BreakerEvent::Release { seq });
        }
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&self, now: Instant) {
        let (before, after) = self.apply(BreakerEvent::Failure { now });
        if before.state != BreakerState::Open && after.state == BreakerState::Open {
            warn!(
                tier = %self.tier,
                failures = after.consecutive_failures,
                from = %before.state,
                "circuit opened"
            );
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let core = *self.lock();
        BreakerSnapshot {
            state: core.state,
            consecutive_failures: core.consecutive_failures,
            trips: core.trips,
        }
    }

    fn apply(&self, event: BreakerEvent) -> (BreakerCore, BreakerCore) {
        let mut core = self.lock();
        let before = *core;
        *core = before.transition(event, &self.config);
        (before, *core)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerCore> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(TierId::Primary, BreakerConfig::default())
    }

    fn trip(b: &CircuitBreaker, at: Instant) {
        for _ in 0..DEFAULT_FAILURE_THRESHOLD {
            b.record_failure_at(at);
        }
    }

    #[test]
    fn starts_closed_and_allows() {
        let b = breaker();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.allow());
    }

    #[test]
    fn trips_exactly_once_at_threshold() {
        let b = breaker();
        let now = Instant::now();
        for i in 1..DEFAULT_FAILURE_THRESHOLD {
            b.record_failure_at(now);
            assert_eq!(b.state(), BreakerState::Closed, "failure {i}");
        }
        b.record_failure_at(now);
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow_at(now));

        for _ in 0..5 {
            b.record_failure_at(now);
        }
        assert_eq!(b.snapshot().trips, 1);
    }

    #[test]
    fn success_resets_closed_failure_count() {
        let b = breaker();
        let now = Instant::now();
        for _ in 0..9 {
            b.record_failure_at(now);
        }
        b.record_success();
        assert_eq!(b.snapshot().consecutive_failures, 0);
        b.record_failure_at(now);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn open_blocks_until_cool_down_then_admits_one_probe() {
        let b = breaker();
        let t0 = Instant::now();
        trip(&b, t0);

        assert!(!b.allow_at(t0 + Duration::from_secs(59)));
        assert_eq!(b.state(), BreakerState::Open);

        assert!(b.allow_at(t0 + Duration::from_secs(60)));
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(!b.allow_at(t0 + Duration::from_secs(61)));
    }

    #[test]
    fn half_open_closes_after_three_successes() {
        let b = breaker();
        let t0 = Instant::now();
        trip(&b, t0);
        let later = t0 + DEFAULT_COOL_DOWN;

        for i in 0..DEFAULT_SUCCESS_THRESHOLD {
            assert!(b.allow_at(later), "probe {i}");
            assert_eq!(b.state(), BreakerState::HalfOpen);
            b.record_success();
        }
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.snapshot().consecutive_failures, 0);
        assert!(b.allow_at(later));
    }

    #[test]
    fn half_open_failure_reopens_without_reset() {
        let b = breaker();
        let t0 = Instant::now();
        trip(&b, t0);
        let probe_at = t0 + DEFAULT_COOL_DOWN;
        assert!(b.allow_at(probe_at));
        b.record_success();
        assert!(b.allow_at(probe_at));
        b.record_failure_at(probe_at);

        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.snapshot().consecutive_failures, DEFAULT_FAILURE_THRESHOLD + 1);
        // Cool-down restarts from the probe failure.
        assert!(!b.allow_at(probe_at + Duration::from_secs(30)));
        assert!(b.allow_at(probe_at + DEFAULT_COOL_DOWN));
    }

    #[test]
    fn straggling_success_keeps_breaker_open() {
        let b = breaker();
        let t0 = Instant::now();
        trip(&b, t0);
        b.record_success();
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn released_probe_can_be_retaken() {
        let b = breaker();
        let t0 = Instant::now();
        trip(&b, t0);
        let later = t0 + DEFAULT_COOL_DOWN;
        let probe = b.admit_at(later);
        assert!(matches!(probe, Admission::Probe { .. }));
        assert_eq!(b.admit_at(later), Admission::Refused);
        b.release(probe);
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(matches!(b.admit_at(later), Admission::Probe { .. }));
    }

    #[test]
    fn releasing_a_closed_era_admission_keeps_the_probe_held() {
        let b = CircuitBreaker::new(
            TierId::Primary,
            BreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            },
        );
        let t0 = Instant::now();
        let normal = b.admit_at(t0);
        assert_eq!(normal, Admission::Normal);
        b.record_failure_at(t0);
        assert_eq!(b.state(), BreakerState::Open);

        let later = t0 + DEFAULT_COOL_DOWN;
        assert!(matches!(b.admit_at(later), Admission::Probe { .. }));
        b.release(normal);
        assert_eq!(b.admit_at(later), Admission::Refused);
    }

    #[test]
    fn stale_probe_release_does_not_free_a_newer_probe() {
        let b = breaker();
        let t0 = Instant::now();
        trip(&b, t0);
        let first_at = t0 + DEFAULT_COOL_DOWN;
        let first = b.admit_at(first_at);
        b.record_failure_at(first_at);
        assert_eq!(b.state(), BreakerState::Open);

        let second_at = first_at + DEFAULT_COOL_DOWN;
        let second = b.admit_at(second_at);
        assert!(matches!(second, Admission::Probe { .. }));
        assert_ne!(first, second);
        b.release(first);
        assert_eq!(b.admit_at(second_at), Admission::Refused);
        b.release(second);
        assert!(b.allow_at(second_at));
    }

    #[test]
    fn transition_is_pure() {
        let config = BreakerConfig {
            failure_threshold: 2,
            ..Default::default()
        };
        let now = Instant::now();
        let start = BreakerCore::default();
        let once = start.transition(BreakerEvent::Failure { now }, &config);
        let twice = once.transition(BreakerEvent::Failure { now }, &config);
        assert_eq!(start, BreakerCore::default());
        assert_eq!(once.state, BreakerState::Closed);
        assert_eq!(twice.state, BreakerState::Open);
        assert_eq!(twice.trips, 1);
        assert_eq!(twice.admission(&once), Admission::Refused);
    }

    #[test]
    fn concurrent_failures_trip_once_and_lose_nothing() {
        let b = Arc::new(CircuitBreaker::new(
            TierId::Secondary,
            BreakerConfig {
                failure_threshold: 100,
                ..Default::default()
            },
        ));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let b = Arc::clone(&b);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        b.record_failure();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = b.snapshot();
        assert_eq!(snap.consecutive_failures, 400);
        assert_eq!(snap.trips, 1);
        assert_eq!(snap.state, BreakerState::Open);
    }
}
