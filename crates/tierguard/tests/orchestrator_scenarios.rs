//! End-to-end scenarios against the public API, with scripted tiers.

use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tierguard::prelude::*;
use tokio::time::Instant;

/// Remote tier driven by a closure over the call index.
struct ScriptedTier {
    id: TierId,
    calls: AtomicUsize,
    script: Mutex<VecDeque<TierOutcome>>,
    fallback: fn(TierId) -> TierOutcome,
}

impl ScriptedTier {
    fn new(id: TierId, script: Vec<TierOutcome>, fallback: fn(TierId) -> TierOutcome) -> Arc<Self> {
        Arc::new(Self {
            id,
            calls: AtomicUsize::new(0),
            script: Mutex::new(script.into()),
            fallback,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RemoteTier for ScriptedTier {
    fn id(&self) -> TierId {
        self.id
    }

    fn version(&self) -> String {
        format!("{}:scripted", self.id)
    }

    fn infer<'a>(&'a self, _request: &'a InferenceRequest) -> TierFuture<'a> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| (self.fallback)(self.id))
        })
    }
}

fn succeed(tier: TierId) -> TierOutcome {
    Ok(InferenceResult::new(
        tier,
        json!({"service": "light.turn_off"}),
        0.85,
        0.95,
        "nobody home",
    ))
}

fn unavailable(_tier: TierId) -> TierOutcome {
    Err(TierFailure::http(503, "service unavailable"))
}

fn request(n: usize) -> InferenceRequest {
    InferenceRequest::new(format!("light.room_{n}"), "state_changed", "user-1")
}

fn quiet(config: ResilienceConfig) -> TierOrchestratorBuilder {
    TierOrchestrator::builder(config).event_handler(NoopHandler)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_failures_trip_the_breaker_once() {
    let primary = ScriptedTier::new(TierId::Primary, vec![], unavailable);
    let secondary = ScriptedTier::new(TierId::Secondary, vec![], succeed);
    let config = ResilienceConfig::default()
        .with_retry_policy(ErrorCategory::ServerError, RetryPolicy::never());
    let orch = Arc::new(
        quiet(config)
            .primary(primary.clone())
            .secondary(secondary.clone())
            .build(),
    );

    let handles: Vec<_> = (0..64)
        .map(|n| {
            let orch = orch.clone();
            tokio::spawn(async move { orch.resolve(&request(n)).await })
        })
        .collect();
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.tier, TierId::Secondary);
    }

    let snap = orch.snapshot();
    assert_eq!(snap.tiers[&TierId::Primary].trips, 1);
    assert_eq!(snap.breaker_state, BreakerState::Open);
    assert_eq!(snap.server_errors as usize, primary.calls());
    assert_eq!(snap.total_errors as usize, primary.calls());
    assert_eq!(snap.breaker_skips as usize + primary.calls(), 64);
    assert!(primary.calls() >= 10);
    assert_eq!(secondary.calls(), 64);
}

#[tokio::test(start_paused = true)]
async fn breaker_recovers_after_cool_down_and_three_probes() {
    let failures = (0..10).map(|_| Err(TierFailure::http(500, "boom"))).collect();
    let primary = ScriptedTier::new(TierId::Primary, failures, succeed);
    let secondary = ScriptedTier::new(TierId::Secondary, vec![], succeed);
    let config = ResilienceConfig::default()
        .with_retry_policy(ErrorCategory::ServerError, RetryPolicy::never());
    let orch = quiet(config)
        .primary(primary.clone())
        .secondary(secondary.clone())
        .build();

    for n in 0..10 {
        orch.resolve(&request(n)).await.unwrap();
    }
    assert_eq!(orch.snapshot().breaker_state, BreakerState::Open);

    // Still cooling down: primary is skipped.
    tokio::time::advance(Duration::from_secs(59)).await;
    orch.resolve(&request(100)).await.unwrap();
    assert_eq!(primary.calls(), 10);

    tokio::time::advance(Duration::from_secs(1)).await;
    for n in 200..203 {
        let r = orch.resolve(&request(n)).await.unwrap();
        assert_eq!(r.tier, TierId::Primary);
    }
    let snap = orch.snapshot();
    assert_eq!(snap.breaker_state, BreakerState::Closed);
    assert_eq!(snap.consecutive_failures, 0);
    assert_eq!(primary.calls(), 13);
}

#[tokio::test(start_paused = true)]
async fn half_open_probe_failure_reopens_for_another_cool_down() {
    let failures = (0..11).map(|_| Err(TierFailure::http(500, "boom"))).collect();
    let primary = ScriptedTier::new(TierId::Primary, failures, succeed);
    let secondary = ScriptedTier::new(TierId::Secondary, vec![], succeed);
    let config = ResilienceConfig::default()
        .with_retry_policy(ErrorCategory::ServerError, RetryPolicy::never());
    let orch = quiet(config)
        .primary(primary.clone())
        .secondary(secondary)
        .build();

    for n in 0..10 {
        orch.resolve(&request(n)).await.unwrap();
    }
    tokio::time::advance(Duration::from_secs(60)).await;
    orch.resolve(&request(50)).await.unwrap();
    assert_eq!(primary.calls(), 11);
    assert_eq!(orch.snapshot().breaker_state, BreakerState::Open);

    tokio::time::advance(Duration::from_secs(30)).await;
    orch.resolve(&request(51)).await.unwrap();
    assert_eq!(primary.calls(), 11);
    assert_eq!(orch.snapshot().tiers[&TierId::Primary].trips, 1);
}

#[tokio::test(start_paused = true)]
async fn unknown_failures_get_one_retry_after_five_seconds() {
    let primary = ScriptedTier::new(
        TierId::Primary,
        vec![
            Err(TierFailure::new(FailureKind::Other, "weird")),
            Err(TierFailure::new(FailureKind::Other, "weirder")),
        ],
        succeed,
    );
    let orch = quiet(ResilienceConfig::default())
        .primary(primary.clone())
        .build();

    let start = Instant::now();
    let err = orch.resolve(&request(0)).await.unwrap_err();
    assert_eq!(start.elapsed(), Duration::from_secs(5));
    assert_eq!(primary.calls(), 2);
    assert_eq!(
        err,
        TerminalFailure::Exhausted {
            category: ErrorCategory::Unknown,
            message: "weirder".into(),
            attempts: 2,
        }
    );
    assert_eq!(orch.snapshot().unknown_errors, 2);
}

#[tokio::test(start_paused = true)]
async fn declared_code_decides_the_retry_policy() {
    // A 500 that the backend labels as a bad request is not retried.
    let primary = ScriptedTier::new(
        TierId::Primary,
        vec![Err(TierFailure::http(500, "schema violation").with_code("bad_request"))],
        succeed,
    );
    let orch = quiet(ResilienceConfig::default())
        .primary(primary.clone())
        .build();

    let err = orch.resolve(&request(0)).await.unwrap_err();
    assert_eq!(err.category(), Some(ErrorCategory::BadRequest));
    assert_eq!(primary.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn category_switch_mid_loop_uses_latest_policy() {
    let primary = ScriptedTier::new(
        TierId::Primary,
        vec![
            Err(TierFailure::http(502, "bad gateway")),
            Err(TierFailure::http(401, "key revoked")),
        ],
        succeed,
    );
    let secondary = ScriptedTier::new(TierId::Secondary, vec![], succeed);
    let orch = quiet(ResilienceConfig::default())
        .primary(primary.clone())
        .secondary(secondary.clone())
        .build();

    let start = Instant::now();
    let r = orch.resolve(&request(0)).await.unwrap();
    assert_eq!(r.tier, TierId::Secondary);
    assert_eq!(start.elapsed(), Duration::from_secs(2));
    assert_eq!(primary.calls(), 2);

    let snap = orch.snapshot();
    assert_eq!(snap.server_errors, 1);
    assert_eq!(snap.auth_errors, 1);
    assert_eq!(snap.successes[&TierId::Secondary], 1);
}

#[tokio::test(start_paused = true)]
async fn cache_expires_after_ttl() {
    let primary = ScriptedTier::new(TierId::Primary, vec![], succeed);
    let config = ResilienceConfig::default().with_cache(CacheConfig {
        ttl: Duration::from_secs(300),
        max_entries: 10,
    });
    let orch = quiet(config).primary(primary.clone()).build();

    orch.resolve(&request(0)).await.unwrap();
    tokio::time::advance(Duration::from_secs(299)).await;
    orch.resolve(&request(0)).await.unwrap();
    assert_eq!(primary.calls(), 1);

    tokio::time::advance(Duration::from_secs(1)).await;
    orch.resolve(&request(0)).await.unwrap();
    assert_eq!(primary.calls(), 2);

    let cache = orch.snapshot().cache.unwrap();
    assert_eq!(cache.hits, 1);
    assert_eq!(cache.misses, 2);
    assert_eq!(cache.evictions, 1);
}

#[tokio::test(start_paused = true)]
async fn preferences_are_part_of_the_cache_key() {
    let primary = ScriptedTier::new(TierId::Primary, vec![], succeed);
    let orch = quiet(ResilienceConfig::default())
        .primary(primary.clone())
        .build();

    let strict = request(0)
        .with_preferences(Preferences::default().with_safety_policy(SafetyPolicy::Strict));
    orch.resolve(&request(0)).await.unwrap();
    orch.resolve(&strict).await.unwrap();
    orch.resolve(&strict).await.unwrap();
    assert_eq!(primary.calls(), 2);
}

#[tokio::test]
async fn snapshot_serializes_for_collectors() {
    let primary = ScriptedTier::new(TierId::Primary, vec![Err(TierFailure::http(429, "slow"))], succeed);
    let config = ResilienceConfig::default()
        .with_retry_policy(ErrorCategory::RateLimit, RetryPolicy::never());
    let orch = quiet(config).primary(primary).build();
    let _ = orch.resolve(&request(0)).await;

    let json = serde_json::to_value(orch.snapshot()).unwrap();
    assert_eq!(json["rate_limit_errors"], 1);
    assert_eq!(json["breaker_state"], "CLOSED");
    assert_eq!(json["tiers"]["primary"]["consecutive_failures"], 1);
    assert_eq!(json["cache"]["entries"], 0);
}
