//! The resolve algorithm.
//!
//! [`TierOrchestrator::resolve`] walks the tiers in priority order and
//! returns the first acceptable result:
//!
//! 1. **Cache.** A live entry for the request's [`Fingerprint`] is returned
//!    as-is. No tier runs and no outcome metric moves.
//! 2. **Local.** Called once, synchronously, if enabled for both the process
//!    and the request. Its result is used only if it clears the request's
//!    confidence threshold (raised to the configured floor) and the safety
//!    policy's minimum. Anything else is a fallthrough, not an error.
//! 3. **Remote, in order.** Each tier is skipped outright while its breaker
//!    refuses. Otherwise it is called under a per-call timeout. Every failure
//!    is classified, recorded on the breaker and in the metrics, and retried
//!    per the category's policy after a `base * 2^attempt` sleep. Retries
//!    never cross tiers.
//!
//! Any success is cached. When every tier is exhausted or skipped the caller
//! gets a [`TerminalFailure`] carrying the last observed category and message.
//!
//! The remote call and the backoff sleep are the only suspension points.
//! [`resolve_with_cancel`](TierOrchestrator::resolve_with_cancel) races both
//! against a caller-supplied future and stops scheduling work once it fires.

use crate::cache::{CacheEntry, Fingerprint, ResultCache};
use crate::config::ResilienceConfig;
use crate::events::{EventHandler, LocalFallthrough, LoggingHandler, OrchestratorEvent};
use crate::resilience::{
    CircuitBreaker, ErrorCategory, ErrorClassifier, MetricsSnapshot, OutcomeMetrics, TierFailure,
};
use crate::tiers::{LocalTier, RemoteTier};
use crate::types::{InferenceRequest, InferenceResult, TierId};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use thiserror::Error;
use tracing::{Instrument, info_span};

/// Why a resolve produced no result.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TerminalFailure {
    /// At least one tier was called and every tier ended in failure.
    #[error("all tiers exhausted after {attempts} attempt(s); last error ({category}): {message}")]
    Exhausted {
        category: ErrorCategory,
        message: String,
        attempts: u32,
    },
    /// No remote call was made because every configured remote breaker refused.
    #[error("no tier available: every remote circuit is open")]
    Unavailable,
    /// No remote tier is configured and the local tier did not resolve.
    #[error("no remote tier configured and the local tier did not resolve")]
    NoRemoteTier,
    /// The caller abandoned the request.
    #[error("resolve cancelled")]
    Cancelled,
}

impl TerminalFailure {
    /// The last observed error category, if any call was made.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            TerminalFailure::Exhausted { category, .. } => Some(*category),
            _ => None,
        }
    }
}

/// Generate a unique id for one resolve.
pub fn generate_resolve_id() -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("rs-{ts:x}-{count:04x}")
}

struct RemoteSlot {
    id: TierId,
    tier: Box<dyn RemoteTier>,
    breaker: Arc<CircuitBreaker>,
}

enum TierVisit {
    Resolved(InferenceResult),
    Exhausted,
    Cancelled,
}

/// Failures seen so far in one resolve.
#[derive(Default)]
struct ResolveTrail {
    last: Option<(ErrorCategory, String)>,
    attempts: u32,
    skips: u32,
}

/// Routes requests through cache, local, primary, and secondary tiers.
///
/// Shared across tasks behind an `Arc`; every piece of mutable state
/// (breakers, metrics, cache) synchronizes internally.
pub struct TierOrchestrator {
    config: ResilienceConfig,
    local: Option<Box<dyn LocalTier>>,
    remotes: Vec<RemoteSlot>,
    classifier: ErrorClassifier,
    cache: ResultCache,
    metrics: OutcomeMetrics,
    events: Box<dyn EventHandler>,
}

impl TierOrchestrator {
    pub fn builder(config: ResilienceConfig) -> TierOrchestratorBuilder {
        TierOrchestratorBuilder {
            config,
            local: None,
            primary: None,
            secondary: None,
            classifier: ErrorClassifier::default(),
            events: Box::new(LoggingHandler),
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn metrics(&self) -> &OutcomeMetrics {
        &self.metrics
    }

    /// The breaker guarding a remote tier, if that tier is registered.
    pub fn breaker(&self, tier: TierId) -> Option<&CircuitBreaker> {
        self.remotes
            .iter()
            .find(|s| s.id == tier)
            .map(|s| s.breaker.as_ref())
    }

    /// Outcome counters, breaker states, and cache statistics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot().with_cache(self.cache.stats())
    }

    /// Resolve `request` to the first acceptable result.
    pub async fn resolve(
        &self,
        request: &InferenceRequest,
    ) -> Result<InferenceResult, TerminalFailure> {
        self.resolve_with_cancel(request, std::future::pending()).await
    }

    /// Like [`resolve`](Self::resolve), but gives up as soon as `cancel`
    /// completes. Outcomes already recorded stay recorded; a call abandoned
    /// mid-flight records nothing.
    pub async fn resolve_with_cancel<C>(
        &self,
        request: &InferenceRequest,
        cancel: C,
    ) -> Result<InferenceResult, TerminalFailure>
    where
        C: Future<Output = ()>,
    {
        let resolve_id = generate_resolve_id();
        let span = info_span!(
            "resolve",
            resolve_id = %resolve_id,
            entity = %request.context.entity_id,
            event = %request.context.event_kind,
        );
        self.run(&resolve_id, request, cancel).instrument(span).await
    }

    async fn run<C>(
        &self,
        resolve_id: &str,
        request: &InferenceRequest,
        cancel: C,
    ) -> Result<InferenceResult, TerminalFailure>
    where
        C: Future<Output = ()>,
    {
        let fingerprint = Fingerprint::of(request);
        if let Some(entry) = self.cache.get(&fingerprint) {
            self.emit(OrchestratorEvent::CacheHit { resolve_id });
            return Ok(entry.result);
        }

        if let Some(result) = self.try_local(resolve_id, request, &fingerprint) {
            return Ok(result);
        }

        let mut cancel = std::pin::pin!(cancel);
        let mut trail = ResolveTrail::default();
        for slot in &self.remotes {
            let visit = self
                .visit_remote(resolve_id, slot, request, &fingerprint, cancel.as_mut(), &mut trail)
                .await;
            match visit {
                TierVisit::Resolved(result) => return Ok(result),
                TierVisit::Cancelled => {
                    self.emit(OrchestratorEvent::Cancelled { resolve_id });
                    return Err(TerminalFailure::Cancelled);
                }
                TierVisit::Exhausted => {}
            }
        }

        self.metrics.record_terminal_failure();
        self.emit(OrchestratorEvent::Exhausted {
            resolve_id,
            category: trail.last.as_ref().map(|(c, _)| *c),
        });
        Err(match trail.last {
            Some((category, message)) => TerminalFailure::Exhausted {
                category,
                message,
                attempts: trail.attempts,
            },
            None if trail.skips > 0 => TerminalFailure::Unavailable,
            None => TerminalFailure::NoRemoteTier,
        })
    }

    fn try_local(
        &self,
        resolve_id: &str,
        request: &InferenceRequest,
        fingerprint: &Fingerprint,
    ) -> Option<InferenceResult> {
        let local = self.local.as_ref()?;
        if !self.config.local_enabled || !request.preferences.allow_local_processing {
            return None;
        }

        let threshold = request
            .preferences
            .confidence_threshold
            .max(self.config.local_confidence_floor);
        let failure: TierFailure;
        let reason = match local.infer(request) {
            Ok(result) => {
                let bar = request
                    .preferences
                    .clone()
                    .with_confidence_threshold(threshold);
                if result.meets(&bar) {
                    self.metrics.record_success(TierId::Local);
                    self.cache.put(
                        fingerprint.clone(),
                        CacheEntry::new(result.clone(), local.version()),
                    );
                    self.emit(OrchestratorEvent::LocalAccepted {
                        resolve_id,
                        confidence: result.confidence,
                    });
                    return Some(result);
                }
                LocalFallthrough::BelowThreshold {
                    confidence: result.confidence,
                    threshold,
                }
            }
            Err(e) => {
                failure = e;
                LocalFallthrough::Failed {
                    message: &failure.message,
                }
            }
        };

        self.metrics.record_local_fallthrough();
        self.emit(OrchestratorEvent::LocalFallthrough { resolve_id, reason });
        None
    }

    async fn visit_remote<C>(
        &self,
        resolve_id: &str,
        slot: &RemoteSlot,
        request: &InferenceRequest,
        fingerprint: &Fingerprint,
        mut cancel: Pin<&mut C>,
        trail: &mut ResolveTrail,
    ) -> TierVisit
    where
        C: Future<Output = ()>,
    {
        let timeout = self.config.tier_timeout;
        let mut attempt: u32 = 0;
        loop {
            let admission = slot.breaker.admit();
            if !admission.is_admitted() {
                trail.skips += 1;
                self.metrics.record_breaker_skip();
                self.emit(OrchestratorEvent::BreakerSkip {
                    resolve_id,
                    tier: slot.id,
                });
                return TierVisit::Exhausted;
            }

            let call = tokio::time::timeout(timeout, slot.tier.infer(request));
            let outcome = tokio::select! {
                biased;
                _ = cancel.as_mut() => {
                    slot.breaker.release(admission);
                    return TierVisit::Cancelled;
                }
                r = call => r.unwrap_or_else(|_| Err(TierFailure::timeout(timeout))),
            };
            trail.attempts += 1;

            let failure = match outcome {
                Ok(result) => {
                    slot.breaker.record_success();
                    self.metrics.record_success(slot.id);
                    self.cache.put(
                        fingerprint.clone(),
                        CacheEntry::new(result.clone(), slot.tier.version()),
                    );
                    self.emit(OrchestratorEvent::Resolved {
                        resolve_id,
                        tier: slot.id,
                        attempts: attempt + 1,
                    });
                    return TierVisit::Resolved(result);
                }
                Err(failure) => failure,
            };

            let category = self.classifier.classify(&failure);
            slot.breaker.record_failure();
            self.metrics.record_failure(category);

            let policy = self.config.retry.policy_for(category);
            let retry_in = policy
                .allows_retry(attempt)
                .then(|| policy.delay_for_attempt(attempt));
            self.emit(OrchestratorEvent::AttemptFailed {
                resolve_id,
                tier: slot.id,
                attempt,
                category,
                message: &failure.message,
                retry_in,
            });
            trail.last = Some((category, failure.message));

            let Some(delay) = retry_in else {
                return TierVisit::Exhausted;
            };
            tokio::select! {
                biased;
                _ = cancel.as_mut() => return TierVisit::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    fn emit(&self, event: OrchestratorEvent<'_>) {
        self.events.on_event(&event);
    }
}

/// Builder for [`TierOrchestrator`].
pub struct TierOrchestratorBuilder {
    config: ResilienceConfig,
    local: Option<Box<dyn LocalTier>>,
    primary: Option<Box<dyn RemoteTier>>,
    secondary: Option<Box<dyn RemoteTier>>,
    classifier: ErrorClassifier,
    events: Box<dyn EventHandler>,
}

impl TierOrchestratorBuilder {
    pub fn local(mut self, tier: impl LocalTier + 'static) -> Self {
        self.local = Some(Box::new(tier));
        self
    }

    pub fn primary(mut self, tier: impl RemoteTier + 'static) -> Self {
        self.primary = Some(Box::new(tier));
        self
    }

    pub fn secondary(mut self, tier: impl RemoteTier + 'static) -> Self {
        self.secondary = Some(Box::new(tier));
        self
    }

    /// Replace the default classification rules.
    pub fn classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Replace the default [`LoggingHandler`].
    pub fn event_handler(mut self, handler: impl EventHandler + 'static) -> Self {
        self.events = Box::new(handler);
        self
    }

    pub fn build(self) -> TierOrchestrator {
        let breaker_config = self.config.breaker;
        let remotes: Vec<RemoteSlot> = [
            (TierId::Primary, self.primary),
            (TierId::Secondary, self.secondary),
        ]
        .into_iter()
        .filter_map(|(id, tier)| {
            tier.map(|tier| RemoteSlot {
                id,
                tier,
                breaker: Arc::new(CircuitBreaker::new(id, breaker_config)),
            })
        })
        .collect();
        let metrics = OutcomeMetrics::new(remotes.iter().map(|s| s.breaker.clone()).collect());

        TierOrchestrator {
            cache: ResultCache::new(self.config.cache),
            config: self.config,
            local: self.local,
            remotes,
            classifier: self.classifier,
            metrics,
            events: self.events,
        }
    }
}
