//! Convenience re-exports for common `tierguard` types.
//!
//! Meant to be glob-imported when wiring up an orchestrator:
//!
//! ```ignore
//! use tierguard::prelude::*;
//! ```
//!
//! Breaker internals (`BreakerCore`, `BreakerEvent`), classification rules,
//! and cache entries are left out; import those from their modules when
//! needed.

// ── Core types ──────────────────────────────────────────────────────
pub use crate::types::{
    InferenceContext, InferenceRequest, InferenceResult, Preferences, SafetyPolicy, TierId,
};
pub use crate::{ChatClient, ChatRequest, Message};

// ── Orchestration ───────────────────────────────────────────────────
pub use crate::orchestrator::{TerminalFailure, TierOrchestrator, TierOrchestratorBuilder};

// ── Tiers ───────────────────────────────────────────────────────────
pub use crate::tiers::{ChatTier, FnLocalTier, LocalTier, RemoteTier, TierFuture, TierOutcome};

// ── Resilience ──────────────────────────────────────────────────────
pub use crate::resilience::{
    BreakerConfig, BreakerState, CircuitBreaker, ErrorCategory, ErrorClassifier, FailureKind,
    MetricsSnapshot, RetryPolicy, RetryPolicyTable, TierFailure,
};

// ── Cache and config ────────────────────────────────────────────────
pub use crate::cache::{CacheConfig, CacheStats, ResultCache};
pub use crate::config::{ConfigError, RemoteConfig, ResilienceConfig};

// ── Events ──────────────────────────────────────────────────────────
pub use crate::events::{
    CompositeEventHandler, EventHandler, FnEventHandler, LoggingHandler, NoopHandler,
    OrchestratorEvent,
};
