//! Request and result value types.
//!
//! [`InferenceRequest`] and [`InferenceResult`] are plain values: immutable
//! once built, cheap to clone, and safe to move between concurrent tasks.
//! Nothing in here holds shared mutable state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default confidence a local result must reach to be accepted.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

// ── Tier identity ──────────────────────────────────────────────────

/// Identifies which backend produced (or failed to produce) a result.
///
/// Ordering follows resolution priority: `Local` is tried before
/// `Primary`, which is tried before `Secondary`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TierId {
    Local,
    Primary,
    Secondary,
}

impl std::fmt::Display for TierId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TierId::Local => write!(f, "local"),
            TierId::Primary => write!(f, "primary"),
            TierId::Secondary => write!(f, "secondary"),
        }
    }
}

// ── Request ────────────────────────────────────────────────────────

/// The event that triggered a suggestion request.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct InferenceContext {
    /// Identifier of the entity whose state changed.
    pub entity_id: String,
    /// Kind of event, e.g. `"state_changed"`.
    pub event_kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_state: Option<String>,
    /// When the event happened. Defaults to now when omitted from JSON.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Owning user.
    pub user_id: String,
}

/// How strict the safety bar is for an accepted result.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SafetyPolicy {
    Strict,
    #[default]
    Balanced,
    Permissive,
}

impl SafetyPolicy {
    /// Minimum safety score a locally produced result must carry.
    pub fn min_safety_score(self) -> f64 {
        match self {
            SafetyPolicy::Strict => 0.9,
            SafetyPolicy::Balanced => 0.7,
            SafetyPolicy::Permissive => 0.0,
        }
    }
}

impl std::fmt::Display for SafetyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SafetyPolicy::Strict => write!(f, "strict"),
            SafetyPolicy::Balanced => write!(f, "balanced"),
            SafetyPolicy::Permissive => write!(f, "permissive"),
        }
    }
}

/// Per-user preferences that shape resolution.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Preferences {
    /// Minimum confidence for the local tier's result to be used.
    pub confidence_threshold: f64,
    /// Model name the primary remote tier should use instead of its default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_backend: Option<String>,
    pub safety_policy: SafetyPolicy,
    /// Whether the user opted in to on-device processing.
    pub allow_local_processing: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            preferred_backend: None,
            safety_policy: SafetyPolicy::default(),
            allow_local_processing: true,
        }
    }
}

impl Preferences {
    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_preferred_backend(mut self, model: impl Into<String>) -> Self {
        self.preferred_backend = Some(model.into());
        self
    }

    pub fn with_safety_policy(mut self, policy: SafetyPolicy) -> Self {
        self.safety_policy = policy;
        self
    }

    pub fn with_local_processing(mut self, allow: bool) -> Self {
        self.allow_local_processing = allow;
        self
    }
}

/// A single suggestion request. Immutable per call.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct InferenceRequest {
    pub context: InferenceContext,
    #[serde(default)]
    pub preferences: Preferences,
}

impl InferenceRequest {
    /// Build a request for an entity event with default preferences.
    pub fn new(
        entity_id: impl Into<String>,
        event_kind: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            context: InferenceContext {
                entity_id: entity_id.into(),
                event_kind: event_kind.into(),
                old_state: None,
                new_state: None,
                timestamp: Utc::now(),
                user_id: user_id.into(),
            },
            preferences: Preferences::default(),
        }
    }

    /// Set the before/after states of the triggering event.
    pub fn with_states(
        mut self,
        old_state: Option<impl Into<String>>,
        new_state: Option<impl Into<String>>,
    ) -> Self {
        self.context.old_state = old_state.map(Into::into);
        self.context.new_state = new_state.map(Into::into);
        self
    }

    pub fn with_preferences(mut self, preferences: Preferences) -> Self {
        self.preferences = preferences;
        self
    }
}

// ── Result ─────────────────────────────────────────────────────────

/// A produced suggestion. Immutable once constructed.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct InferenceResult {
    /// The suggestion payload as produced by the tier.
    pub suggestion: serde_json::Value,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Safety score in `[0, 1]`.
    pub safety_score: f64,
    pub rationale: String,
    pub tier: TierId,
    pub created_at: DateTime<Utc>,
}

impl InferenceResult {
    /// Build a result stamped with the current time. Scores are clamped
    /// to `[0, 1]`; a NaN score becomes `0.0`.
    pub fn new(
        tier: TierId,
        suggestion: serde_json::Value,
        confidence: f64,
        safety_score: f64,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            suggestion,
            confidence: clamp_unit(confidence),
            safety_score: clamp_unit(safety_score),
            rationale: rationale.into(),
            tier,
            created_at: Utc::now(),
        }
    }

    /// Whether this result clears both the confidence and the safety bar.
    pub fn meets(&self, preferences: &Preferences) -> bool {
        self.confidence >= preferences.confidence_threshold
            && self.safety_score >= preferences.safety_policy.min_safety_score()
    }
}

fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}
