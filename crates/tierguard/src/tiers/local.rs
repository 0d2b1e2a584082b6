//! Closure-backed local tier.

use super::{LocalTier, TierOutcome};
use crate::types::InferenceRequest;

/// A [`LocalTier`] that runs a closure.
///
/// ```ignore
/// let local = FnLocalTier::new("local:rules-v1", |req| {
///     Ok(InferenceResult::new(TierId::Local, json!({"action": "none"}), 0.4, 1.0, "no rule matched"))
/// });
/// ```
pub struct FnLocalTier<F>
where
    F: Fn(&InferenceRequest) -> TierOutcome + Send + Sync,
{
    version: String,
    infer_fn: F,
}

impl<F> FnLocalTier<F>
where
    F: Fn(&InferenceRequest) -> TierOutcome + Send + Sync,
{
    pub fn new(version: impl Into<String>, infer_fn: F) -> Self {
        Self {
            version: version.into(),
            infer_fn,
        }
    }
}

impl<F> LocalTier for FnLocalTier<F>
where
    F: Fn(&InferenceRequest) -> TierOutcome + Send + Sync,
{
    fn version(&self) -> String {
        self.version.clone()
    }

    fn infer(&self, request: &InferenceRequest) -> TierOutcome {
        (self.infer_fn)(request)
    }
}
