//! Inference backends.
//!
//! A tier is anything that can turn an [`InferenceRequest`] into an
//! [`InferenceResult`]. There are two shapes:
//!
//! - [`LocalTier`]: synchronous, on-device. Called at most once per resolve,
//!   with no retry and no circuit breaker.
//! - [`RemoteTier`]: async and fallible over the network. Guarded by a
//!   breaker, retried per error category, and bounded by a per-call timeout.
//!
//! [`FnLocalTier`](local::FnLocalTier) wraps a closure; [`ChatTier`](remote::ChatTier)
//! talks to an OpenAI-compatible chat completions endpoint.

pub mod local;
pub mod remote;

pub use local::FnLocalTier;
pub use remote::ChatTier;

use crate::resilience::TierFailure;
use crate::types::{InferenceRequest, InferenceResult, TierId};
use std::future::Future;
use std::pin::Pin;

/// What a tier call produces.
pub type TierOutcome = Result<InferenceResult, TierFailure>;

/// Boxed future returned by [`RemoteTier::infer`].
pub type TierFuture<'a> = Pin<Box<dyn Future<Output = TierOutcome> + Send + 'a>>;

/// On-device inference. Assumed available or instantly failing.
pub trait LocalTier: Send + Sync {
    /// Label recorded alongside cached results, e.g. `"local:rules-v2"`.
    fn version(&self) -> String;

    fn infer(&self, request: &InferenceRequest) -> TierOutcome;
}

/// Remote inference over the network.
pub trait RemoteTier: Send + Sync {
    /// Which priority slot this tier fills.
    fn id(&self) -> TierId;

    /// Label recorded alongside cached results, e.g. `"primary:gpt-4o-mini"`.
    fn version(&self) -> String;

    /// Make one call. The orchestrator owns retries and timeouts.
    fn infer<'a>(&'a self, request: &'a InferenceRequest) -> TierFuture<'a>;
}

impl<T: LocalTier + ?Sized> LocalTier for std::sync::Arc<T> {
    fn version(&self) -> String {
        (**self).version()
    }

    fn infer(&self, request: &InferenceRequest) -> TierOutcome {
        (**self).infer(request)
    }
}

impl<T: RemoteTier + ?Sized> RemoteTier for std::sync::Arc<T> {
    fn id(&self) -> TierId {
        (**self).id()
    }

    fn version(&self) -> String {
        (**self).version()
    }

    fn infer<'a>(&'a self, request: &'a InferenceRequest) -> TierFuture<'a> {
        (**self).infer(request)
    }
}
