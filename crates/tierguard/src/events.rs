//! Events emitted while resolving a request, and handlers for them.
//!
//! The orchestrator reports every decision it makes as an
//! [`OrchestratorEvent`]: cache hits, local fallthroughs, breaker skips,
//! failed attempts and their backoff, and the final outcome. Implement
//! [`EventHandler`] to feed these into logs, dashboards, or tests.
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget resolves |
//! | [`LoggingHandler`] | Structured logging via `tracing` (the default) |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |

use crate::resilience::ErrorCategory;
use crate::types::TierId;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Why the local tier's answer was not used.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LocalFallthrough<'a> {
    /// Local result fell short of the confidence or safety bar.
    BelowThreshold { confidence: f64, threshold: f64 },
    /// The local tier failed outright.
    Failed { message: &'a str },
}

/// Events emitted by the orchestrator during a resolve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OrchestratorEvent<'a> {
    /// A cached result was returned; no tier was attempted.
    CacheHit { resolve_id: &'a str },
    /// The local tier's result was accepted.
    LocalAccepted { resolve_id: &'a str, confidence: f64 },
    /// The local tier was tried and its answer discarded.
    LocalFallthrough {
        resolve_id: &'a str,
        reason: LocalFallthrough<'a>,
    },
    /// A remote tier was skipped because its breaker is open.
    BreakerSkip { resolve_id: &'a str, tier: TierId },
    /// A remote attempt failed.
    AttemptFailed {
        resolve_id: &'a str,
        tier: TierId,
        /// 0-indexed attempt within this tier visit.
        attempt: u32,
        category: ErrorCategory,
        message: &'a str,
        /// Backoff before the next attempt, or `None` when the tier is done.
        retry_in: Option<Duration>,
    },
    /// A tier produced the final result.
    Resolved {
        resolve_id: &'a str,
        tier: TierId,
        attempts: u32,
    },
    /// Every tier was exhausted or skipped.
    Exhausted {
        resolve_id: &'a str,
        category: Option<ErrorCategory>,
    },
    /// The caller abandoned the request.
    Cancelled { resolve_id: &'a str },
}

/// Handler for orchestrator events.
///
/// Handlers run inline on the resolving task, so keep them fast.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &OrchestratorEvent<'_>) {
        let _ = event;
    }
}

/// Ignores everything.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
///
/// ```ignore
/// let handler = FnEventHandler::new(|event| {
///     if let OrchestratorEvent::BreakerSkip { tier, .. } = event {
///         eprintln!("skipped {tier}");
///     }
/// });
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&OrchestratorEvent<'_>) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&OrchestratorEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&OrchestratorEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &OrchestratorEvent<'_>) {
        (self.0)(event)
    }
}

/// Dispatches every event to each inner handler, in registration order.
#[derive(Default)]
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &OrchestratorEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// Forwards events to `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &OrchestratorEvent<'_>) {
        match event {
            OrchestratorEvent::CacheHit { resolve_id } => {
                debug!(resolve_id, "cache hit");
            }
            OrchestratorEvent::LocalAccepted {
                resolve_id,
                confidence,
            } => {
                debug!(resolve_id, confidence, "local result accepted");
            }
            OrchestratorEvent::LocalFallthrough { resolve_id, reason } => match reason {
                LocalFallthrough::BelowThreshold {
                    confidence,
                    threshold,
                } => debug!(
                    resolve_id,
                    confidence, threshold, "local result below bar, falling through"
                ),
                LocalFallthrough::Failed { message } => {
                    debug!(resolve_id, error = message, "local tier failed, falling through")
                }
            },
            OrchestratorEvent::BreakerSkip { resolve_id, tier } => {
                info!(resolve_id, %tier, "circuit open, skipping tier");
            }
            OrchestratorEvent::AttemptFailed {
                resolve_id,
                tier,
                attempt,
                category,
                message,
                retry_in,
            } => match retry_in {
                Some(delay) => warn!(
                    resolve_id,
                    %tier,
                    attempt = attempt + 1,
                    %category,
                    error = message,
                    "attempt failed, retrying in {delay:?}"
                ),
                None => warn!(
                    resolve_id,
                    %tier,
                    attempt = attempt + 1,
                    %category,
                    error = message,
                    "attempt failed, moving to next tier"
                ),
            },
            OrchestratorEvent::Resolved {
                resolve_id,
                tier,
                attempts,
            } => {
                info!(resolve_id, %tier, attempts, "resolved");
            }
            OrchestratorEvent::Exhausted {
                resolve_id,
                category,
            } => {
                warn!(
                    resolve_id,
                    category = category.map_or("none", |c| c.as_str()),
                    "all tiers exhausted"
                );
            }
            OrchestratorEvent::Cancelled { resolve_id } => {
                info!(resolve_id, "resolve cancelled");
            }
        }
    }
}
