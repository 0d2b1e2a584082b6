//! Remote tier backed by a chat completions endpoint.
//!
//! Builds a system/user prompt pair from the request, asks for a JSON
//! object, and parses the first completion into an [`InferenceResult`]:
//!
//! ```json
//! {"suggestion": {...}, "confidence": 0.82, "safety_score": 0.97, "rationale": "..."}
//! ```
//!
//! An unparseable completion is a [`FailureKind::Parse`](crate::resilience::FailureKind::Parse)
//! failure and goes through the normal retry path.

use super::{RemoteTier, TierFuture, TierOutcome};
use crate::config::RemoteConfig;
use crate::resilience::TierFailure;
use crate::types::{InferenceRequest, InferenceResult, SafetyPolicy, TierId};
use crate::{ChatClient, ChatCompletion, ChatRequest, Message, ResponseFormat, ResponseFormatType};
use serde::Deserialize;
use std::sync::Arc;

/// A [`RemoteTier`] that calls a chat model.
pub struct ChatTier {
    id: TierId,
    client: Arc<ChatClient>,
    model: String,
    /// Whether `Preferences::preferred_backend` overrides `model`.
    honor_preferred: bool,
    max_tokens: u32,
    temperature: f32,
}

impl ChatTier {
    pub fn new(id: TierId, client: Arc<ChatClient>, model: impl Into<String>) -> Self {
        Self {
            id,
            client,
            model: model.into(),
            honor_preferred: false,
            max_tokens: crate::config::DEFAULT_MAX_TOKENS,
            temperature: crate::config::DEFAULT_TEMPERATURE,
        }
    }

    /// The primary tier: the configured primary model, overridable per request.
    pub fn primary(client: Arc<ChatClient>, remote: &RemoteConfig) -> Self {
        Self::new(TierId::Primary, client, &remote.primary_model)
            .with_generation(remote.max_tokens, remote.temperature)
            .honor_preferred_backend(true)
    }

    /// The secondary tier: always the configured fallback model.
    pub fn secondary(client: Arc<ChatClient>, remote: &RemoteConfig) -> Self {
        Self::new(TierId::Secondary, client, &remote.fallback_model)
            .with_generation(remote.max_tokens, remote.temperature)
    }

    pub fn with_generation(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    pub fn honor_preferred_backend(mut self, honor: bool) -> Self {
        self.honor_preferred = honor;
        self
    }

    fn model_for<'a>(&'a self, request: &'a InferenceRequest) -> &'a str {
        match &request.preferences.preferred_backend {
            Some(model) if self.honor_preferred && !model.is_empty() => model.as_str(),
            _ => self.model.as_str(),
        }
    }

    /// The request body sent for `request`.
    pub fn build_request(&self, request: &InferenceRequest) -> ChatRequest {
        ChatRequest {
            model: self.model_for(request).to_string(),
            messages: vec![
                Message::system(system_prompt(request.preferences.safety_policy)),
                Message::user(user_prompt(request)),
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            response_format: Some(ResponseFormat {
                fmt_type: ResponseFormatType::JsonObject,
            }),
        }
    }
}

impl RemoteTier for ChatTier {
    fn id(&self) -> TierId {
        self.id
    }

    fn version(&self) -> String {
        format!("{}:{}", self.id, self.model)
    }

    fn infer<'a>(&'a self, request: &'a InferenceRequest) -> TierFuture<'a> {
        Box::pin(async move {
            let body = self.build_request(request);
            let completion = self.client.chat(&body).await?;
            parse_suggestion(self.id, &completion_text(completion)?)
        })
    }
}

/// The usable text of a completion. Empty and truncated completions are
/// parse failures.
fn completion_text(completion: ChatCompletion) -> Result<String, TierFailure> {
    if completion.finish_reason.as_deref() == Some("length") {
        return Err(TierFailure::parse(
            "completion truncated at max_tokens (finish_reason=length)",
        ));
    }
    completion
        .content
        .ok_or_else(|| TierFailure::parse("empty completion"))
}

fn system_prompt(policy: SafetyPolicy) -> String {
    let safety = match policy {
        SafetyPolicy::Strict => {
            "Only suggest actions that cannot cause harm, cost, or loss of security."
        }
        SafetyPolicy::Balanced => "Avoid actions with a plausible risk of harm or loss of security.",
        SafetyPolicy::Permissive => "Flag risky actions through a low safety_score.",
    };
    format!(
        "You suggest automations in response to device events. {safety}\n\
         Reply with a single JSON object with keys: \
         \"suggestion\" (object), \"confidence\" (0-1), \
         \"safety_score\" (0-1), \"rationale\" (string)."
    )
}

fn user_prompt(request: &InferenceRequest) -> String {
    let ctx = &request.context;
    format!(
        "Entity: {}\nEvent: {}\nPrevious state: {}\nNew state: {}\nAt: {}",
        ctx.entity_id,
        ctx.event_kind,
        ctx.old_state.as_deref().unwrap_or("unknown"),
        ctx.new_state.as_deref().unwrap_or("unknown"),
        ctx.timestamp.to_rfc3339(),
    )
}

#[derive(Deserialize)]
struct SuggestionPayload {
    suggestion: serde_json::Value,
    confidence: f64,
    safety_score: f64,
    #[serde(default)]
    rationale: String,
}

/// Parse a completion's content into a result for `tier`.
pub fn parse_suggestion(tier: TierId, content: &str) -> TierOutcome {
    let payload: SuggestionPayload = serde_json::from_str(strip_code_fence(content))
        .map_err(|e| TierFailure::parse(format!("unparseable suggestion: {e}")))?;
    Ok(InferenceResult::new(
        tier,
        payload.suggestion,
        payload.confidence,
        payload.safety_score,
        payload.rationale,
    ))
}

fn strip_code_fence(s: &str) -> &str {
    let trimmed = s.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
