//! Tiered inference with retry, circuit breaking, and result caching.
//!
//! `tierguard` sits between a suggestion API and a set of unreliable,
//! rate-limited, cost-tiered model backends. Given an
//! [`InferenceRequest`](types::InferenceRequest), the
//! [`TierOrchestrator`](orchestrator::TierOrchestrator) returns the first
//! acceptable result from, in order:
//!
//! 1. the [`ResultCache`](cache::ResultCache),
//! 2. an on-device [`LocalTier`](tiers::LocalTier), if its confidence clears
//!    the caller's bar,
//! 3. a primary [`RemoteTier`](tiers::RemoteTier),
//! 4. a secondary remote tier.
//!
//! Remote tiers are guarded by a per-tier
//! [`CircuitBreaker`](resilience::CircuitBreaker) and retried per error
//! category with exponential backoff. Every failure is counted in
//! [`OutcomeMetrics`](resilience::OutcomeMetrics).
//!
//! # Getting started
//!
//! ```ignore
//! use tierguard::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ResilienceConfig::from_env()?;
//!     let client = std::sync::Arc::new(ChatClient::from_config(&config.remote)?);
//!
//!     let orchestrator = TierOrchestrator::builder(config.clone())
//!         .primary(ChatTier::primary(client.clone(), &config.remote))
//!         .secondary(ChatTier::secondary(client, &config.remote))
//!         .build();
//!
//!     let request = InferenceRequest::new("light.kitchen", "state_changed", "user-1");
//!     let result = orchestrator.resolve(&request).await?;
//!     println!("{} ({:.2})", result.suggestion, result.confidence);
//!     println!("{:?}", orchestrator.snapshot());
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`orchestrator`] | [`TierOrchestrator`](orchestrator::TierOrchestrator): the resolve algorithm |
//! | [`resilience`] | Error classification, retry policies, circuit breaker, outcome metrics |
//! | [`cache`] | Fingerprinting and the TTL-bounded result cache |
//! | [`tiers`] | Local/remote tier traits and the chat-completions tier |
//! | [`events`] | Observable decisions and handlers |
//! | [`config`] | [`ResilienceConfig`](config::ResilienceConfig) from env or JSON |
//! | [`types`] | Request and result value types |

pub mod cache;
pub mod config;
pub mod events;
pub mod orchestrator;
pub mod prelude;
pub mod resilience;
pub mod tiers;
pub mod types;

use resilience::{FailureKind, TierFailure};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

// ── Constants ──────────────────────────────────────────────────────

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Default model for the primary remote tier.
pub const DEFAULT_PRIMARY_MODEL: &str = "openai/gpt-4o-mini";

/// Default model for the secondary remote tier.
pub const DEFAULT_FALLBACK_MODEL: &str = "anthropic/claude-3.5-haiku";

// ── Request types ──────────────────────────────────────────────────

/// Chat completion request body. Unset optional fields are omitted.
#[derive(Serialize, Debug, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "is_zero_f32")]
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}
fn is_zero_f32(v: &f32) -> bool {
    *v == 0.0
}

/// JSON output format type.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ResponseFormatType {
    #[serde(rename = "json_object")]
    JsonObject,
}

/// JSON output mode.
#[derive(Serialize, Debug)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub fmt_type: ResponseFormatType,
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
}

/// A message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

// ── Response types ─────────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorBody>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Deserialize, Debug)]
struct ApiErrorBody {
    message: String,
    /// Either a string code (`"rate_limit"`) or a numeric status.
    #[serde(default)]
    code: Option<serde_json::Value>,
}

impl ApiErrorBody {
    fn into_failure(self, status: Option<u16>) -> TierFailure {
        let numeric = self
            .code
            .as_ref()
            .and_then(|c| c.as_u64())
            .and_then(|c| u16::try_from(c).ok());
        let mut failure = match status.or(numeric) {
            Some(s) => TierFailure::http(s, format!("chat API HTTP {s}: {}", self.message)),
            None => TierFailure::new(FailureKind::Other, format!("chat API error: {}", self.message)),
        };
        if let Some(code) = self.code.as_ref().and_then(|c| c.as_str()) {
            failure = failure.with_code(code);
        }
        failure
    }
}

/// Clean return type from [`ChatClient::chat`].
#[derive(Debug)]
pub struct ChatCompletion {
    pub content: Option<String>,
    /// `"length"` means the model hit `max_tokens` and `content` is cut off.
    pub finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct UsageInfo {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

// ── Client ─────────────────────────────────────────────────────────

/// Async HTTP client for an OpenAI-compatible chat completions endpoint.
pub struct ChatClient {
    pub(crate) client: reqwest::Client,
    pub(crate) url: String,
    pub(crate) api_key: String,
}

impl ChatClient {
    /// Create a client for `url` authenticating with `api_key`.
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tierguard/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            api_key: api_key.into(),
        })
    }

    /// Create a client from remote-tier configuration.
    pub fn from_config(remote: &config::RemoteConfig) -> Result<Self, config::ConfigError> {
        let api_key = remote.api_key()?;
        Self::new(&remote.base_url, api_key)
            .map_err(|e| config::ConfigError::Client(e.to_string()))
    }

    /// Send a chat completion request.
    pub async fn chat(&self, body: &ChatRequest) -> Result<ChatCompletion, TierFailure> {
        debug!(
            "LLM request: model={}, messages={}, max_tokens={}, temp={}",
            body.model,
            body.messages.len(),
            body.max_tokens,
            body.temperature,
        );
        trace!(
            "Request payload size: {} bytes",
            serde_json::to_string(body).map_or(0, |s| s.len())
        );

        let start = Instant::now();

        let resp = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;

        debug!(
            "LLM response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(parse_error_body(status.as_u16(), &text));
        }

        let parsed: RawChatResponse = serde_json::from_str(&text)
            .map_err(|e| TierFailure::parse(format!("failed to parse response: {e}")))?;

        if let Some(err) = parsed.error {
            return Err(err.into_failure(None));
        }

        if let Some(ref usage) = parsed.usage {
            debug!(
                "Token usage: prompt={}, completion={}, total={}",
                usage.prompt_tokens.unwrap_or(0),
                usage.completion_tokens.unwrap_or(0),
                usage.total_tokens.unwrap_or(0),
            );
        }

        let choice = parsed.choices.and_then(|c| c.into_iter().next());
        Ok(match choice {
            Some(c) => ChatCompletion {
                content: c.message.content,
                finish_reason: c.finish_reason,
            },
            None => ChatCompletion {
                content: None,
                finish_reason: None,
            },
        })
    }
}

/// Turn a non-2xx body into a failure, keeping any vendor error code.
fn parse_error_body(status: u16, text: &str) -> TierFailure {
    match serde_json::from_str::<ApiErrorEnvelope>(text) {
        Ok(envelope) => envelope.error.into_failure(Some(status)),
        Err(_) => {
            let preview: String = text.chars().take(300).collect();
            TierFailure::http(status, format!("chat API HTTP {status}: {preview}"))
        }
    }
}
