//! Startup configuration.
//!
//! [`ResilienceConfig`] gathers every tunable: breaker thresholds, the
//! per-category retry table, cache bounds, local-tier gating, the per-call
//! timeout, and the remote endpoint. Values come from defaults, then an
//! optional JSON file, then `TIERGUARD_*` environment variables, in that
//! order. Configuration is read once; there is no hot reload.

use crate::cache::CacheConfig;
use crate::resilience::{BreakerConfig, ErrorCategory, RetryPolicy, RetryPolicyTable, UnknownCategory};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default generation budget per remote call.
pub const DEFAULT_MAX_TOKENS: u32 = 512;

/// Default sampling temperature for remote calls.
pub const DEFAULT_TEMPERATURE: f32 = 0.3;

/// Default per-call timeout for remote tiers.
pub const DEFAULT_TIER_TIMEOUT: Duration = Duration::from_secs(30);

/// Environment variable holding the remote API key.
pub const DEFAULT_API_KEY_ENV: &str = "OPENROUTER_KEY";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
    #[error("{0} environment variable is not set")]
    MissingApiKey(String),
    #[error("failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    UnknownCategory(#[from] UnknownCategory),
    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

// ── Remote endpoint ────────────────────────────────────────────────

/// Where and how the remote tiers call out.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteConfig {
    pub base_url: String,
    /// Name of the environment variable that holds the API key.
    pub api_key_env: String,
    pub primary_model: String,
    pub fallback_model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: crate::OPENROUTER_URL.to_string(),
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            primary_model: crate::DEFAULT_PRIMARY_MODEL.to_string(),
            fallback_model: crate::DEFAULT_FALLBACK_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

impl RemoteConfig {
    /// Read the API key from the configured environment variable.
    pub fn api_key(&self) -> Result<String, ConfigError> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ConfigError::MissingApiKey(self.api_key_env.clone()))
    }
}

// ── Top-level config ───────────────────────────────────────────────

/// Everything the orchestrator needs, fixed at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct ResilienceConfig {
    pub breaker: BreakerConfig,
    pub retry: RetryPolicyTable,
    pub cache: CacheConfig,
    /// Whether the local tier is consulted at all. Default: `true`.
    pub local_enabled: bool,
    /// Operator-wide floor on local confidence, applied on top of each
    /// request's own threshold. Default: `0.0`.
    pub local_confidence_floor: f64,
    /// Timeout for each remote call. Default: 30s.
    pub tier_timeout: Duration,
    pub remote: RemoteConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            retry: RetryPolicyTable::default(),
            cache: CacheConfig::default(),
            local_enabled: true,
            local_confidence_floor: 0.0,
            tier_timeout: DEFAULT_TIER_TIMEOUT,
            remote: RemoteConfig::default(),
        }
    }
}

impl ResilienceConfig {
    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_retry_policy(mut self, category: ErrorCategory, policy: RetryPolicy) -> Self {
        self.retry = self.retry.with_policy(category, policy);
        self
    }

    pub fn with_retry_table(mut self, table: RetryPolicyTable) -> Self {
        self.retry = table;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_local_enabled(mut self, enabled: bool) -> Self {
        self.local_enabled = enabled;
        self
    }

    pub fn with_local_confidence_floor(mut self, floor: f64) -> Self {
        self.local_confidence_floor = floor;
        self
    }

    pub fn with_tier_timeout(mut self, timeout: Duration) -> Self {
        self.tier_timeout = timeout;
        self
    }

    pub fn with_remote(mut self, remote: RemoteConfig) -> Self {
        self.remote = remote;
        self
    }

    /// Defaults overlaid with `TIERGUARD_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay_env(|key| std::env::var(key).ok())
    }

    /// Defaults, then the JSON file at `path` (if any), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(p) => Self::from_json_file(p)?,
            None => Self::default(),
        };
        base.overlay_env(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Defaults overlaid with a JSON document. Omitted keys keep their defaults.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = serde_json::from_str(text)?;
        file.apply(Self::default())
    }

    /// Overlay values from `lookup`, which maps variable names to values.
    pub fn overlay_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        if let Some(v) = env.parse("TIERGUARD_BREAKER_FAILURE_THRESHOLD")? {
            self.breaker.failure_threshold = v;
        }
        if let Some(v) = env.parse("TIERGUARD_BREAKER_SUCCESS_THRESHOLD")? {
            self.breaker.success_threshold = v;
        }
        if let Some(v) = env.parse("TIERGUARD_BREAKER_COOL_DOWN_SECS")? {
            self.breaker.cool_down = Duration::from_secs(v);
        }
        if let Some(v) = env.parse("TIERGUARD_CACHE_TTL_SECS")? {
            self.cache.ttl = Duration::from_secs(v);
        }
        if let Some(v) = env.parse("TIERGUARD_CACHE_MAX_ENTRIES")? {
            self.cache.max_entries = v;
        }
        if let Some(v) = env.flag("TIERGUARD_LOCAL_ENABLED")? {
            self.local_enabled = v;
        }
        if let Some(v) = env.parse("TIERGUARD_LOCAL_CONFIDENCE_FLOOR")? {
            self.local_confidence_floor = unit_interval("TIERGUARD_LOCAL_CONFIDENCE_FLOOR", v)?;
        }
        if let Some(v) = env.parse("TIERGUARD_TIER_TIMEOUT_SECS")? {
            self.tier_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env.string("TIERGUARD_BASE_URL") {
            self.remote.base_url = v;
        }
        if let Some(v) = env.string("TIERGUARD_API_KEY_ENV") {
            self.remote.api_key_env = v;
        }
        if let Some(v) = env.string("TIERGUARD_PRIMARY_MODEL") {
            self.remote.primary_model = v;
        }
        if let Some(v) = env.string("TIERGUARD_FALLBACK_MODEL") {
            self.remote.fallback_model = v;
        }
        if let Some(v) = env.parse("TIERGUARD_MAX_TOKENS")? {
            self.remote.max_tokens = v;
        }
        if let Some(v) = env.parse("TIERGUARD_TEMPERATURE")? {
            self.remote.temperature = v;
        }
        Ok(self)
    }
}

fn unit_interval(key: &str, v: f64) -> Result<f64, ConfigError> {
    if (0.0..=1.0).contains(&v) {
        Ok(v)
    } else {
        Err(ConfigError::Invalid {
            key: key.to_string(),
            value: v.to_string(),
            reason: "must be within [0, 1]".into(),
        })
    }
}

struct EnvReader<F: Fn(&str) -> Option<String>> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(key)
            .map(|raw| {
                raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
                    key: key.to_string(),
                    value: raw.clone(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    fn flag(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        self.string(key)
            .map(|raw| match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    key: key.to_string(),
                    value: raw.clone(),
                    reason: "expected a boolean".into(),
                }),
            })
            .transpose()
    }
}

// ── JSON file format ───────────────────────────────────────────────

#[derive(Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    breaker: Option<FileBreaker>,
    retry: BTreeMap<String, FileRetryPolicy>,
    cache: Option<FileCache>,
    local_enabled: Option<bool>,
    local_confidence_floor: Option<f64>,
    tier_timeout_secs: Option<u64>,
    remote: Option<FileRemote>,
}

#[derive(Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct FileBreaker {
    failure_threshold: Option<u32>,
    success_threshold: Option<u32>,
    cool_down_secs: Option<u64>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRetryPolicy {
    max_attempts: u32,
    base_delay_ms: u64,
    #[serde(default = "default_true")]
    retryable: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct FileCache {
    ttl_secs: Option<u64>,
    max_entries: Option<usize>,
}

#[derive(Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct FileRemote {
    base_url: Option<String>,
    api_key_env: Option<String>,
    primary_model: Option<String>,
    fallback_model: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

impl FileConfig {
    fn apply(self, mut config: ResilienceConfig) -> Result<ResilienceConfig, ConfigError> {
        if let Some(b) = self.breaker {
            if let Some(v) = b.failure_threshold {
                config.breaker.failure_threshold = v;
            }
            if let Some(v) = b.success_threshold {
                config.breaker.success_threshold = v;
            }
            if let Some(v) = b.cool_down_secs {
                config.breaker.cool_down = Duration::from_secs(v);
            }
        }
        for (name, p) in self.retry {
            let category: ErrorCategory = name.parse()?;
            config.retry = config.retry.with_policy(
                category,
                RetryPolicy {
                    max_attempts: p.max_attempts,
                    base_delay: Duration::from_millis(p.base_delay_ms),
                    retryable: p.retryable,
                },
            );
        }
        if let Some(c) = self.cache {
            if let Some(v) = c.ttl_secs {
                config.cache.ttl = Duration::from_secs(v);
            }
            if let Some(v) = c.max_entries {
                config.cache.max_entries = v;
            }
        }
        if let Some(v) = self.local_enabled {
            config.local_enabled = v;
        }
        if let Some(v) = self.local_confidence_floor {
            config.local_confidence_floor = unit_interval("local_confidence_floor", v)?;
        }
        if let Some(v) = self.tier_timeout_secs {
            config.tier_timeout = Duration::from_secs(v);
        }
        if let Some(r) = self.remote {
            let remote = &mut config.remote;
            if let Some(v) = r.base_url {
                remote.base_url = v;
            }
            if let Some(v) = r.api_key_env {
                remote.api_key_env = v;
            }
            if let Some(v) = r.primary_model {
                remote.primary_model = v;
            }
            if let Some(v) = r.fallback_model {
                remote.fallback_model = v;
            }
            if let Some(v) = r.max_tokens {
                remote.max_tokens = v;
            }
            if let Some(v) = r.temperature {
                remote.temperature = v;
            }
        }
        Ok(config)
    }
}
