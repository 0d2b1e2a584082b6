//! Failure normalization and classification.
//!
//! Tiers report failures as a [`TierFailure`]: a transport-independent
//! descriptor carrying a [`FailureKind`], an optional HTTP status, an
//! optional backend-declared error code, and a message. The
//! [`ErrorClassifier`] maps any descriptor onto exactly one
//! [`ErrorCategory`] by evaluating a prioritized list of rules. The first
//! rule that matches wins; a descriptor no rule matches is `Unknown`.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

// ── Categories ─────────────────────────────────────────────────────

/// Closed set of error categories. Every failure classifies into exactly one.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimit,
    NetworkError,
    ServerError,
    AuthError,
    BadRequest,
    Unknown,
}

impl ErrorCategory {
    /// All categories, in declaration order.
    pub const ALL: [ErrorCategory; 6] = [
        ErrorCategory::RateLimit,
        ErrorCategory::NetworkError,
        ErrorCategory::ServerError,
        ErrorCategory::AuthError,
        ErrorCategory::BadRequest,
        ErrorCategory::Unknown,
    ];

    /// Whether failures in this category may ever be retried. Auth and
    /// bad-request failures are final no matter how retries are configured.
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorCategory::AuthError | ErrorCategory::BadRequest)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::NetworkError => "network_error",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::AuthError => "auth_error",
            ErrorCategory::BadRequest => "bad_request",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string names no [`ErrorCategory`].
#[derive(Debug, Error)]
#[error("unknown error category: {0}")]
pub struct UnknownCategory(pub String);

impl FromStr for ErrorCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        ErrorCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

// ── Failure descriptor ─────────────────────────────────────────────

/// What went wrong, independent of the transport library that saw it.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The backend explicitly signalled throttling.
    RateLimited,
    /// The call exceeded its deadline.
    Timeout,
    /// Could not establish a connection (refused, DNS, TLS handshake).
    Connect,
    /// The connection broke while sending or receiving.
    Transport,
    /// The backend answered with a non-success HTTP status.
    Http,
    /// The request itself was malformed.
    InvalidInput,
    /// The backend answered but the payload could not be understood.
    Parse,
    Other,
}

/// A normalized tier failure.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct TierFailure {
    pub kind: FailureKind,
    pub status: Option<u16>,
    /// Backend-declared error code, e.g. `"auth_error"`.
    pub code: Option<String>,
    pub message: String,
}

impl TierFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            code: None,
            message: message.into(),
        }
    }

    /// A non-success HTTP response.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(FailureKind::Http, message)
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("call timed out after {}ms", after.as_millis()),
        )
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(FailureKind::RateLimited, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidInput, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Parse, message)
    }

    /// Attach a backend-declared error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl From<reqwest::Error> for TierFailure {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            FailureKind::Timeout
        } else if err.is_connect() {
            FailureKind::Connect
        } else if err.is_decode() {
            FailureKind::Parse
        } else if err.is_builder() {
            FailureKind::InvalidInput
        } else if err.is_request() || err.is_body() {
            FailureKind::Transport
        } else if err.is_status() {
            FailureKind::Http
        } else {
            FailureKind::Other
        };
        Self {
            kind,
            status: err.status().map(|s| s.as_u16()),
            code: None,
            message: format!("request failed: {err}"),
        }
    }
}

// ── Classifier ─────────────────────────────────────────────────────

/// A named predicate that may assign a category.
#[derive(Clone, Copy)]
pub struct ClassificationRule {
    pub name: &'static str,
    pub matches: fn(&TierFailure) -> Option<ErrorCategory>,
}

impl std::fmt::Debug for ClassificationRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassificationRule")
            .field("name", &self.name)
            .finish()
    }
}

fn rate_limit_signal(f: &TierFailure) -> Option<ErrorCategory> {
    (f.kind == FailureKind::RateLimited || f.status == Some(429)).then_some(ErrorCategory::RateLimit)
}

fn declared_code(f: &TierFailure) -> Option<ErrorCategory> {
    f.code.as_deref().and_then(|c| c.parse().ok())
}

fn transport_layer(f: &TierFailure) -> Option<ErrorCategory> {
    matches!(
        f.kind,
        FailureKind::Timeout | FailureKind::Connect | FailureKind::Transport
    )
    .then_some(ErrorCategory::NetworkError)
}

fn server_status(f: &TierFailure) -> Option<ErrorCategory> {
    f.status
        .filter(|s| (500..600).contains(s))
        .map(|_| ErrorCategory::ServerError)
}

fn auth_status(f: &TierFailure) -> Option<ErrorCategory> {
    matches!(f.status, Some(401 | 403)).then_some(ErrorCategory::AuthError)
}

fn malformed_input(f: &TierFailure) -> Option<ErrorCategory> {
    (f.kind == FailureKind::InvalidInput || matches!(f.status, Some(400 | 404 | 422)))
        .then_some(ErrorCategory::BadRequest)
}

/// Rules in evaluation order.
pub const DEFAULT_RULES: &[ClassificationRule] = &[
    ClassificationRule {
        name: "rate_limit_signal",
        matches: rate_limit_signal,
    },
    ClassificationRule {
        name: "declared_code",
        matches: declared_code,
    },
    ClassificationRule {
        name: "transport_layer",
        matches: transport_layer,
    },
    ClassificationRule {
        name: "server_status",
        matches: server_status,
    },
    ClassificationRule {
        name: "auth_status",
        matches: auth_status,
    },
    ClassificationRule {
        name: "malformed_input",
        matches: malformed_input,
    },
];

/// Maps failures to categories. Pure and total.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    rules: Vec<ClassificationRule>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self {
            rules: DEFAULT_RULES.to_vec(),
        }
    }
}

impl ErrorClassifier {
    /// A classifier with a custom rule list. An empty list classifies
    /// everything as `Unknown`.
    pub fn with_rules(rules: Vec<ClassificationRule>) -> Self {
        Self { rules }
    }

    pub fn classify(&self, failure: &TierFailure) -> ErrorCategory {
        self.rules
            .iter()
            .find_map(|rule| (rule.matches)(failure))
            .unwrap_or(ErrorCategory::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(f: &TierFailure) -> ErrorCategory {
        ErrorClassifier::default().classify(f)
    }

    #[test]
    fn rate_limit_beats_everything() {
        let f = TierFailure::http(429, "slow down").with_code("server_error");
        assert_eq!(classify(&f), ErrorCategory::RateLimit);
        assert_eq!(
            classify(&TierFailure::rate_limited("quota")),
            ErrorCategory::RateLimit
        );
    }

    #[test]
    fn declared_code_used_verbatim() {
        let f = TierFailure::http(500, "nope").with_code("auth_error");
        assert_eq!(classify(&f), ErrorCategory::AuthError);
        let f = TierFailure::new(FailureKind::Timeout, "t").with_code("BAD_REQUEST");
        assert_eq!(classify(&f), ErrorCategory::BadRequest);
    }

    #[test]
    fn unrecognized_code_falls_through_to_later_rules() {
        let f = TierFailure::http(503, "unavailable").with_code("overloaded");
        assert_eq!(classify(&f), ErrorCategory::ServerError);
    }

    #[test]
    fn transport_failures_are_network_errors() {
        for kind in [FailureKind::Timeout, FailureKind::Connect, FailureKind::Transport] {
            assert_eq!(
                classify(&TierFailure::new(kind, "x")),
                ErrorCategory::NetworkError
            );
        }
        assert_eq!(
            classify(&TierFailure::timeout(Duration::from_secs(30))),
            ErrorCategory::NetworkError
        );
    }

    #[test]
    fn http_statuses() {
        assert_eq!(classify(&TierFailure::http(502, "")), ErrorCategory::ServerError);
        assert_eq!(classify(&TierFailure::http(401, "")), ErrorCategory::AuthError);
        assert_eq!(classify(&TierFailure::http(403, "")), ErrorCategory::AuthError);
        assert_eq!(classify(&TierFailure::http(422, "")), ErrorCategory::BadRequest);
        assert_eq!(classify(&TierFailure::http(418, "")), ErrorCategory::Unknown);
    }

    #[test]
    fn malformed_input_is_bad_request() {
        assert_eq!(
            classify(&TierFailure::invalid_input("illegal argument")),
            ErrorCategory::BadRequest
        );
    }

    #[test]
    fn everything_else_is_unknown() {
        assert_eq!(classify(&TierFailure::parse("garbage")), ErrorCategory::Unknown);
        assert_eq!(
            classify(&TierFailure::new(FailureKind::Other, "")),
            ErrorCategory::Unknown
        );
        assert_eq!(
            ErrorClassifier::with_rules(vec![]).classify(&TierFailure::http(429, "")),
            ErrorCategory::Unknown
        );
    }

    #[test]
    fn category_round_trips_through_str() {
        for c in ErrorCategory::ALL {
            assert_eq!(c.as_str().parse::<ErrorCategory>().unwrap(), c);
        }
        assert!("teapot".parse::<ErrorCategory>().is_err());
    }
}
