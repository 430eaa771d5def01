use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed classification attached to every error raised by the crate.
///
/// Dialects translate backend-native failures into one of these kinds at the HTTP
/// boundary. The orchestrator looks only at the kind (and the rate-limit retry hint)
/// when it decides whether to back off, fall back, or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimit,
    InvalidRequest,
    ContextLimit,
    Authentication,
    ContentFilter,
    ApiError,
    Timeout,
    Unknown,
}

impl ErrorKind {
    /// Whether the same request may succeed if sent again.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RateLimit | Self::ApiError | Self::Timeout)
    }

    /// Whether another backend may still serve the request after this failure.
    ///
    /// Malformed input and policy refusals are properties of the content, so trying
    /// the next backend would only repeat them.
    pub fn allows_fallback(self) -> bool {
        !matches!(self, Self::InvalidRequest | Self::ContentFilter)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::InvalidRequest => "invalid_request",
            Self::ContextLimit => "context_limit",
            Self::Authentication => "authentication",
            Self::ContentFilter => "content_filter",
            Self::ApiError => "api_error",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregates every failure mode exposed by the relay.
///
/// Single-backend failures map one-to-one onto an [`ErrorKind`]. The two aggregate
/// variants, [`LLMError::AllBackendsFailed`] and [`LLMError::NoBackendAvailable`], are only
/// produced by the orchestrator and let callers tell "nothing could serve this" apart from
/// "this backend rejected the content".
#[derive(Debug, Error)]
pub enum LLMError {
    /// Represents transport-layer or networking failures.
    #[error("transport error: {message}")]
    Transport { message: String },
    /// Reports invalid or missing credentials.
    #[error("auth failure: {message}")]
    Auth { message: String },
    /// Indicates that the backend (or the local admission check) throttled the request.
    #[error("rate limited: {message}")]
    RateLimit {
        /// Raw message returned by the upstream provider.
        message: String,
        /// Optional wait duration before the backend is expected to admit requests again.
        retry_after: Option<Duration>,
    },
    /// Indicates that the prompt or expected completion exceeds the backend's context window.
    #[error("context limit exceeded: {message}")]
    ContextLimit {
        /// Raw message returned by the provider, kept verbatim for debugging.
        message: String,
        /// Estimated tokens in the request, if known.
        estimated: Option<usize>,
        /// Reported limit, if available.
        limit: Option<usize>,
    },
    /// Signals validation failures in the request payload.
    #[error("invalid request: {message}")]
    Validation { message: String },
    /// The backend refused to answer on policy grounds.
    #[error("content filtered: {message}")]
    ContentFilter { message: String },
    /// Backend-side fault (5xx, malformed payload, unexpected status).
    #[error("provider {provider} error: {message}")]
    Provider {
        /// Backend identifier such as `openai-primary`.
        provider: String,
        /// HTTP status reported by the backend, when there was one.
        status: Option<u16>,
        /// Human-readable error message returned by the provider.
        message: String,
    },
    /// The backend or transport gave up waiting.
    #[error("timed out: {message}")]
    Timeout { message: String },
    /// Signals that a streaming channel closed before delivering its terminal event.
    #[error("stream closed unexpectedly: {message}")]
    StreamClosed { message: String },
    /// Raised when building or validating configuration fails.
    #[error("invalid configuration for {field}: {reason}")]
    InvalidConfig {
        /// Name of the configuration field that failed validation.
        field: String,
        /// Additional context explaining why the field is invalid.
        reason: String,
    },
    /// No enabled, admissible backend existed, so nothing was attempted.
    #[error("no backend available: {message}")]
    NoBackendAvailable {
        message: String,
        /// Shortest wait until a rate-limited backend frees up, if that was the cause.
        retry_after: Option<Duration>,
    },
    /// Every attempt in the fallback chain failed.
    #[error("all backends failed after {attempts} attempt(s) [{}]: {last}", .tried.join(", "))]
    AllBackendsFailed {
        attempts: u32,
        /// Backends attempted, in order, with repeats.
        tried: Vec<String>,
        /// Error observed on the final attempt.
        last: Box<LLMError>,
    },
    /// Catches opaque or unexpected failures.
    #[error("unknown error: {message}")]
    Unknown {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl LLMError {
    /// Creates an [`LLMError::Transport`] from a textual description.
    ///
    /// ```
    /// use llm_relay::error::{ErrorKind, LLMError};
    ///
    /// let err = LLMError::transport("dns lookup failed");
    /// assert_eq!(err.kind(), ErrorKind::ApiError);
    /// assert!(err.is_retryable());
    /// ```
    pub fn transport<T: Into<String>>(message: T) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Creates an [`LLMError::Provider`] for a backend-side fault without an HTTP status.
    pub fn provider<P: Into<String>, T: Into<String>>(provider: P, message: T) -> Self {
        Self::Provider {
            provider: provider.into(),
            status: None,
            message: message.into(),
        }
    }

    /// Builds the variant that corresponds to `kind`.
    ///
    /// Dialect error tables resolve a kind first and then call this helper, so every
    /// backend produces identically shaped errors.
    pub fn classified(
        kind: ErrorKind,
        provider: &str,
        status: Option<u16>,
        message: String,
        retry_after: Option<Duration>,
    ) -> Self {
        match kind {
            ErrorKind::RateLimit => Self::RateLimit {
                message,
                retry_after,
            },
            ErrorKind::InvalidRequest => Self::Validation { message },
            ErrorKind::ContextLimit => Self::ContextLimit {
                message,
                estimated: None,
                limit: None,
            },
            ErrorKind::Authentication => Self::Auth { message },
            ErrorKind::ContentFilter => Self::ContentFilter { message },
            ErrorKind::ApiError => Self::Provider {
                provider: provider.to_string(),
                status,
                message,
            },
            ErrorKind::Timeout => Self::Timeout { message },
            ErrorKind::Unknown => Self::Unknown {
                message: match status {
                    Some(status) => format!("{provider} returned status {status}: {message}"),
                    None => format!("{provider}: {message}"),
                },
                source: None,
            },
        }
    }

    /// Taxonomy bucket for this error. Aggregates report the kind of their last failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } | Self::Provider { .. } | Self::StreamClosed { .. } => {
                ErrorKind::ApiError
            }
            Self::Auth { .. } => ErrorKind::Authentication,
            Self::RateLimit { .. } => ErrorKind::RateLimit,
            Self::ContextLimit { .. } => ErrorKind::ContextLimit,
            Self::Validation { .. } => ErrorKind::InvalidRequest,
            Self::ContentFilter { .. } => ErrorKind::ContentFilter,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::InvalidConfig { .. } | Self::NoBackendAvailable { .. } | Self::Unknown { .. } => {
                ErrorKind::Unknown
            }
            Self::AllBackendsFailed { last, .. } => last.kind(),
        }
    }

    /// Whether retrying the same call may succeed.
    ///
    /// Aggregate errors always report `false`: the orchestrator already spent its retry
    /// budget before producing them.
    pub fn is_retryable(&self) -> bool {
        !self.is_exhausted() && self.kind().is_retryable()
    }

    /// True for the orchestrator's "nothing could serve this request" errors.
    pub fn is_exhausted(&self) -> bool {
        matches!(
            self,
            Self::AllBackendsFailed { .. } | Self::NoBackendAvailable { .. }
        )
    }

    /// Suggested wait before retrying, when the failure carried one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimit { retry_after, .. } | Self::NoBackendAvailable { retry_after, .. } => {
                *retry_after
            }
            Self::AllBackendsFailed { last, .. } => last.retry_after(),
            _ => None,
        }
    }
}

/// Returns `true` when an error code or message suggests a context/window overflow.
pub(crate) fn looks_like_token_limit_error(code_hint: Option<&str>, message: &str) -> bool {
    if let Some(code) = code_hint {
        let lower = code.to_ascii_lowercase();
        if matches!(
            lower.as_str(),
            "context_length_exceeded"
                | "max_context_length_exceeded"
                | "prompt_tokens_exceeded"
                | "context_window_exceeded"
        ) {
            return true;
        }
    }

    let lower_message = message.to_ascii_lowercase();
    const HINTS: [&str; 7] = [
        "context length",
        "context window",
        "token limit",
        "maximum context",
        "too many tokens",
        "prompt is too long",
        "maximum number of tokens",
    ];
    HINTS.iter().any(|needle| lower_message.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds_are_rate_limit_api_error_and_timeout() {
        let retryable: Vec<ErrorKind> = [
            ErrorKind::RateLimit,
            ErrorKind::InvalidRequest,
            ErrorKind::ContextLimit,
            ErrorKind::Authentication,
            ErrorKind::ContentFilter,
            ErrorKind::ApiError,
            ErrorKind::Timeout,
            ErrorKind::Unknown,
        ]
        .into_iter()
        .filter(|kind| kind.is_retryable())
        .collect();

        assert_eq!(
            retryable,
            vec![ErrorKind::RateLimit, ErrorKind::ApiError, ErrorKind::Timeout]
        );
    }

    #[test]
    fn classified_round_trips_kind() {
        for kind in [
            ErrorKind::RateLimit,
            ErrorKind::InvalidRequest,
            ErrorKind::ContextLimit,
            ErrorKind::Authentication,
            ErrorKind::ContentFilter,
            ErrorKind::ApiError,
            ErrorKind::Timeout,
            ErrorKind::Unknown,
        ] {
            let err = LLMError::classified(kind, "alpha", Some(500), "boom".into(), None);
            assert_eq!(err.kind(), kind, "variant built for {kind} reported {err:?}");
        }
    }

    #[test]
    fn aggregate_reports_last_kind_but_is_not_retryable() {
        let err = LLMError::AllBackendsFailed {
            attempts: 3,
            tried: vec!["alpha".into(), "beta".into(), "alpha".into()],
            last: Box::new(LLMError::RateLimit {
                message: "slow down".into(),
                retry_after: Some(Duration::from_secs(7)),
            }),
        };

        assert_eq!(err.kind(), ErrorKind::RateLimit);
        assert!(err.is_exhausted());
        assert!(!err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert!(err.to_string().contains("alpha, beta, alpha"));
    }

    #[test]
    fn token_limit_heuristic_matches_codes_and_messages() {
        assert!(looks_like_token_limit_error(
            Some("context_length_exceeded"),
            "whatever"
        ));
        assert!(looks_like_token_limit_error(
            None,
            "This model's maximum context length is 8192 tokens"
        ));
        assert!(!looks_like_token_limit_error(Some("invalid_api_key"), "bad key"));
    }
}
