//! Provider/transport error classification.
//!
//! Every extraction failure maps to one category from a closed set; retry
//! and fallback decisions key off the category alone, never off free text.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimit,
    ModelUnsupported,
    InvalidKey,
    QuotaExceeded,
    ProviderError,
    ContentTooLong,
    Timeout,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: &'static [Self] = &[
        Self::RateLimit,
        Self::ModelUnsupported,
        Self::InvalidKey,
        Self::QuotaExceeded,
        Self::ProviderError,
        Self::ContentTooLong,
        Self::Timeout,
        Self::Unknown,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::ModelUnsupported => "model_unsupported",
            Self::InvalidKey => "invalid_key",
            Self::QuotaExceeded => "quota_exceeded",
            Self::ProviderError => "provider_error",
            Self::ContentTooLong => "content_too_long",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rate_limit" => Some(Self::RateLimit),
            "model_unsupported" => Some(Self::ModelUnsupported),
            "invalid_key" => Some(Self::InvalidKey),
            "quota_exceeded" => Some(Self::QuotaExceeded),
            "provider_error" => Some(Self::ProviderError),
            "content_too_long" => Some(Self::ContentTooLong),
            "timeout" => Some(Self::Timeout),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// A short message that classifies back to the same category. Used when
    /// the service synthesizes an error rather than relaying a provider's.
    #[must_use]
    pub fn canonical_message(self) -> &'static str {
        match self {
            Self::RateLimit => "rate limit exceeded",
            Self::ModelUnsupported => "model does not support response_format",
            Self::InvalidKey => "invalid key",
            Self::QuotaExceeded => "quota exhausted",
            Self::ProviderError => "provider error",
            Self::ContentTooLong => "context length exceeded",
            Self::Timeout => "request timed out",
            Self::Unknown => "unrecognized error",
        }
    }

    /// Whether the same chain entry is worth retrying.
    #[must_use]
    pub fn retryable_with_same_model(self) -> bool {
        matches!(self, Self::RateLimit | Self::ProviderError | Self::Timeout)
    }

    /// Whether the next chain entry should be tried after retries run out.
    #[must_use]
    pub fn should_fallback(self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::ModelUnsupported | Self::ProviderError | Self::Timeout
        )
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an extraction failure from its HTTP status (if any) and message.
///
/// Rules apply top-down; the first match wins.
#[must_use]
pub fn classify(status: Option<u16>, message: &str) -> ErrorCategory {
    let msg = message.to_lowercase();

    if status == Some(429)
        || msg.contains("rate limit")
        || msg.contains("rate_limit")
        || msg.contains("too many requests")
    {
        return ErrorCategory::RateLimit;
    }

    if matches!(status, Some(401 | 403))
        || msg.contains("invalid key")
        || msg.contains("invalid api key")
        || msg.contains("invalid_api_key")
        || msg.contains("unauthorized")
    {
        return ErrorCategory::InvalidKey;
    }

    if msg.contains("quota") || msg.contains("insufficient credit") || msg.contains("billing") {
        return ErrorCategory::QuotaExceeded;
    }

    if msg.contains("context length")
        || msg.contains("context_length")
        || msg.contains("token limit")
        || msg.contains("maximum context")
    {
        return ErrorCategory::ContentTooLong;
    }

    if (msg.contains("does not support")
        && (msg.contains("response_format") || msg.contains("tools") || msg.contains("json")))
        || msg.contains("unsupported response_format")
    {
        return ErrorCategory::ModelUnsupported;
    }

    if msg.contains("timed out") || msg.contains("timeout") || msg.contains("deadline") {
        return ErrorCategory::Timeout;
    }

    if status.is_some() || msg.contains("provider error") || msg.contains("server error") {
        return ErrorCategory::ProviderError;
    }

    ErrorCategory::Unknown
}
