//! Attempt configuration and extraction results.

use {
    secrecy::{ExposeSecret, SecretString},
    serde::{Deserialize, Serialize},
};

use crate::classify::ErrorCategory;

/// One fully-hydrated extraction attempt: a chain entry joined with its
/// credential and capability metadata. A job's frozen chain is a list of
/// these, serialized onto the job row at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptConfig {
    pub provider: String,
    pub model: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Strict mode requires the provider to honor declared structured
    /// output; a mismatch is fatal for the entry, never patched locally.
    pub strict_mode: bool,
    /// Whether this attempt runs on a tenant-owned key.
    pub byok: bool,
    /// The credential. Serialized with the snapshot so tier/key edits
    /// mid-run cannot affect an active job.
    #[serde(
        serialize_with = "serialize_secret",
        deserialize_with = "deserialize_secret"
    )]
    pub api_key: SecretString,
    /// SHA-256 of the key, for suspension bookkeeping.
    pub api_key_hash: String,
    pub supports_tools: bool,
    pub supports_json_mode: bool,
}

fn serialize_secret<S: serde::Serializer>(
    secret: &SecretString,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

fn deserialize_secret<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> Result<SecretString, D::Error> {
    Ok(SecretString::new(String::deserialize(deserializer)?))
}

/// Input to one extraction attempt.
#[derive(Debug, Clone)]
pub struct ExtractRequest {
    pub url: String,
    pub content: String,
    pub schema: serde_json::Value,
}

/// Successful extraction with usage and cost.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub data: serde_json::Value,
    pub input_tokens: i64,
    pub output_tokens: i64,
    /// Cost charged to the tenant; zero on BYOK keys.
    pub cost_usd: f64,
    /// Actual upstream spend, recorded regardless of BYOK.
    pub llm_cost_usd: f64,
}

/// Classified extraction failure.
#[derive(Debug, Clone)]
pub struct ExtractFailure {
    pub message: String,
    pub category: ErrorCategory,
}

impl ExtractFailure {
    #[must_use]
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category,
        }
    }

    /// A failure carrying the category's canonical message.
    #[must_use]
    pub fn canonical(category: ErrorCategory) -> Self {
        Self::new(category, category.canonical_message())
    }
}

impl std::fmt::Display for ExtractFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.category, self.message)
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_config_snapshot_round_trips_with_key() {
        let attempt = AttemptConfig {
            provider: "openrouter".into(),
            model: "anthropic/claude-3-5-sonnet".into(),
            temperature: Some(0.1),
            max_tokens: Some(8192),
            strict_mode: true,
            byok: false,
            api_key: SecretString::new("sk-or-v1-abc".into()),
            api_key_hash: "deadbeef".into(),
            supports_tools: true,
            supports_json_mode: true,
        };

        let json = serde_json::to_string(&attempt).unwrap();
        let back: AttemptConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.provider, "openrouter");
        assert_eq!(back.api_key.expose_secret(), "sk-or-v1-abc");
        assert!(back.strict_mode);
    }
}
