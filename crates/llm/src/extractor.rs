//! Single-attempt extraction against an OpenAI-compatible chat endpoint.

use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    secrecy::ExposeSecret,
    serde::Deserialize,
    serde_json::json,
    tracing::debug,
};

use crate::{
    classify::{ErrorCategory, classify},
    registry::ProviderRegistry,
    types::{AttemptConfig, ExtractFailure, ExtractRequest, Extraction},
};

const SYSTEM_PROMPT: &str = "You are a structured-data extraction engine. Extract the requested \
     fields from the page content and respond with a single JSON object matching the schema. \
     Use null for fields the page does not contain. Respond with JSON only.";

/// Executes one extraction attempt.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        attempt: &AttemptConfig,
        request: &ExtractRequest,
    ) -> Result<Extraction, ExtractFailure>;
}

/// Production extractor speaking the OpenAI chat-completions dialect all
/// registered providers expose.
pub struct HttpExtractor {
    client: reqwest::Client,
    registry: Arc<ProviderRegistry>,
    timeout: Duration,
}

impl HttpExtractor {
    #[must_use]
    pub fn new(client: reqwest::Client, registry: Arc<ProviderRegistry>, timeout: Duration) -> Self {
        Self {
            client,
            registry,
            timeout,
        }
    }

    fn request_body(attempt: &AttemptConfig, request: &ExtractRequest) -> serde_json::Value {
        let mut system = SYSTEM_PROMPT.to_string();
        let response_format = if attempt.strict_mode && attempt.supports_json_mode {
            json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "extraction",
                    "schema": request.schema,
                    "strict": true,
                },
            })
        } else {
            // Lenient mode: schema rides in the prompt, any JSON object is
            // accepted back.
            system.push_str("\n\nSchema:\n");
            system.push_str(&request.schema.to_string());
            json!({"type": "json_object"})
        };

        let mut body = json!({
            "model": attempt.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": format!("URL: {}\n\n{}", request.url, request.content)},
            ],
            "response_format": response_format,
        });
        if let Some(t) = attempt.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = attempt.max_tokens {
            body["max_tokens"] = json!(m);
        }
        body
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

#[async_trait]
impl Extractor for HttpExtractor {
    async fn extract(
        &self,
        attempt: &AttemptConfig,
        request: &ExtractRequest,
    ) -> Result<Extraction, ExtractFailure> {
        let Some(provider) = self.registry.provider(&attempt.provider) else {
            return Err(ExtractFailure::new(
                ErrorCategory::ProviderError,
                format!("provider error: {} is not registered", attempt.provider),
            ));
        };

        let url = format!("{}/chat/completions", provider.base_url);
        debug!(provider = %attempt.provider, model = %attempt.model, url = %request.url, "llm extract attempt");

        let response = self
            .client
            .post(&url)
            .bearer_auth(attempt.api_key.expose_secret())
            .timeout(self.timeout)
            .json(&Self::request_body(attempt, request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExtractFailure::canonical(ErrorCategory::Timeout)
                } else {
                    ExtractFailure::new(classify(None, &e.to_string()), e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            ExtractFailure::new(classify(Some(status), &e.to_string()), e.to_string())
        })?;

        if !(200..300).contains(&status) {
            let message = serde_json::from_str::<ApiError>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            let category = classify(Some(status), &message);
            return Err(ExtractFailure::new(category, message));
        }

        let parsed: ChatResponse = serde_json::from_str(&body).map_err(|e| {
            ExtractFailure::new(
                ErrorCategory::ProviderError,
                format!("provider error: malformed completion response: {e}"),
            )
        })?;

        let content = parsed
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or_default();

        let data: serde_json::Value =
            serde_json::from_str(strip_fences(content)).map_err(|_| {
                ExtractFailure::new(
                    ErrorCategory::ProviderError,
                    "provider error: model returned non-JSON output",
                )
            })?;

        let llm_cost_usd = self.registry.cost_usd(
            &attempt.provider,
            &attempt.model,
            parsed.usage.prompt_tokens,
            parsed.usage.completion_tokens,
        );
        Ok(Extraction {
            data,
            input_tokens: parsed.usage.prompt_tokens,
            output_tokens: parsed.usage.completion_tokens,
            cost_usd: if attempt.byok { 0.0 } else { llm_cost_usd },
            llm_cost_usd,
        })
    }
}

/// Strip a single markdown code fence, which lenient-mode models love.
fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(inner) = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
    else {
        return trimmed;
    };
    inner.strip_suffix("```").unwrap_or(inner).trim()
}
