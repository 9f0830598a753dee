//! Provider capabilities and per-model price table.
//!
//! The built-in tables cover the providers the platform ships keys for.
//! Readers clone an `Arc` out of a `RwLock`; refresh-time writers swap the
//! whole map.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use serde::Serialize;

/// What a provider's OpenAI-compatible endpoint supports.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub supports_tools: bool,
    pub supports_json_mode: bool,
    pub supports_vision: bool,
    pub supports_streaming: bool,
}

/// USD per 1M tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModelPrice {
    pub prompt_per_1m: f64,
    pub completion_per_1m: f64,
}

fn builtin_providers() -> HashMap<String, ProviderInfo> {
    let entry = |id: &str, name: &str, base_url: &str, vision: bool| {
        (id.to_string(), ProviderInfo {
            id: id.to_string(),
            name: name.to_string(),
            base_url: base_url.to_string(),
            supports_tools: true,
            supports_json_mode: true,
            supports_vision: vision,
            supports_streaming: true,
        })
    };
    HashMap::from([
        entry("openai", "OpenAI", "https://api.openai.com/v1", true),
        entry("openrouter", "OpenRouter", "https://openrouter.ai/api/v1", true),
        entry("groq", "Groq", "https://api.groq.com/openai/v1", false),
        entry("deepseek", "DeepSeek", "https://api.deepseek.com/v1", false),
    ])
}

fn builtin_prices() -> HashMap<(String, String), ModelPrice> {
    let entry = |provider: &str, model: &str, prompt: f64, completion: f64| {
        ((provider.to_string(), model.to_string()), ModelPrice {
            prompt_per_1m: prompt,
            completion_per_1m: completion,
        })
    };
    HashMap::from([
        entry("openai", "gpt-4o", 2.50, 10.00),
        entry("openai", "gpt-4o-mini", 0.15, 0.60),
        entry("openai", "gpt-3.5-turbo", 0.50, 1.50),
        entry("openrouter", "anthropic/claude-3-5-sonnet", 3.00, 15.00),
        entry("openrouter", "claude-3-5-sonnet", 3.00, 15.00),
        entry("openrouter", "anthropic/claude-3-5-haiku", 0.80, 4.00),
        entry("openrouter", "meta-llama/llama-3.1-70b-instruct", 0.59, 0.79),
        entry("groq", "llama-3.3-70b-versatile", 0.59, 0.79),
        entry("deepseek", "deepseek-chat", 0.27, 1.10),
    ])
}

/// Capability and price lookups.
pub struct ProviderRegistry {
    providers: RwLock<Arc<HashMap<String, ProviderInfo>>>,
    prices: RwLock<Arc<HashMap<(String, String), ModelPrice>>>,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(Arc::new(builtin_providers())),
            prices: RwLock::new(Arc::new(builtin_prices())),
        }
    }

    #[must_use]
    pub fn provider(&self, id: &str) -> Option<ProviderInfo> {
        read(&self.providers).get(id).cloned()
    }

    #[must_use]
    pub fn providers(&self) -> Vec<ProviderInfo> {
        let mut all: Vec<ProviderInfo> = read(&self.providers).values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Models with known prices for a provider.
    #[must_use]
    pub fn models(&self, provider: &str) -> Vec<String> {
        let mut models: Vec<String> = read(&self.prices)
            .keys()
            .filter(|(p, _)| p == provider)
            .map(|(_, m)| m.clone())
            .collect();
        models.sort();
        models
    }

    #[must_use]
    pub fn price(&self, provider: &str, model: &str) -> Option<ModelPrice> {
        read(&self.prices)
            .get(&(provider.to_string(), model.to_string()))
            .copied()
    }

    /// Cost of a completion. Unknown models cost zero rather than failing
    /// the extraction.
    #[must_use]
    pub fn cost_usd(&self, provider: &str, model: &str, input_tokens: i64, output_tokens: i64) -> f64 {
        let Some(price) = self.price(provider, model) else {
            return 0.0;
        };
        (input_tokens as f64 / 1_000_000.0) * price.prompt_per_1m
            + (output_tokens as f64 / 1_000_000.0) * price.completion_per_1m
    }

    /// Replace the price table (refresh-time only).
    pub fn set_prices(&self, prices: HashMap<(String, String), ModelPrice>) {
        *self
            .prices
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::new(prices);
    }

    /// Replace the provider table (refresh-time only; tests point base
    /// URLs at a local server).
    pub fn set_providers(&self, providers: HashMap<String, ProviderInfo>) {
        *self
            .providers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Arc::new(providers);
    }
}

fn read<T: Clone>(lock: &RwLock<T>) -> T {
    lock.read()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone()
}
