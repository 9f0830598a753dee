//! Chain resolution: turn a tenant's (tier, BYOK) pair into an ordered
//! list of fully-hydrated extraction attempts.
//!
//! The resolved list is serialized onto the job row at creation. Chain or
//! key edits after that point never affect an active job.

use std::sync::Arc;

use {
    anyhow::Result,
    secrecy::SecretString,
    tracing::{debug, warn},
};

use {
    quarry_common::hash::sha256_hex,
    quarry_config::RemoteConfig,
    quarry_llm::{AttemptConfig, ProviderRegistry},
    quarry_store::{
        ChainStore, KeyStore,
        types::ChainEntry,
    },
};

pub struct ConfigResolver {
    chains: Arc<dyn ChainStore>,
    keys: Arc<dyn KeyStore>,
    registry: Arc<ProviderRegistry>,
    remote: Option<Arc<RemoteConfig>>,
}

impl ConfigResolver {
    #[must_use]
    pub fn new(
        chains: Arc<dyn ChainStore>,
        keys: Arc<dyn KeyStore>,
        registry: Arc<ProviderRegistry>,
        remote: Option<Arc<RemoteConfig>>,
    ) -> Self {
        Self {
            chains,
            keys,
            registry,
            remote,
        }
    }

    /// Resolve the attempt list for a tenant.
    ///
    /// BYOK tenants get their own chain when they have configured one,
    /// falling back to the admin chain hydrated with their keys. Platform
    /// tenants get the tier chain, or the default chain when the tier has
    /// none. Disabled entries are skipped; entries with no usable key or
    /// unknown provider are dropped.
    pub async fn resolve(&self, user_id: &str, tier: &str, is_byok: bool) -> Result<Vec<AttemptConfig>> {
        let entries = if is_byok {
            let user = self.chains.user_chain(user_id).await?;
            if user.is_empty() {
                self.chains.effective_admin_chain(tier).await?
            } else {
                user
            }
        } else {
            self.chains.effective_admin_chain(tier).await?
        };

        let mut attempts = Vec::with_capacity(entries.len());
        for entry in entries {
            match self.hydrate(user_id, is_byok, &entry).await? {
                Some(attempt) => attempts.push(attempt),
                None => {
                    debug!(
                        provider = %entry.provider,
                        model = %entry.model,
                        "dropping chain entry without usable key"
                    );
                },
            }
        }

        if attempts.is_empty() {
            warn!(user_id, tier, is_byok, "resolved an empty extraction chain");
        }
        Ok(attempts)
    }

    async fn hydrate(
        &self,
        user_id: &str,
        is_byok: bool,
        entry: &ChainEntry,
    ) -> Result<Option<AttemptConfig>> {
        let Some(provider) = self.registry.provider(&entry.provider) else {
            warn!(provider = %entry.provider, "chain entry references unregistered provider");
            return Ok(None);
        };

        let api_key = if is_byok {
            self.keys
                .user_key(user_id, &entry.provider)
                .await?
                .map(|k| k.api_key)
        } else {
            self.keys.service_key(&entry.provider).await?.map(|k| k.api_key)
        };
        let Some(api_key) = api_key else {
            return Ok(None);
        };

        let defaults = self
            .remote
            .as_ref()
            .and_then(|r| r.model_defaults(&entry.model))
            .unwrap_or_default();

        Ok(Some(AttemptConfig {
            provider: entry.provider.clone(),
            model: entry.model.clone(),
            temperature: entry.temperature.or(defaults.temperature),
            max_tokens: entry
                .max_tokens
                .map(|v| v as u32)
                .or(defaults.max_tokens),
            strict_mode: entry.strict_mode.unwrap_or(provider.supports_json_mode),
            byok: is_byok,
            api_key_hash: sha256_hex(&api_key),
            api_key: SecretString::new(api_key),
            supports_tools: provider.supports_tools,
            supports_json_mode: provider.supports_json_mode,
        }))
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use quarry_store::{
        InMemoryStore,
        types::{ChainScope, NewChainEntry},
    };

    fn entry(provider: &str, model: &str) -> NewChainEntry {
        NewChainEntry {
            provider: provider.into(),
            model: model.into(),
            temperature: None,
            max_tokens: None,
            strict_mode: None,
            enabled: true,
        }
    }

    fn resolver(store: &Arc<InMemoryStore>) -> ConfigResolver {
        ConfigResolver::new(
            store.clone(),
            store.clone(),
            Arc::new(ProviderRegistry::new()),
            None,
        )
    }

    #[tokio::test]
    async fn platform_tenant_uses_admin_chain_with_service_keys() {
        let store = Arc::new(InMemoryStore::new());
        store
            .replace_chain(&ChainScope::Default, vec![
                entry("openai", "gpt-4o-mini"),
                entry("openrouter", "claude-3-5-sonnet"),
            ])
            .await
            .unwrap();
        store.upsert_service_key("openai", "sk-openai", true).await.unwrap();
        store.upsert_service_key("openrouter", "sk-or", true).await.unwrap();

        let attempts = resolver(&store).resolve("u1", "standard", false).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].provider, "openai");
        assert!(!attempts[0].byok);
        assert!(attempts[0].strict_mode);
    }

    #[tokio::test]
    async fn entries_without_keys_are_dropped() {
        let store = Arc::new(InMemoryStore::new());
        store
            .replace_chain(&ChainScope::Default, vec![
                entry("openai", "gpt-4o-mini"),
                entry("openrouter", "claude-3-5-sonnet"),
            ])
            .await
            .unwrap();
        // Only openrouter has a key.
        store.upsert_service_key("openrouter", "sk-or", true).await.unwrap();

        let attempts = resolver(&store).resolve("u1", "standard", false).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].provider, "openrouter");
    }

    #[tokio::test]
    async fn byok_prefers_user_chain_and_user_keys() {
        let store = Arc::new(InMemoryStore::new());
        store
            .replace_chain(&ChainScope::Default, vec![entry("openai", "gpt-4o")])
            .await
            .unwrap();
        store
            .replace_chain(&ChainScope::User("u1".into()), vec![entry(
                "openrouter",
                "claude-3-5-sonnet",
            )])
            .await
            .unwrap();
        store.upsert_service_key("openai", "sk-admin", true).await.unwrap();
        store.upsert_user_key("u1", "openrouter", "sk-user").await.unwrap();

        let attempts = resolver(&store).resolve("u1", "pro", true).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].provider, "openrouter");
        assert!(attempts[0].byok);
        assert_eq!(attempts[0].api_key_hash, sha256_hex("sk-user"));
    }

    #[tokio::test]
    async fn byok_without_user_chain_falls_back_to_admin_chain() {
        let store = Arc::new(InMemoryStore::new());
        store
            .replace_chain(&ChainScope::Default, vec![entry("openai", "gpt-4o-mini")])
            .await
            .unwrap();
        store.upsert_user_key("u1", "openai", "sk-user").await.unwrap();
        // No service key needed: BYOK hydration uses the tenant's key.

        let attempts = resolver(&store).resolve("u1", "pro", true).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert!(attempts[0].byok);
    }

    #[tokio::test]
    async fn unknown_provider_is_dropped() {
        let store = Arc::new(InMemoryStore::new());
        store
            .replace_chain(&ChainScope::Default, vec![entry("nonesuch", "model-x")])
            .await
            .unwrap();
        store.upsert_service_key("nonesuch", "sk", true).await.unwrap();

        let attempts = resolver(&store).resolve("u1", "standard", false).await.unwrap();
        assert!(attempts.is_empty());
    }

    #[tokio::test]
    async fn entry_overrides_beat_model_defaults() {
        let store = Arc::new(InMemoryStore::new());
        store
            .replace_chain(&ChainScope::Default, vec![NewChainEntry {
                provider: "openai".into(),
                model: "gpt-4o-mini".into(),
                temperature: Some(0.7),
                max_tokens: None,
                strict_mode: Some(false),
                enabled: true,
            }])
            .await
            .unwrap();
        store.upsert_service_key("openai", "sk", true).await.unwrap();

        let attempts = resolver(&store).resolve("u1", "standard", false).await.unwrap();
        assert_eq!(attempts[0].temperature, Some(0.7));
        assert!(!attempts[0].strict_mode);
    }
}
