//! Shared application state threaded through every handler.

use std::sync::Arc;

use {
    quarry_config::{RemoteConfig, ServiceConfig, TierTable},
    quarry_crawler::Fetcher,
    quarry_extract::{ConfigResolver, FallbackExecutor},
    quarry_llm::ProviderRegistry,
    quarry_scheduler::IdleMonitor,
    quarry_store::{AuthStore, ChainStore, JobStore, KeyStore, WebhookStore},
    quarry_webhooks::{SecretCipher, WebhookDispatcher},
};

pub struct AppState {
    pub config: ServiceConfig,
    pub jobs: Arc<dyn JobStore>,
    pub chains: Arc<dyn ChainStore>,
    pub keys: Arc<dyn KeyStore>,
    pub auth: Arc<dyn AuthStore>,
    pub webhooks: Arc<dyn WebhookStore>,
    pub registry: Arc<ProviderRegistry>,
    pub resolver: Arc<ConfigResolver>,
    pub executor: Arc<FallbackExecutor>,
    pub fetcher: Arc<dyn Fetcher>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub tiers: Arc<TierTable>,
    pub remote: Option<Arc<RemoteConfig>>,
    pub cipher: Option<Arc<SecretCipher>>,
    pub idle: Option<Arc<IdleMonitor>>,
}

pub type SharedState = Arc<AppState>;
