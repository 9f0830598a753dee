//! Remote config overlay.
//!
//! Four JSON documents live under a bucket prefix `config/`:
//! `blocklist.json`, `logfilters.json`, `model_defaults.json`,
//! `tier_settings.json`. Each is re-fetched on a TTL with `If-None-Match`;
//! a parse failure retains the previous good copy.

use std::{
    collections::{HashMap, HashSet},
    net::IpAddr,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use {
    serde::Deserialize,
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::tiers::{TierOverride, TierTable};

/// Default refresh interval.
pub const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(5 * 60);

/// Per-model generation defaults from `model_defaults.json`, used when a
/// chain entry leaves temperature/max_tokens unset.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelDefaults {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct BlocklistDoc {
    #[serde(default)]
    ips: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct LogFiltersDoc {
    #[serde(default)]
    directives: Vec<String>,
}

type OnLogFilters = Arc<dyn Fn(&[String]) + Send + Sync>;

/// Periodically refreshed remote configuration.
///
/// Readers clone an `Arc` out of a `RwLock`; the refresh loop is the only
/// writer and swaps whole maps.
pub struct RemoteConfig {
    client: reqwest::Client,
    base_url: String,
    ttl: Duration,
    blocklist: RwLock<Arc<HashSet<IpAddr>>>,
    log_filters: RwLock<Arc<Vec<String>>>,
    model_defaults: RwLock<Arc<HashMap<String, ModelDefaults>>>,
    tier_overrides: RwLock<Arc<HashMap<String, TierOverride>>>,
    etags: Mutex<HashMap<&'static str, String>>,
    on_log_filters: Mutex<Option<OnLogFilters>>,
}

impl RemoteConfig {
    #[must_use]
    pub fn new(client: reqwest::Client, bucket_base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: bucket_base_url.into().trim_end_matches('/').to_string(),
            ttl: DEFAULT_REFRESH_TTL,
            blocklist: RwLock::new(Arc::new(HashSet::new())),
            log_filters: RwLock::new(Arc::new(Vec::new())),
            model_defaults: RwLock::new(Arc::new(HashMap::new())),
            tier_overrides: RwLock::new(Arc::new(HashMap::new())),
            etags: Mutex::new(HashMap::new()),
            on_log_filters: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Install a callback invoked whenever `logfilters.json` changes.
    pub fn on_log_filters(&self, callback: OnLogFilters) {
        *lock(&self.on_log_filters) = Some(callback);
    }

    #[must_use]
    pub fn blocklist(&self) -> Arc<HashSet<IpAddr>> {
        read(&self.blocklist)
    }

    #[must_use]
    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.blocklist().contains(&ip)
    }

    #[must_use]
    pub fn log_filters(&self) -> Arc<Vec<String>> {
        read(&self.log_filters)
    }

    /// Defaults for a model id, if the overlay carries any.
    #[must_use]
    pub fn model_defaults(&self, model: &str) -> Option<ModelDefaults> {
        read(&self.model_defaults).get(model).copied()
    }

    #[must_use]
    pub fn tier_overrides(&self) -> Arc<HashMap<String, TierOverride>> {
        read(&self.tier_overrides)
    }

    /// Fetch all four documents once, applying whatever parses.
    pub async fn refresh(&self, tiers: &TierTable) {
        if let Some(doc) = self.fetch::<BlocklistDoc>("blocklist.json").await {
            let parsed: HashSet<IpAddr> = doc
                .ips
                .iter()
                .filter_map(|raw| match raw.parse() {
                    Ok(ip) => Some(ip),
                    Err(_) => {
                        warn!(ip = %raw, "blocklist entry is not an IP, skipping");
                        None
                    },
                })
                .collect();
            *write(&self.blocklist) = Arc::new(parsed);
        }

        if let Some(doc) = self.fetch::<LogFiltersDoc>("logfilters.json").await {
            let changed = *read(&self.log_filters) != doc.directives;
            *write(&self.log_filters) = Arc::new(doc.directives.clone());
            if changed
                && let Some(cb) = lock(&self.on_log_filters).clone()
            {
                cb(&doc.directives);
            }
        }

        if let Some(doc) = self
            .fetch::<HashMap<String, ModelDefaults>>("model_defaults.json")
            .await
        {
            *write(&self.model_defaults) = Arc::new(doc);
        }

        if let Some(doc) = self
            .fetch::<HashMap<String, TierOverride>>("tier_settings.json")
            .await
        {
            tiers.apply_overrides(&doc);
            *write(&self.tier_overrides) = Arc::new(doc);
        }
    }

    /// Run `refresh` on the TTL until cancelled.
    pub fn spawn_refresh_loop(
        self: Arc<Self>,
        tiers: Arc<TierTable>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.refresh(&tiers).await;
                tokio::select! {
                    () = tokio::time::sleep(self.ttl) => {},
                    () = cancel.cancelled() => break,
                }
            }
        })
    }

    /// GET one document, honoring `If-None-Match`.
    ///
    /// Returns `None` for 304s, transport errors, and parse failures; the
    /// caller keeps the previous good copy in all three cases.
    async fn fetch<T: serde::de::DeserializeOwned>(&self, name: &'static str) -> Option<T> {
        let url = format!("{}/config/{name}", self.base_url);
        let mut req = self.client.get(&url);
        if let Some(etag) = lock(&self.etags).get(name) {
            req = req.header(reqwest::header::IF_NONE_MATCH, etag.clone());
        }

        let resp = match req.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(doc = name, error = %e, "remote config fetch failed");
                return None;
            },
        };

        if resp.status() == reqwest::StatusCode::NOT_MODIFIED {
            debug!(doc = name, "remote config unchanged");
            return None;
        }
        if !resp.status().is_success() {
            warn!(doc = name, status = %resp.status(), "remote config fetch failed");
            return None;
        }

        let etag = resp
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);

        let body = match resp.text().await {
            Ok(b) => b,
            Err(e) => {
                warn!(doc = name, error = %e, "remote config body read failed");
                return None;
            },
        };

        match serde_json::from_str::<T>(&body) {
            Ok(doc) => {
                if let Some(etag) = etag {
                    lock(&self.etags).insert(name, etag);
                }
                debug!(doc = name, "remote config updated");
                Some(doc)
            },
            Err(e) => {
                warn!(doc = name, error = %e, "remote config parse failed, keeping previous");
                None
            },
        }
    }
}

fn read<T: Clone>(lock: &RwLock<T>) -> T {
    lock.read()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone()
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
