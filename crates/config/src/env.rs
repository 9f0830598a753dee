//! Environment-derived service configuration.
//!
//! `.env` files are honored via dotenvy; real environment variables win.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::{Error, Result};

/// Default scheduler worker count.
pub const DEFAULT_SCHEDULER_WORKERS: usize = 3;
/// Default scheduler poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Default LLM request timeout.
pub const DEFAULT_LLM_REQUEST_TIMEOUT: Duration = Duration::from_secs(180);
/// Default outbound request timeout (fetches, webhook posts).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Age after which a `running` job is considered abandoned.
pub const DEFAULT_STALE_JOB_AGE: Duration = Duration::from_secs(30 * 60);
/// Default retention window for the cleanup loop.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Everything the binary reads from the environment.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub port: u16,
    pub database_url: String,
    pub base_url: Option<String>,
    pub log_level: String,
    pub log_format: String,
    /// Issuer URL for externally-signed JWTs; `None` disables that path.
    pub clerk_issuer_url: Option<String>,
    /// 64-char hex key for webhook-secret encryption at rest.
    pub encryption_key: Option<SecretString>,
    /// Base URL of the bucket holding `config/*.json` overlay documents.
    pub blocklist_bucket: Option<String>,
    pub cleanup_enabled: bool,
    pub cleanup_interval: Duration,
    pub cors_origins: Vec<String>,
    pub scheduler_workers: usize,
    pub poll_interval: Duration,
    /// Quiet period before scale-to-zero shutdown; `None` disables.
    pub idle_timeout: Option<Duration>,
    pub llm_request_timeout: Duration,
    pub request_timeout: Duration,
    pub stale_job_age: Duration,
    /// Endpoint of the dynamic (browser) rendering service, if deployed.
    pub render_service_url: Option<String>,
}

impl ServiceConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        // Missing .env is the normal production case.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    ///
    /// The indirection keeps tests off the (process-global) environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env(&lookup);

        Ok(Self {
            port: env.parse("PORT")?.unwrap_or(8080),
            database_url: env
                .get("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://quarry.db?mode=rwc".into()),
            base_url: env.get("BASE_URL"),
            log_level: env.get("LOG_LEVEL").unwrap_or_else(|| "info".into()),
            log_format: env.get("LOG_FORMAT").unwrap_or_else(|| "text".into()),
            clerk_issuer_url: env.get("CLERK_ISSUER_URL"),
            encryption_key: env.encryption_key()?,
            blocklist_bucket: env.get("BLOCKLIST_BUCKET"),
            cleanup_enabled: env.flag("CLEANUP_ENABLED"),
            cleanup_interval: env
                .secs("CLEANUP_INTERVAL")?
                .unwrap_or(DEFAULT_CLEANUP_INTERVAL),
            cors_origins: env
                .get("CORS_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            scheduler_workers: env
                .parse("SCHEDULER_WORKERS")?
                .unwrap_or(DEFAULT_SCHEDULER_WORKERS),
            poll_interval: env
                .secs("SCHEDULER_POLL_INTERVAL")?
                .unwrap_or(DEFAULT_POLL_INTERVAL),
            idle_timeout: env.secs("IDLE_TIMEOUT")?.filter(|d| !d.is_zero()),
            llm_request_timeout: env
                .secs("LLM_REQUEST_TIMEOUT")?
                .unwrap_or(DEFAULT_LLM_REQUEST_TIMEOUT),
            request_timeout: env.secs("REQUEST_TIMEOUT")?.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            stale_job_age: env.secs("STALE_JOB_AGE")?.unwrap_or(DEFAULT_STALE_JOB_AGE),
            render_service_url: env.get("RENDER_SERVICE_URL"),
        })
    }
}

struct Env<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Env<'_> {
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, name: &str) -> Result<Option<T>>
    where
        T::Err: std::fmt::Display,
    {
        self.get(name)
            .map(|v| {
                v.parse::<T>()
                    .map_err(|e| Error::invalid_env(name, e.to_string()))
            })
            .transpose()
    }

    fn flag(&self, name: &str) -> bool {
        self.get(name)
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false)
    }

    fn secs(&self, name: &str) -> Result<Option<Duration>> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_secs))
    }

    fn encryption_key(&self) -> Result<Option<SecretString>> {
        let Some(hex) = self.get("ENCRYPTION_KEY") else {
            return Ok(None);
        };
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::invalid_env(
                "ENCRYPTION_KEY",
                "expected 64 hex chars (32 bytes)",
            ));
        }
        Ok(Some(SecretString::new(hex)))
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = ServiceConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.scheduler_workers, 3);
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.llm_request_timeout, Duration::from_secs(180));
        assert!(cfg.idle_timeout.is_none());
        assert!(!cfg.cleanup_enabled);
    }

    #[test]
    fn overrides_win() {
        let cfg = ServiceConfig::from_lookup(lookup(&[
            ("PORT", "9090"),
            ("CORS_ORIGINS", "https://a.dev, https://b.dev"),
            ("IDLE_TIMEOUT", "120"),
            ("CLEANUP_ENABLED", "true"),
        ]))
        .unwrap();
        assert_eq!(cfg.port, 9090);
        assert_eq!(cfg.cors_origins, vec!["https://a.dev", "https://b.dev"]);
        assert_eq!(cfg.idle_timeout, Some(Duration::from_secs(120)));
        assert!(cfg.cleanup_enabled);
    }

    #[test]
    fn idle_timeout_zero_disables() {
        let cfg = ServiceConfig::from_lookup(lookup(&[("IDLE_TIMEOUT", "0")])).unwrap();
        assert!(cfg.idle_timeout.is_none());
    }

    #[test]
    fn bad_port_is_an_error() {
        assert!(ServiceConfig::from_lookup(lookup(&[("PORT", "not-a-port")])).is_err());
    }

    #[test]
    fn encryption_key_must_be_32_byte_hex() {
        assert!(ServiceConfig::from_lookup(lookup(&[("ENCRYPTION_KEY", "zz")])).is_err());
        let good = "ab".repeat(32);
        let cfg =
            ServiceConfig::from_lookup(lookup(&[("ENCRYPTION_KEY", good.as_str())])).unwrap();
        assert!(cfg.encryption_key.is_some());
    }
}
