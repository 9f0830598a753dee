//! Row types shared across the workspace.

use serde::{Deserialize, Serialize};

/// Current unix time in milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ── Jobs ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Extract,
    Crawl,
    Analyze,
}

impl JobType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::Crawl => "crawl",
            Self::Analyze => "analyze",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "extract" => Some(Self::Extract),
            "crawl" => Some(Self::Crawl),
            "analyze" => Some(Self::Analyze),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// One user extraction request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub user_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub url: String,
    /// Target schema, opaque to the store.
    pub schema: serde_json::Value,
    /// Serialized crawl options, opaque to the store.
    pub crawl_options: serde_json::Value,
    /// Frozen config chain snapshot taken at creation. Tier or key edits
    /// mid-run never affect an active job.
    pub config_chain: serde_json::Value,
    pub tier: String,
    pub is_byok: bool,
    /// `""` until discovery runs, then `"sitemap"` or `"links"`.
    pub discovery_method: String,
    pub urls_queued: i64,
    pub page_count: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    /// Cost charged to the tenant (zero for BYOK).
    pub cost_usd: f64,
    /// Actual upstream spend, recorded even for BYOK.
    pub llm_cost_usd: f64,
    pub webhook_url: Option<String>,
    pub webhook_status: Option<String>,
    pub error_message: Option<String>,
    pub error_category: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
}

/// Fields the caller supplies when creating a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub user_id: String,
    pub job_type: JobType,
    pub url: String,
    pub schema: serde_json::Value,
    pub crawl_options: serde_json::Value,
    pub config_chain: serde_json::Value,
    pub tier: String,
    pub is_byok: bool,
    pub webhook_url: Option<String>,
}

/// Terminal outcome written by the scheduler.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub error_category: Option<String>,
}

impl JobOutcome {
    #[must_use]
    pub fn completed() -> Self {
        Self {
            status: JobStatus::Completed,
            error_message: None,
            error_category: None,
        }
    }

    #[must_use]
    pub fn failed(message: impl Into<String>, category: Option<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            error_message: Some(message.into()),
            error_category: category,
        }
    }
}

// ── Job results ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    Completed,
    Failed,
}

impl CrawlStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One row per attempted page. Ids are ULIDs, so ascending id order is
/// completion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub id: String,
    pub job_id: String,
    pub url: String,
    pub parent_url: Option<String>,
    pub depth: i64,
    pub crawl_status: CrawlStatus,
    pub data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub error_details: Option<String>,
    pub error_category: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub is_byok: bool,
    pub retry_count: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub fetch_duration_ms: i64,
    pub extract_duration_ms: i64,
    pub discovered_at_ms: i64,
    pub completed_at_ms: i64,
}

/// Fields supplied when persisting a page outcome. `cost_usd` /
/// `llm_cost_usd` roll up onto the job row.
#[derive(Debug, Clone)]
pub struct NewJobResult {
    pub job_id: String,
    pub url: String,
    pub parent_url: Option<String>,
    pub depth: i64,
    pub crawl_status: CrawlStatus,
    pub data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub error_details: Option<String>,
    pub error_category: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub is_byok: bool,
    pub retry_count: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
    pub llm_cost_usd: f64,
    pub fetch_duration_ms: i64,
    pub extract_duration_ms: i64,
    pub discovered_at_ms: i64,
}

// ── Fallback chains ─────────────────────────────────────────────────────────

/// Which chain a set of entries belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainScope {
    /// The tier-less default chain.
    Default,
    /// A tier-specific admin chain; shadows the default when non-empty.
    Tier(String),
    /// A tenant's BYOK chain.
    User(String),
}

impl ChainScope {
    #[must_use]
    pub fn tier(&self) -> Option<&str> {
        match self {
            Self::Tier(t) => Some(t),
            _ => None,
        }
    }

    #[must_use]
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::User(u) => Some(u),
            _ => None,
        }
    }
}

/// One `(provider, model)` step in a fallback chain. Positions are dense
/// and 1-based within a scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEntry {
    pub id: String,
    pub tier: Option<String>,
    pub user_id: Option<String>,
    pub position: i64,
    pub provider: String,
    pub model: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<i64>,
    pub strict_mode: Option<bool>,
    pub enabled: bool,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewChainEntry {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<i64>,
    #[serde(default)]
    pub strict_mode: Option<bool>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

// ── Keys ────────────────────────────────────────────────────────────────────

/// Admin-owned provider credential used for platform (non-BYOK) tenants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceKey {
    pub id: String,
    pub provider: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub enabled: bool,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Tenant-owned BYOK credential, one per (tenant, provider).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserServiceKey {
    pub id: String,
    pub user_id: String,
    pub provider: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub enabled: bool,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Rate-limit suspension shared across processes, keyed by SHA-256 of the
/// API key so key material never lands in the table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeySuspension {
    pub key_hash: String,
    pub suspended_until_ms: i64,
    pub backoff_count: i64,
    pub updated_at_ms: i64,
}

// ── Auth principals ─────────────────────────────────────────────────────────

/// Resolved identity of a bearer credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiPrincipal {
    pub user_id: String,
    pub tier: String,
    pub is_admin: bool,
    pub is_byok: bool,
}

// ── Webhooks ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub url: String,
    pub events: Vec<String>,
    /// XChaCha20-Poly1305 ciphertext of the HMAC secret.
    #[serde(skip_serializing)]
    pub secret_ciphertext: Vec<u8>,
    pub headers: serde_json::Value,
    pub active: bool,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct NewWebhook {
    pub user_id: String,
    pub name: String,
    pub url: String,
    pub events: Vec<String>,
    pub secret_ciphertext: Vec<u8>,
    pub headers: serde_json::Value,
    pub active: bool,
}

#[derive(Debug, Clone, Default)]
pub struct WebhookPatch {
    pub name: Option<String>,
    pub url: Option<String>,
    pub events: Option<Vec<String>>,
    pub secret_ciphertext: Option<Vec<u8>>,
    pub headers: Option<serde_json::Value>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
    Retrying,
}

impl DeliveryStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "retrying" => Some(Self::Retrying),
            _ => None,
        }
    }
}

/// One attempt series against one webhook for one job event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: String,
    /// `None` for ephemeral (job-inline URL) deliveries.
    pub webhook_id: Option<String>,
    pub job_id: String,
    pub event: String,
    pub url: String,
    pub payload: serde_json::Value,
    pub status: DeliveryStatus,
    pub attempt_number: i64,
    pub max_attempts: i64,
    pub next_retry_at_ms: Option<i64>,
    pub response_status: Option<i64>,
    pub error: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct NewDelivery {
    pub webhook_id: Option<String>,
    pub job_id: String,
    pub event: String,
    pub url: String,
    pub payload: serde_json::Value,
    pub max_attempts: i64,
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips() {
        for s in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(JobStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn job_type_round_trips() {
        for t in [JobType::Extract, JobType::Crawl, JobType::Analyze] {
            assert_eq!(JobType::parse(t.as_str()), Some(t));
        }
    }

    #[test]
    fn webhook_secret_not_serialized() {
        let hook = Webhook {
            id: "wh1".into(),
            user_id: "u1".into(),
            name: "prod".into(),
            url: "https://example.com/hook".into(),
            events: vec!["job.completed".into()],
            secret_ciphertext: vec![1, 2, 3],
            headers: serde_json::json!({}),
            active: true,
            created_at_ms: 0,
            updated_at_ms: 0,
        };
        let json = serde_json::to_string(&hook).unwrap();
        assert!(!json.contains("secret"));
    }
}
