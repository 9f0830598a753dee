//! Persistence traits. The core is written against these so tests can run
//! on [`crate::InMemoryStore`] and production on [`crate::SqliteStore`].

use std::collections::HashMap;

use async_trait::async_trait;

use quarry_config::TierLimits;

use crate::{
    Result,
    types::{
        ApiPrincipal, ChainEntry, ChainScope, Job, JobOutcome, JobResult, KeySuspension,
        NewChainEntry, NewDelivery, NewJob, NewJobResult, NewWebhook, ServiceKey, UserServiceKey,
        Webhook, WebhookDelivery, WebhookPatch,
    },
};

/// Jobs and per-page results.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, new: NewJob) -> Result<Job>;
    async fn get_job(&self, id: &str) -> Result<Option<Job>>;
    async fn get_job_for_user(&self, user_id: &str, id: &str) -> Result<Option<Job>>;
    async fn list_jobs(&self, user_id: &str, limit: i64, offset: i64) -> Result<Vec<Job>>;

    /// Atomically claim the highest-priority eligible pending crawl job.
    ///
    /// Eligibility: `status = pending`, `type = crawl`, and the tenant's
    /// non-stale running count is below its tier's concurrency limit
    /// (0 = unlimited). Among eligible jobs, highest tier priority wins and
    /// ties break on earliest `created_at`. Returns `None` when nothing is
    /// eligible; that is not an error.
    async fn claim_pending(&self, stale_cutoff_ms: i64) -> Result<Option<Job>>;

    /// Write the terminal row for a job (status, error, `completed_at`).
    async fn finish_job(&self, id: &str, outcome: JobOutcome) -> Result<()>;

    /// Monotonic update of the discovered-URL counter.
    async fn set_urls_queued(&self, id: &str, urls_queued: i64) -> Result<()>;
    async fn set_discovery_method(&self, id: &str, method: &str) -> Result<()>;

    /// Persist a page outcome and roll its token/cost counters up onto the
    /// job row in the same transaction.
    async fn add_result(&self, new: NewJobResult) -> Result<JobResult>;

    /// Results with `id > after_id` in ascending id order. This is the
    /// incremental-streaming primitive: ids are ULIDs, so id order is
    /// completion order.
    async fn results_after(
        &self,
        job_id: &str,
        after_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<JobResult>>;
    async fn count_results(&self, job_id: &str) -> Result<i64>;

    /// Fail every `running` job whose `started_at` predates the cutoff.
    /// Returns the number of rows transitioned.
    async fn fail_stale(&self, cutoff_ms: i64, message: &str) -> Result<u64>;

    /// Non-stale running jobs for a tenant.
    async fn running_count(&self, user_id: &str, stale_cutoff_ms: i64) -> Result<i64>;

    async fn set_webhook_status(&self, id: &str, status: &str) -> Result<()>;

    /// Cascade-delete jobs (results, deliveries) created before the cutoff.
    async fn delete_jobs_before(&self, cutoff_ms: i64) -> Result<u64>;

    /// Mirror the effective tier table into `tier_limits` so
    /// `claim_pending` can join against it.
    async fn sync_tier_limits(&self, tiers: &HashMap<String, TierLimits>) -> Result<()>;
}

/// Fallback chain configuration.
#[async_trait]
pub trait ChainStore: Send + Sync {
    /// The admin chain in effect for a tier: the tier-specific chain when
    /// non-empty, else the default chain. Enabled entries only, position
    /// ascending.
    async fn effective_admin_chain(&self, tier: &str) -> Result<Vec<ChainEntry>>;

    /// A tenant's BYOK chain, enabled entries only, position ascending.
    async fn user_chain(&self, user_id: &str) -> Result<Vec<ChainEntry>>;

    /// All entries in a scope including disabled ones, for admin listings.
    async fn list_chain(&self, scope: &ChainScope) -> Result<Vec<ChainEntry>>;

    /// Replace a scope's chain wholesale: delete and reinsert inside one
    /// transaction, assigning dense 1-based positions. (Per-row position
    /// UPDATEs would trip the uniqueness constraint when entries swap.)
    async fn replace_chain(
        &self,
        scope: &ChainScope,
        entries: Vec<NewChainEntry>,
    ) -> Result<Vec<ChainEntry>>;
}

/// Provider credentials, platform- and tenant-owned.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// The enabled platform key for a provider, if any.
    async fn service_key(&self, provider: &str) -> Result<Option<ServiceKey>>;
    async fn list_service_keys(&self) -> Result<Vec<ServiceKey>>;
    async fn upsert_service_key(
        &self,
        provider: &str,
        api_key: &str,
        enabled: bool,
    ) -> Result<ServiceKey>;
    async fn delete_service_key(&self, provider: &str) -> Result<()>;

    async fn user_key(&self, user_id: &str, provider: &str) -> Result<Option<UserServiceKey>>;
    async fn list_user_keys(&self, user_id: &str) -> Result<Vec<UserServiceKey>>;
    async fn upsert_user_key(
        &self,
        user_id: &str,
        provider: &str,
        api_key: &str,
    ) -> Result<UserServiceKey>;
    async fn delete_user_key(&self, user_id: &str, provider: &str) -> Result<()>;
}

/// Per-key rate-limit suspensions, shared across processes.
#[async_trait]
pub trait SuspensionStore: Send + Sync {
    async fn suspension(&self, key_hash: &str) -> Result<Option<KeySuspension>>;

    /// Record a rate-limit hit: bump the backoff count and extend the
    /// suspension window (base 5 s, doubling, capped at 5 m).
    async fn record_rate_limit(&self, key_hash: &str, now_ms: i64) -> Result<KeySuspension>;

    async fn clear_suspension(&self, key_hash: &str) -> Result<()>;
}

/// Platform API keys (`rf_…`) resolved to principals.
#[async_trait]
pub trait AuthStore: Send + Sync {
    async fn principal_for_key_hash(&self, key_hash: &str) -> Result<Option<ApiPrincipal>>;
    async fn insert_api_key(&self, key_hash: &str, principal: &ApiPrincipal) -> Result<()>;
}

/// Webhook descriptors and delivery rows.
#[async_trait]
pub trait WebhookStore: Send + Sync {
    async fn create_webhook(&self, new: NewWebhook) -> Result<Webhook>;
    async fn list_webhooks(&self, user_id: &str) -> Result<Vec<Webhook>>;
    async fn get_webhook(&self, user_id: &str, id: &str) -> Result<Option<Webhook>>;
    async fn get_webhook_by_id(&self, id: &str) -> Result<Option<Webhook>>;
    async fn update_webhook(&self, user_id: &str, id: &str, patch: WebhookPatch)
    -> Result<Webhook>;
    async fn delete_webhook(&self, user_id: &str, id: &str) -> Result<()>;

    /// Active webhooks for a tenant subscribed to an event.
    async fn webhooks_for_event(&self, user_id: &str, event: &str) -> Result<Vec<Webhook>>;

    async fn create_delivery(&self, new: NewDelivery) -> Result<WebhookDelivery>;
    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<()>;

    /// Retrying deliveries whose `next_retry_at` has elapsed, id ascending.
    async fn due_deliveries(&self, now_ms: i64, limit: i64) -> Result<Vec<WebhookDelivery>>;

    async fn deliveries_for_webhook(
        &self,
        webhook_id: &str,
        limit: i64,
    ) -> Result<Vec<WebhookDelivery>>;
    async fn deliveries_for_job(&self, job_id: &str) -> Result<Vec<WebhookDelivery>>;
}
