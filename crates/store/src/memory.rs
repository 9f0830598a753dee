//! In-memory store for testing.
//!
//! Mirrors [`crate::SqliteStore`] semantics closely enough that the
//! scheduler, fallback executor, and webhook dispatcher can be tested
//! without a database. A single mutex serializes claims, which is what the
//! atomic `UPDATE … RETURNING` gives the SQLite path.

use std::{
    collections::HashMap,
    sync::Mutex,
};

use async_trait::async_trait;

use {quarry_common::ids, quarry_config::TierLimits};

use crate::{
    Result,
    error::Error,
    sqlite::suspension_window_ms,
    traits::{AuthStore, ChainStore, JobStore, KeyStore, SuspensionStore, WebhookStore},
    types::{
        ApiPrincipal, ChainEntry, ChainScope, Job, JobOutcome, JobResult, JobStatus, JobType,
        KeySuspension, NewChainEntry, NewDelivery, NewJob, NewJobResult, NewWebhook, ServiceKey,
        UserServiceKey, Webhook, WebhookDelivery, WebhookPatch, now_ms,
    },
};

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, Job>,
    results: Vec<JobResult>,
    chains: Vec<ChainEntry>,
    service_keys: HashMap<String, ServiceKey>,
    user_keys: HashMap<(String, String), UserServiceKey>,
    suspensions: HashMap<String, KeySuspension>,
    api_keys: HashMap<String, ApiPrincipal>,
    webhooks: HashMap<String, Webhook>,
    deliveries: Vec<WebhookDelivery>,
    tiers: HashMap<String, TierLimits>,
}

/// In-memory store backed by a mutexed struct. No persistence, tests only.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        let store = Self::default();
        {
            let mut inner = store.lock();
            inner.tiers = (*quarry_config::TierTable::new().snapshot()).clone();
        }
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Inner {
    fn tier_limits(&self, tier: &str) -> (i64, u32) {
        self.tiers
            .get(tier)
            .map_or((2, 2), |t| (t.job_priority, t.max_concurrent_jobs))
    }

    fn running_count(&self, user_id: &str, stale_cutoff_ms: i64) -> i64 {
        self.jobs
            .values()
            .filter(|j| {
                j.user_id == user_id
                    && j.status == JobStatus::Running
                    && j.started_at_ms.unwrap_or(0) > stale_cutoff_ms
            })
            .count() as i64
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn create_job(&self, new: NewJob) -> Result<Job> {
        let now = now_ms();
        let job = Job {
            id: ids::new_id(),
            user_id: new.user_id,
            job_type: new.job_type,
            status: JobStatus::Pending,
            url: new.url,
            schema: new.schema,
            crawl_options: new.crawl_options,
            config_chain: new.config_chain,
            tier: new.tier,
            is_byok: new.is_byok,
            discovery_method: String::new(),
            urls_queued: 0,
            page_count: 0,
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            llm_cost_usd: 0.0,
            webhook_url: new.webhook_url,
            webhook_status: None,
            error_message: None,
            error_category: None,
            created_at_ms: now,
            updated_at_ms: now,
            started_at_ms: None,
            completed_at_ms: None,
        };
        self.lock().jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.lock().jobs.get(id).cloned())
    }

    async fn get_job_for_user(&self, user_id: &str, id: &str) -> Result<Option<Job>> {
        Ok(self
            .lock()
            .jobs
            .get(id)
            .filter(|j| j.user_id == user_id)
            .cloned())
    }

    async fn list_jobs(&self, user_id: &str, limit: i64, offset: i64) -> Result<Vec<Job>> {
        let inner = self.lock();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.user_id == user_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        Ok(jobs
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn claim_pending(&self, stale_cutoff_ms: i64) -> Result<Option<Job>> {
        let mut inner = self.lock();
        let mut candidates: Vec<(i64, i64, String)> = Vec::new();
        for job in inner.jobs.values() {
            if job.status != JobStatus::Pending || job.job_type != JobType::Crawl {
                continue;
            }
            let (priority, limit) = inner.tier_limits(&job.tier);
            if limit != 0 && inner.running_count(&job.user_id, stale_cutoff_ms) >= i64::from(limit)
            {
                continue;
            }
            candidates.push((priority, job.created_at_ms, job.id.clone()));
        }
        // Highest priority first, then earliest creation.
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let Some((_, _, id)) = candidates.into_iter().next() else {
            return Ok(None);
        };
        let now = now_ms();
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("job {id}")))?;
        job.status = JobStatus::Running;
        job.started_at_ms = Some(now);
        job.updated_at_ms = now;
        Ok(Some(job.clone()))
    }

    async fn finish_job(&self, id: &str, outcome: JobOutcome) -> Result<()> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("job {id}")))?;
        let now = now_ms();
        job.status = outcome.status;
        job.error_message = outcome.error_message;
        job.error_category = outcome.error_category;
        job.completed_at_ms = Some(now);
        job.updated_at_ms = now;
        Ok(())
    }

    async fn set_urls_queued(&self, id: &str, urls_queued: i64) -> Result<()> {
        let mut inner = self.lock();
        if let Some(job) = inner.jobs.get_mut(id) {
            job.urls_queued = job.urls_queued.max(urls_queued);
            job.updated_at_ms = now_ms();
        }
        Ok(())
    }

    async fn set_discovery_method(&self, id: &str, method: &str) -> Result<()> {
        let mut inner = self.lock();
        if let Some(job) = inner.jobs.get_mut(id) {
            job.discovery_method = method.to_string();
            job.updated_at_ms = now_ms();
        }
        Ok(())
    }

    async fn add_result(&self, new: NewJobResult) -> Result<JobResult> {
        let mut inner = self.lock();
        let now = now_ms();
        let result = JobResult {
            id: ids::new_id(),
            job_id: new.job_id.clone(),
            url: new.url,
            parent_url: new.parent_url,
            depth: new.depth,
            crawl_status: new.crawl_status,
            data: new.data,
            error_message: new.error_message,
            error_details: new.error_details,
            error_category: new.error_category,
            provider: new.provider,
            model: new.model,
            is_byok: new.is_byok,
            retry_count: new.retry_count,
            input_tokens: new.input_tokens,
            output_tokens: new.output_tokens,
            fetch_duration_ms: new.fetch_duration_ms,
            extract_duration_ms: new.extract_duration_ms,
            discovered_at_ms: new.discovered_at_ms,
            completed_at_ms: now,
        };
        inner.results.push(result.clone());

        if let Some(job) = inner.jobs.get_mut(&new.job_id) {
            job.page_count += 1;
            job.input_tokens += new.input_tokens;
            job.output_tokens += new.output_tokens;
            job.cost_usd += new.cost_usd;
            job.llm_cost_usd += new.llm_cost_usd;
            job.updated_at_ms = now;
        }
        Ok(result)
    }

    async fn results_after(
        &self,
        job_id: &str,
        after_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<JobResult>> {
        let inner = self.lock();
        let after = after_id.unwrap_or("");
        let mut rows: Vec<JobResult> = inner
            .results
            .iter()
            .filter(|r| r.job_id == job_id && r.id.as_str() > after)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn count_results(&self, job_id: &str) -> Result<i64> {
        Ok(self.lock().results.iter().filter(|r| r.job_id == job_id).count() as i64)
    }

    async fn fail_stale(&self, cutoff_ms: i64, message: &str) -> Result<u64> {
        let mut inner = self.lock();
        let now = now_ms();
        let mut flipped = 0;
        for job in inner.jobs.values_mut() {
            if job.status == JobStatus::Running && job.started_at_ms.unwrap_or(0) < cutoff_ms {
                job.status = JobStatus::Failed;
                job.error_message = Some(message.to_string());
                job.error_category = Some("timeout".to_string());
                job.completed_at_ms = Some(now);
                job.updated_at_ms = now;
                flipped += 1;
            }
        }
        Ok(flipped)
    }

    async fn running_count(&self, user_id: &str, stale_cutoff_ms: i64) -> Result<i64> {
        Ok(self.lock().running_count(user_id, stale_cutoff_ms))
    }

    async fn set_webhook_status(&self, id: &str, status: &str) -> Result<()> {
        let mut inner = self.lock();
        if let Some(job) = inner.jobs.get_mut(id) {
            job.webhook_status = Some(status.to_string());
            job.updated_at_ms = now_ms();
        }
        Ok(())
    }

    async fn delete_jobs_before(&self, cutoff_ms: i64) -> Result<u64> {
        let mut inner = self.lock();
        let doomed: Vec<String> = inner
            .jobs
            .values()
            .filter(|j| j.created_at_ms < cutoff_ms)
            .map(|j| j.id.clone())
            .collect();
        for id in &doomed {
            inner.jobs.remove(id);
            inner.results.retain(|r| &r.job_id != id);
            inner.deliveries.retain(|d| &d.job_id != id);
        }
        Ok(doomed.len() as u64)
    }

    async fn sync_tier_limits(&self, tiers: &HashMap<String, TierLimits>) -> Result<()> {
        self.lock().tiers = tiers.clone();
        Ok(())
    }
}

fn scope_matches(entry: &ChainEntry, scope: &ChainScope) -> bool {
    match scope {
        ChainScope::Default => entry.tier.is_none() && entry.user_id.is_none(),
        ChainScope::Tier(t) => entry.tier.as_deref() == Some(t) && entry.user_id.is_none(),
        ChainScope::User(u) => entry.user_id.as_deref() == Some(u),
    }
}

#[async_trait]
impl ChainStore for InMemoryStore {
    async fn effective_admin_chain(&self, tier: &str) -> Result<Vec<ChainEntry>> {
        let tier_scope = ChainScope::Tier(tier.to_string());
        let inner = self.lock();
        let pick = |scope: &ChainScope| -> Vec<ChainEntry> {
            let mut entries: Vec<ChainEntry> = inner
                .chains
                .iter()
                .filter(|e| scope_matches(e, scope) && e.enabled)
                .cloned()
                .collect();
            entries.sort_by_key(|e| e.position);
            entries
        };

        let tier_chain = pick(&tier_scope);
        if !tier_chain.is_empty() {
            return Ok(tier_chain);
        }
        Ok(pick(&ChainScope::Default))
    }

    async fn user_chain(&self, user_id: &str) -> Result<Vec<ChainEntry>> {
        let inner = self.lock();
        let mut entries: Vec<ChainEntry> = inner
            .chains
            .iter()
            .filter(|e| e.user_id.as_deref() == Some(user_id) && e.enabled)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.position);
        Ok(entries)
    }

    async fn list_chain(&self, scope: &ChainScope) -> Result<Vec<ChainEntry>> {
        let inner = self.lock();
        let mut entries: Vec<ChainEntry> = inner
            .chains
            .iter()
            .filter(|e| scope_matches(e, scope))
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.position);
        Ok(entries)
    }

    async fn replace_chain(
        &self,
        scope: &ChainScope,
        entries: Vec<NewChainEntry>,
    ) -> Result<Vec<ChainEntry>> {
        let now = now_ms();
        {
            let mut inner = self.lock();
            inner.chains.retain(|e| !scope_matches(e, scope));
            for (i, entry) in entries.into_iter().enumerate() {
                inner.chains.push(ChainEntry {
                    id: ids::new_id(),
                    tier: scope.tier().map(ToString::to_string),
                    user_id: scope.user_id().map(ToString::to_string),
                    position: (i + 1) as i64,
                    provider: entry.provider,
                    model: entry.model,
                    temperature: entry.temperature,
                    max_tokens: entry.max_tokens,
                    strict_mode: entry.strict_mode,
                    enabled: entry.enabled,
                    created_at_ms: now,
                    updated_at_ms: now,
                });
            }
        }
        self.list_chain(scope).await
    }
}

#[async_trait]
impl KeyStore for InMemoryStore {
    async fn service_key(&self, provider: &str) -> Result<Option<ServiceKey>> {
        Ok(self
            .lock()
            .service_keys
            .get(provider)
            .filter(|k| k.enabled)
            .cloned())
    }

    async fn list_service_keys(&self) -> Result<Vec<ServiceKey>> {
        let mut keys: Vec<ServiceKey> = self.lock().service_keys.values().cloned().collect();
        keys.sort_by(|a, b| a.provider.cmp(&b.provider));
        Ok(keys)
    }

    async fn upsert_service_key(
        &self,
        provider: &str,
        api_key: &str,
        enabled: bool,
    ) -> Result<ServiceKey> {
        let now = now_ms();
        let key = ServiceKey {
            id: ids::new_id(),
            provider: provider.to_string(),
            api_key: api_key.to_string(),
            enabled,
            created_at_ms: now,
            updated_at_ms: now,
        };
        self.lock().service_keys.insert(provider.to_string(), key.clone());
        Ok(key)
    }

    async fn delete_service_key(&self, provider: &str) -> Result<()> {
        if self.lock().service_keys.remove(provider).is_none() {
            return Err(Error::not_found(format!("service key for {provider}")));
        }
        Ok(())
    }

    async fn user_key(&self, user_id: &str, provider: &str) -> Result<Option<UserServiceKey>> {
        Ok(self
            .lock()
            .user_keys
            .get(&(user_id.to_string(), provider.to_string()))
            .filter(|k| k.enabled)
            .cloned())
    }

    async fn list_user_keys(&self, user_id: &str) -> Result<Vec<UserServiceKey>> {
        let mut keys: Vec<UserServiceKey> = self
            .lock()
            .user_keys
            .values()
            .filter(|k| k.user_id == user_id)
            .cloned()
            .collect();
        keys.sort_by(|a, b| a.provider.cmp(&b.provider));
        Ok(keys)
    }

    async fn upsert_user_key(
        &self,
        user_id: &str,
        provider: &str,
        api_key: &str,
    ) -> Result<UserServiceKey> {
        let now = now_ms();
        let key = UserServiceKey {
            id: ids::new_id(),
            user_id: user_id.to_string(),
            provider: provider.to_string(),
            api_key: api_key.to_string(),
            enabled: true,
            created_at_ms: now,
            updated_at_ms: now,
        };
        self.lock()
            .user_keys
            .insert((user_id.to_string(), provider.to_string()), key.clone());
        Ok(key)
    }

    async fn delete_user_key(&self, user_id: &str, provider: &str) -> Result<()> {
        let removed = self
            .lock()
            .user_keys
            .remove(&(user_id.to_string(), provider.to_string()));
        if removed.is_none() {
            return Err(Error::not_found(format!("user key for {provider}")));
        }
        Ok(())
    }
}

#[async_trait]
impl SuspensionStore for InMemoryStore {
    async fn suspension(&self, key_hash: &str) -> Result<Option<KeySuspension>> {
        Ok(self.lock().suspensions.get(key_hash).cloned())
    }

    async fn record_rate_limit(&self, key_hash: &str, now_ms: i64) -> Result<KeySuspension> {
        let mut inner = self.lock();
        let backoff_count = inner
            .suspensions
            .get(key_hash)
            .map_or(1, |s| s.backoff_count + 1);
        let suspension = KeySuspension {
            key_hash: key_hash.to_string(),
            suspended_until_ms: now_ms + suspension_window_ms(backoff_count),
            backoff_count,
            updated_at_ms: now_ms,
        };
        inner
            .suspensions
            .insert(key_hash.to_string(), suspension.clone());
        Ok(suspension)
    }

    async fn clear_suspension(&self, key_hash: &str) -> Result<()> {
        self.lock().suspensions.remove(key_hash);
        Ok(())
    }
}

#[async_trait]
impl AuthStore for InMemoryStore {
    async fn principal_for_key_hash(&self, key_hash: &str) -> Result<Option<ApiPrincipal>> {
        Ok(self.lock().api_keys.get(key_hash).cloned())
    }

    async fn insert_api_key(&self, key_hash: &str, principal: &ApiPrincipal) -> Result<()> {
        self.lock()
            .api_keys
            .insert(key_hash.to_string(), principal.clone());
        Ok(())
    }
}

#[async_trait]
impl WebhookStore for InMemoryStore {
    async fn create_webhook(&self, new: NewWebhook) -> Result<Webhook> {
        let mut inner = self.lock();
        if inner
            .webhooks
            .values()
            .any(|h| h.user_id == new.user_id && h.name == new.name)
        {
            return Err(Error::conflict(format!("webhook name {}", new.name)));
        }
        let now = now_ms();
        let hook = Webhook {
            id: ids::new_id(),
            user_id: new.user_id,
            name: new.name,
            url: new.url,
            events: new.events,
            secret_ciphertext: new.secret_ciphertext,
            headers: new.headers,
            active: new.active,
            created_at_ms: now,
            updated_at_ms: now,
        };
        inner.webhooks.insert(hook.id.clone(), hook.clone());
        Ok(hook)
    }

    async fn list_webhooks(&self, user_id: &str) -> Result<Vec<Webhook>> {
        let mut hooks: Vec<Webhook> = self
            .lock()
            .webhooks
            .values()
            .filter(|h| h.user_id == user_id)
            .cloned()
            .collect();
        hooks.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(hooks)
    }

    async fn get_webhook(&self, user_id: &str, id: &str) -> Result<Option<Webhook>> {
        Ok(self
            .lock()
            .webhooks
            .get(id)
            .filter(|h| h.user_id == user_id)
            .cloned())
    }

    async fn get_webhook_by_id(&self, id: &str) -> Result<Option<Webhook>> {
        Ok(self.lock().webhooks.get(id).cloned())
    }

    async fn update_webhook(
        &self,
        user_id: &str,
        id: &str,
        patch: WebhookPatch,
    ) -> Result<Webhook> {
        let mut inner = self.lock();
        let hook = inner
            .webhooks
            .get_mut(id)
            .filter(|h| h.user_id == user_id)
            .ok_or_else(|| Error::not_found(format!("webhook {id}")))?;

        if let Some(name) = patch.name {
            hook.name = name;
        }
        if let Some(url) = patch.url {
            hook.url = url;
        }
        if let Some(events) = patch.events {
            hook.events = events;
        }
        if let Some(secret) = patch.secret_ciphertext {
            hook.secret_ciphertext = secret;
        }
        if let Some(headers) = patch.headers {
            hook.headers = headers;
        }
        if let Some(active) = patch.active {
            hook.active = active;
        }
        hook.updated_at_ms = now_ms();
        Ok(hook.clone())
    }

    async fn delete_webhook(&self, user_id: &str, id: &str) -> Result<()> {
        let mut inner = self.lock();
        let exists = inner
            .webhooks
            .get(id)
            .is_some_and(|h| h.user_id == user_id);
        if !exists {
            return Err(Error::not_found(format!("webhook {id}")));
        }
        inner.webhooks.remove(id);
        Ok(())
    }

    async fn webhooks_for_event(&self, user_id: &str, event: &str) -> Result<Vec<Webhook>> {
        let hooks = self.list_webhooks(user_id).await?;
        Ok(hooks
            .into_iter()
            .filter(|h| h.active && h.events.iter().any(|e| e == event))
            .collect())
    }

    async fn create_delivery(&self, new: NewDelivery) -> Result<WebhookDelivery> {
        let now = now_ms();
        let delivery = WebhookDelivery {
            id: ids::new_id(),
            webhook_id: new.webhook_id,
            job_id: new.job_id,
            event: new.event,
            url: new.url,
            payload: new.payload,
            status: crate::types::DeliveryStatus::Pending,
            attempt_number: 0,
            max_attempts: new.max_attempts,
            next_retry_at_ms: None,
            response_status: None,
            error: None,
            created_at_ms: now,
            updated_at_ms: now,
        };
        self.lock().deliveries.push(delivery.clone());
        Ok(delivery)
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
        let mut inner = self.lock();
        let Some(slot) = inner.deliveries.iter_mut().find(|d| d.id == delivery.id) else {
            return Err(Error::not_found(format!("delivery {}", delivery.id)));
        };
        *slot = delivery.clone();
        slot.updated_at_ms = now_ms();
        Ok(())
    }

    async fn due_deliveries(&self, now_ms: i64, limit: i64) -> Result<Vec<WebhookDelivery>> {
        let inner = self.lock();
        let mut due: Vec<WebhookDelivery> = inner
            .deliveries
            .iter()
            .filter(|d| {
                d.status == crate::types::DeliveryStatus::Retrying
                    && d.next_retry_at_ms.is_some_and(|t| t <= now_ms)
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| a.id.cmp(&b.id));
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn deliveries_for_webhook(
        &self,
        webhook_id: &str,
        limit: i64,
    ) -> Result<Vec<WebhookDelivery>> {
        let inner = self.lock();
        let mut rows: Vec<WebhookDelivery> = inner
            .deliveries
            .iter()
            .filter(|d| d.webhook_id.as_deref() == Some(webhook_id))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn deliveries_for_job(&self, job_id: &str) -> Result<Vec<WebhookDelivery>> {
        let inner = self.lock();
        let mut rows: Vec<WebhookDelivery> = inner
            .deliveries
            .iter()
            .filter(|d| d.job_id == job_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rows)
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CrawlStatus, JobType};

    fn new_job(user: &str, tier: &str) -> NewJob {
        NewJob {
            user_id: user.into(),
            job_type: JobType::Crawl,
            url: "https://example.com".into(),
            schema: serde_json::json!({}),
            crawl_options: serde_json::json!({}),
            config_chain: serde_json::json!([]),
            tier: tier.into(),
            is_byok: false,
            webhook_url: None,
        }
    }

    #[tokio::test]
    async fn memory_claim_matches_sqlite_semantics() {
        let store = InMemoryStore::new();
        store.create_job(new_job("free-user", "free")).await.unwrap();
        let pro = store.create_job(new_job("pro-user", "pro")).await.unwrap();

        let claimed = store.claim_pending(0).await.unwrap().unwrap();
        assert_eq!(claimed.id, pro.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(claimed.started_at_ms.is_some());
    }

    #[tokio::test]
    async fn memory_concurrency_cap() {
        let store = InMemoryStore::new();
        for _ in 0..3 {
            store.create_job(new_job("u1", "free")).await.unwrap();
        }
        assert!(store.claim_pending(0).await.unwrap().is_some());
        assert!(store.claim_pending(0).await.unwrap().is_some());
        assert!(store.claim_pending(0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_results_ordering() {
        let store = InMemoryStore::new();
        let job = store.create_job(new_job("u1", "free")).await.unwrap();
        for i in 0..3 {
            store
                .add_result(NewJobResult {
                    job_id: job.id.clone(),
                    url: format!("https://example.com/{i}"),
                    parent_url: None,
                    depth: 0,
                    crawl_status: CrawlStatus::Completed,
                    data: None,
                    error_message: None,
                    error_details: None,
                    error_category: None,
                    provider: None,
                    model: None,
                    is_byok: false,
                    retry_count: 0,
                    input_tokens: 0,
                    output_tokens: 0,
                    cost_usd: 0.0,
                    llm_cost_usd: 0.0,
                    fetch_duration_ms: 0,
                    extract_duration_ms: 0,
                    discovered_at_ms: 0,
                })
                .await
                .unwrap();
        }
        let rows = store.results_after(&job.id, None, 10).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.windows(2).all(|w| w[0].id < w[1].id));
        let job = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.page_count, 3);
    }
}
