//! SQLite-backed store using sqlx.
//!
//! All writes that must be atomic (claiming, result + counter roll-up,
//! chain replacement) go through single statements or transactions;
//! nothing holds a transaction across an HTTP call.

use std::{collections::HashMap, str::FromStr};

use {
    async_trait::async_trait,
    sqlx::{
        Row, SqlitePool,
        sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    },
};

use {quarry_common::ids, quarry_config::TierLimits};

use crate::{
    Result,
    error::Error,
    traits::{AuthStore, ChainStore, JobStore, KeyStore, SuspensionStore, WebhookStore},
    types::{
        ApiPrincipal, ChainEntry, ChainScope, CrawlStatus, DeliveryStatus, Job, JobOutcome,
        JobResult, JobStatus, JobType, KeySuspension, NewChainEntry, NewDelivery, NewJob,
        NewJobResult, NewWebhook, ServiceKey, UserServiceKey, Webhook, WebhookDelivery,
        WebhookPatch, now_ms,
    },
};

/// Base suspension window after a rate-limit hit.
pub const SUSPENSION_BASE_MS: i64 = 5_000;
/// Suspension window cap.
pub const SUSPENSION_CAP_MS: i64 = 5 * 60 * 1_000;

/// SQLite persistence for the whole service.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect, enable foreign keys, and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .foreign_keys(true);
        // A `:memory:` database exists per connection; the pool must not
        // fan out or each connection sees its own empty schema.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        crate::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Use an existing pool (migrations must already be run).
    #[must_use]
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

// ── Row mapping ─────────────────────────────────────────────────────────────

fn json_col(row: &SqliteRow, name: &str) -> serde_json::Value {
    let raw: String = row.get(name);
    serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null)
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let job_type: String = row.get("job_type");
    let status: String = row.get("status");
    Ok(Job {
        id: row.get("id"),
        user_id: row.get("user_id"),
        job_type: JobType::parse(&job_type)
            .ok_or_else(|| Error::Message(format!("bad job_type: {job_type}")))?,
        status: JobStatus::parse(&status)
            .ok_or_else(|| Error::Message(format!("bad status: {status}")))?,
        url: row.get("url"),
        schema: json_col(row, "schema_json"),
        crawl_options: json_col(row, "crawl_options"),
        config_chain: json_col(row, "config_chain"),
        tier: row.get("tier"),
        is_byok: row.get::<i64, _>("is_byok") != 0,
        discovery_method: row.get("discovery_method"),
        urls_queued: row.get("urls_queued"),
        page_count: row.get("page_count"),
        input_tokens: row.get("input_tokens"),
        output_tokens: row.get("output_tokens"),
        cost_usd: row.get("cost_usd"),
        llm_cost_usd: row.get("llm_cost_usd"),
        webhook_url: row.get("webhook_url"),
        webhook_status: row.get("webhook_status"),
        error_message: row.get("error_message"),
        error_category: row.get("error_category"),
        created_at_ms: row.get("created_at_ms"),
        updated_at_ms: row.get("updated_at_ms"),
        started_at_ms: row.get("started_at_ms"),
        completed_at_ms: row.get("completed_at_ms"),
    })
}

fn result_from_row(row: &SqliteRow) -> Result<JobResult> {
    let crawl_status: String = row.get("crawl_status");
    let data: Option<String> = row.get("data");
    Ok(JobResult {
        id: row.get("id"),
        job_id: row.get("job_id"),
        url: row.get("url"),
        parent_url: row.get("parent_url"),
        depth: row.get("depth"),
        crawl_status: CrawlStatus::parse(&crawl_status)
            .ok_or_else(|| Error::Message(format!("bad crawl_status: {crawl_status}")))?,
        data: data.and_then(|d| serde_json::from_str(&d).ok()),
        error_message: row.get("error_message"),
        error_details: row.get("error_details"),
        error_category: row.get("error_category"),
        provider: row.get("provider"),
        model: row.get("model"),
        is_byok: row.get::<i64, _>("is_byok") != 0,
        retry_count: row.get("retry_count"),
        input_tokens: row.get("input_tokens"),
        output_tokens: row.get("output_tokens"),
        fetch_duration_ms: row.get("fetch_duration_ms"),
        extract_duration_ms: row.get("extract_duration_ms"),
        discovered_at_ms: row.get("discovered_at_ms"),
        completed_at_ms: row.get("completed_at_ms"),
    })
}

fn chain_from_row(row: &SqliteRow) -> ChainEntry {
    ChainEntry {
        id: row.get("id"),
        tier: row.get("tier"),
        user_id: row.get("user_id"),
        position: row.get("position"),
        provider: row.get("provider"),
        model: row.get("model"),
        temperature: row.get("temperature"),
        max_tokens: row.get("max_tokens"),
        strict_mode: row.get::<Option<i64>, _>("strict_mode").map(|v| v != 0),
        enabled: row.get::<i64, _>("enabled") != 0,
        created_at_ms: row.get("created_at_ms"),
        updated_at_ms: row.get("updated_at_ms"),
    }
}

fn webhook_from_row(row: &SqliteRow) -> Webhook {
    let events: String = row.get("events");
    Webhook {
        id: row.get("id"),
        user_id: row.get("user_id"),
        name: row.get("name"),
        url: row.get("url"),
        events: serde_json::from_str(&events).unwrap_or_default(),
        secret_ciphertext: row.get("secret_ciphertext"),
        headers: json_col(row, "headers"),
        active: row.get::<i64, _>("active") != 0,
        created_at_ms: row.get("created_at_ms"),
        updated_at_ms: row.get("updated_at_ms"),
    }
}

fn delivery_from_row(row: &SqliteRow) -> Result<WebhookDelivery> {
    let status: String = row.get("status");
    Ok(WebhookDelivery {
        id: row.get("id"),
        webhook_id: row.get("webhook_id"),
        job_id: row.get("job_id"),
        event: row.get("event"),
        url: row.get("url"),
        payload: json_col(row, "payload"),
        status: DeliveryStatus::parse(&status)
            .ok_or_else(|| Error::Message(format!("bad delivery status: {status}")))?,
        attempt_number: row.get("attempt_number"),
        max_attempts: row.get("max_attempts"),
        next_retry_at_ms: row.get("next_retry_at_ms"),
        response_status: row.get("response_status"),
        error: row.get("error"),
        created_at_ms: row.get("created_at_ms"),
        updated_at_ms: row.get("updated_at_ms"),
    })
}

const JOB_COLS: &str = "id, user_id, job_type, status, url, schema_json, crawl_options, \
     config_chain, tier, is_byok, discovery_method, urls_queued, page_count, input_tokens, \
     output_tokens, cost_usd, llm_cost_usd, webhook_url, webhook_status, error_message, \
     error_category, created_at_ms, updated_at_ms, started_at_ms, completed_at_ms";

// ── JobStore ────────────────────────────────────────────────────────────────

#[async_trait]
impl JobStore for SqliteStore {
    async fn create_job(&self, new: NewJob) -> Result<Job> {
        let now = now_ms();
        let id = ids::new_id();
        sqlx::query(
            "INSERT INTO jobs (id, user_id, job_type, status, url, schema_json, crawl_options, \
             config_chain, tier, is_byok, webhook_url, created_at_ms, updated_at_ms) \
             VALUES (?, ?, ?, 'pending', ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&new.user_id)
        .bind(new.job_type.as_str())
        .bind(&new.url)
        .bind(new.schema.to_string())
        .bind(new.crawl_options.to_string())
        .bind(new.config_chain.to_string())
        .bind(&new.tier)
        .bind(i64::from(new.is_byok))
        .bind(&new.webhook_url)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_job(&id)
            .await?
            .ok_or_else(|| Error::not_found(format!("job {id}")))
    }

    async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLS} FROM jobs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn get_job_for_user(&self, user_id: &str, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLS} FROM jobs WHERE id = ? AND user_id = ?"
        ))
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(&self, user_id: &str, limit: i64, offset: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLS} FROM jobs WHERE user_id = ? \
             ORDER BY created_at_ms DESC LIMIT ? OFFSET ?"
        ))
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn claim_pending(&self, stale_cutoff_ms: i64) -> Result<Option<Job>> {
        let now = now_ms();
        // Single-statement claim: SQLite serializes writers, so among N
        // concurrent workers exactly one update matches. Unknown tiers fall
        // back to free-tier priority 2 / limit 2 via COALESCE.
        let row = sqlx::query(&format!(
            "UPDATE jobs SET status = 'running', started_at_ms = ?1, updated_at_ms = ?1 \
             WHERE id = ( \
                 SELECT p.id FROM jobs p \
                 LEFT JOIN tier_limits t ON t.tier = p.tier \
                 WHERE p.status = 'pending' AND p.job_type = 'crawl' \
                   AND (COALESCE(t.max_concurrent_jobs, 2) = 0 \
                        OR (SELECT COUNT(*) FROM jobs r \
                            WHERE r.user_id = p.user_id AND r.status = 'running' \
                              AND COALESCE(r.started_at_ms, 0) > ?2) \
                           < COALESCE(t.max_concurrent_jobs, 2)) \
                 ORDER BY COALESCE(t.priority, 2) DESC, p.created_at_ms ASC \
                 LIMIT 1 \
             ) \
             RETURNING {JOB_COLS}"
        ))
        .bind(now)
        .bind(stale_cutoff_ms)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn finish_job(&self, id: &str, outcome: JobOutcome) -> Result<()> {
        let now = now_ms();
        let result = sqlx::query(
            "UPDATE jobs SET status = ?, error_message = ?, error_category = ?, \
             completed_at_ms = ?, updated_at_ms = ? WHERE id = ?",
        )
        .bind(outcome.status.as_str())
        .bind(&outcome.error_message)
        .bind(&outcome.error_category)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("job {id}")));
        }
        Ok(())
    }

    async fn set_urls_queued(&self, id: &str, urls_queued: i64) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET urls_queued = MAX(urls_queued, ?), updated_at_ms = ? WHERE id = ?",
        )
        .bind(urls_queued)
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_discovery_method(&self, id: &str, method: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET discovery_method = ?, updated_at_ms = ? WHERE id = ?")
            .bind(method)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_result(&self, new: NewJobResult) -> Result<JobResult> {
        let now = now_ms();
        let id = ids::new_id();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO job_results (id, job_id, url, parent_url, depth, crawl_status, data, \
             error_message, error_details, error_category, provider, model, is_byok, \
             retry_count, input_tokens, output_tokens, fetch_duration_ms, extract_duration_ms, \
             discovered_at_ms, completed_at_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&new.job_id)
        .bind(&new.url)
        .bind(&new.parent_url)
        .bind(new.depth)
        .bind(new.crawl_status.as_str())
        .bind(new.data.as_ref().map(ToString::to_string))
        .bind(&new.error_message)
        .bind(&new.error_details)
        .bind(&new.error_category)
        .bind(&new.provider)
        .bind(&new.model)
        .bind(i64::from(new.is_byok))
        .bind(new.retry_count)
        .bind(new.input_tokens)
        .bind(new.output_tokens)
        .bind(new.fetch_duration_ms)
        .bind(new.extract_duration_ms)
        .bind(new.discovered_at_ms)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE jobs SET page_count = page_count + 1, input_tokens = input_tokens + ?, \
             output_tokens = output_tokens + ?, cost_usd = cost_usd + ?, \
             llm_cost_usd = llm_cost_usd + ?, updated_at_ms = ? WHERE id = ?",
        )
        .bind(new.input_tokens)
        .bind(new.output_tokens)
        .bind(new.cost_usd)
        .bind(new.llm_cost_usd)
        .bind(now)
        .bind(&new.job_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let row = sqlx::query("SELECT * FROM job_results WHERE id = ?")
            .bind(&id)
            .fetch_one(&self.pool)
            .await?;
        result_from_row(&row)
    }

    async fn results_after(
        &self,
        job_id: &str,
        after_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<JobResult>> {
        let rows = sqlx::query(
            "SELECT * FROM job_results WHERE job_id = ? AND id > ? ORDER BY id ASC LIMIT ?",
        )
        .bind(job_id)
        .bind(after_id.unwrap_or(""))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(result_from_row).collect()
    }

    async fn count_results(&self, job_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_results WHERE job_id = ?")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn fail_stale(&self, cutoff_ms: i64, message: &str) -> Result<u64> {
        let now = now_ms();
        let result = sqlx::query(
            "UPDATE jobs SET status = 'failed', error_message = ?, error_category = 'timeout', \
             completed_at_ms = ?, updated_at_ms = ? \
             WHERE status = 'running' AND COALESCE(started_at_ms, 0) < ?",
        )
        .bind(message)
        .bind(now)
        .bind(now)
        .bind(cutoff_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn running_count(&self, user_id: &str, stale_cutoff_ms: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE user_id = ? AND status = 'running' \
             AND COALESCE(started_at_ms, 0) > ?",
        )
        .bind(user_id)
        .bind(stale_cutoff_ms)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn set_webhook_status(&self, id: &str, status: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET webhook_status = ?, updated_at_ms = ? WHERE id = ?")
            .bind(status)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_jobs_before(&self, cutoff_ms: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE created_at_ms < ?")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn sync_tier_limits(&self, tiers: &HashMap<String, TierLimits>) -> Result<()> {
        let now = now_ms();
        for (tier, limits) in tiers {
            sqlx::query(
                "INSERT INTO tier_limits (tier, priority, max_concurrent_jobs, \
                 max_pages_per_crawl, monthly_extractions, requests_per_minute, updated_at_ms) \
                 VALUES (?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(tier) DO UPDATE SET priority = excluded.priority, \
                 max_concurrent_jobs = excluded.max_concurrent_jobs, \
                 max_pages_per_crawl = excluded.max_pages_per_crawl, \
                 monthly_extractions = excluded.monthly_extractions, \
                 requests_per_minute = excluded.requests_per_minute, \
                 updated_at_ms = excluded.updated_at_ms",
            )
            .bind(tier)
            .bind(limits.job_priority)
            .bind(i64::from(limits.max_concurrent_jobs))
            .bind(i64::from(limits.max_pages_per_crawl))
            .bind(limits.monthly_extractions as i64)
            .bind(i64::from(limits.requests_per_minute))
            .bind(now)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }
}

// ── ChainStore ──────────────────────────────────────────────────────────────

fn chain_filter(scope: &ChainScope) -> (&'static str, Option<String>) {
    match scope {
        ChainScope::Default => ("tier IS NULL AND user_id IS NULL", None),
        ChainScope::Tier(t) => ("tier = ? AND user_id IS NULL", Some(t.clone())),
        ChainScope::User(u) => ("user_id = ?", Some(u.clone())),
    }
}

#[async_trait]
impl ChainStore for SqliteStore {
    async fn effective_admin_chain(&self, tier: &str) -> Result<Vec<ChainEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM chain_entries WHERE tier = ? AND user_id IS NULL AND enabled = 1 \
             ORDER BY position ASC",
        )
        .bind(tier)
        .fetch_all(&self.pool)
        .await?;
        if !rows.is_empty() {
            return Ok(rows.iter().map(chain_from_row).collect());
        }

        let rows = sqlx::query(
            "SELECT * FROM chain_entries WHERE tier IS NULL AND user_id IS NULL AND enabled = 1 \
             ORDER BY position ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(chain_from_row).collect())
    }

    async fn user_chain(&self, user_id: &str) -> Result<Vec<ChainEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM chain_entries WHERE user_id = ? AND enabled = 1 ORDER BY position ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(chain_from_row).collect())
    }

    async fn list_chain(&self, scope: &ChainScope) -> Result<Vec<ChainEntry>> {
        let (filter, bind) = chain_filter(scope);
        let sql = format!("SELECT * FROM chain_entries WHERE {filter} ORDER BY position ASC");
        let mut query = sqlx::query(&sql);
        if let Some(b) = bind {
            query = query.bind(b);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(chain_from_row).collect())
    }

    async fn replace_chain(
        &self,
        scope: &ChainScope,
        entries: Vec<NewChainEntry>,
    ) -> Result<Vec<ChainEntry>> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        // Delete-and-reinsert keeps (scope, position) unique even when the
        // caller reorders entries.
        let (filter, bind) = chain_filter(scope);
        let sql = format!("DELETE FROM chain_entries WHERE {filter}");
        let mut del = sqlx::query(&sql);
        if let Some(b) = bind {
            del = del.bind(b);
        }
        del.execute(&mut *tx).await?;

        for (i, entry) in entries.iter().enumerate() {
            sqlx::query(
                "INSERT INTO chain_entries (id, tier, user_id, position, provider, model, \
                 temperature, max_tokens, strict_mode, enabled, created_at_ms, updated_at_ms) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(ids::new_id())
            .bind(scope.tier())
            .bind(scope.user_id())
            .bind((i + 1) as i64)
            .bind(&entry.provider)
            .bind(&entry.model)
            .bind(entry.temperature)
            .bind(entry.max_tokens)
            .bind(entry.strict_mode.map(i64::from))
            .bind(i64::from(entry.enabled))
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        self.list_chain(scope).await
    }
}

// ── KeyStore ────────────────────────────────────────────────────────────────

fn service_key_from_row(row: &SqliteRow) -> ServiceKey {
    ServiceKey {
        id: row.get("id"),
        provider: row.get("provider"),
        api_key: row.get("api_key"),
        enabled: row.get::<i64, _>("enabled") != 0,
        created_at_ms: row.get("created_at_ms"),
        updated_at_ms: row.get("updated_at_ms"),
    }
}

fn user_key_from_row(row: &SqliteRow) -> UserServiceKey {
    UserServiceKey {
        id: row.get("id"),
        user_id: row.get("user_id"),
        provider: row.get("provider"),
        api_key: row.get("api_key"),
        enabled: row.get::<i64, _>("enabled") != 0,
        created_at_ms: row.get("created_at_ms"),
        updated_at_ms: row.get("updated_at_ms"),
    }
}

#[async_trait]
impl KeyStore for SqliteStore {
    async fn service_key(&self, provider: &str) -> Result<Option<ServiceKey>> {
        let row = sqlx::query("SELECT * FROM service_keys WHERE provider = ? AND enabled = 1")
            .bind(provider)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(service_key_from_row))
    }

    async fn list_service_keys(&self) -> Result<Vec<ServiceKey>> {
        let rows = sqlx::query("SELECT * FROM service_keys ORDER BY provider ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(service_key_from_row).collect())
    }

    async fn upsert_service_key(
        &self,
        provider: &str,
        api_key: &str,
        enabled: bool,
    ) -> Result<ServiceKey> {
        let now = now_ms();
        sqlx::query(
            "INSERT INTO service_keys (id, provider, api_key, enabled, created_at_ms, updated_at_ms) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(provider) DO UPDATE SET api_key = excluded.api_key, \
             enabled = excluded.enabled, updated_at_ms = excluded.updated_at_ms",
        )
        .bind(ids::new_id())
        .bind(provider)
        .bind(api_key)
        .bind(i64::from(enabled))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM service_keys WHERE provider = ?")
            .bind(provider)
            .fetch_one(&self.pool)
            .await?;
        Ok(service_key_from_row(&row))
    }

    async fn delete_service_key(&self, provider: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM service_keys WHERE provider = ?")
            .bind(provider)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("service key for {provider}")));
        }
        Ok(())
    }

    async fn user_key(&self, user_id: &str, provider: &str) -> Result<Option<UserServiceKey>> {
        let row = sqlx::query(
            "SELECT * FROM user_service_keys WHERE user_id = ? AND provider = ? AND enabled = 1",
        )
        .bind(user_id)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(user_key_from_row))
    }

    async fn list_user_keys(&self, user_id: &str) -> Result<Vec<UserServiceKey>> {
        let rows = sqlx::query("SELECT * FROM user_service_keys WHERE user_id = ? ORDER BY provider")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(user_key_from_row).collect())
    }

    async fn upsert_user_key(
        &self,
        user_id: &str,
        provider: &str,
        api_key: &str,
    ) -> Result<UserServiceKey> {
        let now = now_ms();
        sqlx::query(
            "INSERT INTO user_service_keys (id, user_id, provider, api_key, enabled, \
             created_at_ms, updated_at_ms) VALUES (?, ?, ?, ?, 1, ?, ?) \
             ON CONFLICT(user_id, provider) DO UPDATE SET api_key = excluded.api_key, \
             enabled = 1, updated_at_ms = excluded.updated_at_ms",
        )
        .bind(ids::new_id())
        .bind(user_id)
        .bind(provider)
        .bind(api_key)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM user_service_keys WHERE user_id = ? AND provider = ?")
            .bind(user_id)
            .bind(provider)
            .fetch_one(&self.pool)
            .await?;
        Ok(user_key_from_row(&row))
    }

    async fn delete_user_key(&self, user_id: &str, provider: &str) -> Result<()> {
        let result =
            sqlx::query("DELETE FROM user_service_keys WHERE user_id = ? AND provider = ?")
                .bind(user_id)
                .bind(provider)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("user key for {provider}")));
        }
        Ok(())
    }
}

// ── SuspensionStore ─────────────────────────────────────────────────────────

#[async_trait]
impl SuspensionStore for SqliteStore {
    async fn suspension(&self, key_hash: &str) -> Result<Option<KeySuspension>> {
        let row = sqlx::query("SELECT * FROM key_suspensions WHERE key_hash = ?")
            .bind(key_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| KeySuspension {
            key_hash: r.get("key_hash"),
            suspended_until_ms: r.get("suspended_until_ms"),
            backoff_count: r.get("backoff_count"),
            updated_at_ms: r.get("updated_at_ms"),
        }))
    }

    async fn record_rate_limit(&self, key_hash: &str, now_ms: i64) -> Result<KeySuspension> {
        let prior = self.suspension(key_hash).await?;
        let backoff_count = prior.map_or(1, |s| s.backoff_count + 1);
        let window = suspension_window_ms(backoff_count);
        let until = now_ms + window;

        sqlx::query(
            "INSERT INTO key_suspensions (key_hash, suspended_until_ms, backoff_count, updated_at_ms) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(key_hash) DO UPDATE SET suspended_until_ms = excluded.suspended_until_ms, \
             backoff_count = excluded.backoff_count, updated_at_ms = excluded.updated_at_ms",
        )
        .bind(key_hash)
        .bind(until)
        .bind(backoff_count)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;

        Ok(KeySuspension {
            key_hash: key_hash.to_string(),
            suspended_until_ms: until,
            backoff_count,
            updated_at_ms: now_ms,
        })
    }

    async fn clear_suspension(&self, key_hash: &str) -> Result<()> {
        sqlx::query("DELETE FROM key_suspensions WHERE key_hash = ?")
            .bind(key_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Exponential suspension window: 5s, 10s, 20s, ... capped at 5m.
#[must_use]
pub fn suspension_window_ms(backoff_count: i64) -> i64 {
    let shift = (backoff_count - 1).clamp(0, 10) as u32;
    (SUSPENSION_BASE_MS << shift).min(SUSPENSION_CAP_MS)
}

// ── AuthStore ───────────────────────────────────────────────────────────────

#[async_trait]
impl AuthStore for SqliteStore {
    async fn principal_for_key_hash(&self, key_hash: &str) -> Result<Option<ApiPrincipal>> {
        let row = sqlx::query("SELECT * FROM api_keys WHERE key_hash = ?")
            .bind(key_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| ApiPrincipal {
            user_id: r.get("user_id"),
            tier: r.get("tier"),
            is_admin: r.get::<i64, _>("is_admin") != 0,
            is_byok: r.get::<i64, _>("is_byok") != 0,
        }))
    }

    async fn insert_api_key(&self, key_hash: &str, principal: &ApiPrincipal) -> Result<()> {
        sqlx::query(
            "INSERT INTO api_keys (key_hash, user_id, tier, is_admin, is_byok, created_at_ms) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(key_hash) DO UPDATE SET user_id = excluded.user_id, \
             tier = excluded.tier, is_admin = excluded.is_admin, is_byok = excluded.is_byok",
        )
        .bind(key_hash)
        .bind(&principal.user_id)
        .bind(&principal.tier)
        .bind(i64::from(principal.is_admin))
        .bind(i64::from(principal.is_byok))
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ── WebhookStore ────────────────────────────────────────────────────────────

#[async_trait]
impl WebhookStore for SqliteStore {
    async fn create_webhook(&self, new: NewWebhook) -> Result<Webhook> {
        let now = now_ms();
        let id = ids::new_id();
        let result = sqlx::query(
            "INSERT INTO webhooks (id, user_id, name, url, events, secret_ciphertext, headers, \
             active, created_at_ms, updated_at_ms) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&new.user_id)
        .bind(&new.name)
        .bind(&new.url)
        .bind(serde_json::to_string(&new.events)?)
        .bind(&new.secret_ciphertext)
        .bind(new.headers.to_string())
        .bind(i64::from(new.active))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {},
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(Error::conflict(format!("webhook name {}", new.name)));
            },
            Err(e) => return Err(e.into()),
        }

        self.get_webhook(&new.user_id, &id)
            .await?
            .ok_or_else(|| Error::not_found(format!("webhook {id}")))
    }

    async fn list_webhooks(&self, user_id: &str) -> Result<Vec<Webhook>> {
        let rows = sqlx::query("SELECT * FROM webhooks WHERE user_id = ? ORDER BY name ASC")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(webhook_from_row).collect())
    }

    async fn get_webhook(&self, user_id: &str, id: &str) -> Result<Option<Webhook>> {
        let row = sqlx::query("SELECT * FROM webhooks WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(webhook_from_row))
    }

    async fn get_webhook_by_id(&self, id: &str) -> Result<Option<Webhook>> {
        let row = sqlx::query("SELECT * FROM webhooks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(webhook_from_row))
    }

    async fn update_webhook(
        &self,
        user_id: &str,
        id: &str,
        patch: WebhookPatch,
    ) -> Result<Webhook> {
        let Some(mut hook) = self.get_webhook(user_id, id).await? else {
            return Err(Error::not_found(format!("webhook {id}")));
        };

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

        sqlx::query(
            "UPDATE webhooks SET name = ?, url = ?, events = ?, secret_ciphertext = ?, \
             headers = ?, active = ?, updated_at_ms = ? WHERE id = ? AND user_id = ?",
        )
        .bind(&hook.name)
        .bind(&hook.url)
        .bind(serde_json::to_string(&hook.events)?)
        .bind(&hook.secret_ciphertext)
        .bind(hook.headers.to_string())
        .bind(i64::from(hook.active))
        .bind(now_ms())
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(hook)
    }

    async fn delete_webhook(&self, user_id: &str, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM webhooks WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("webhook {id}")));
        }
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
        let id = ids::new_id();
        sqlx::query(
            "INSERT INTO webhook_deliveries (id, webhook_id, job_id, event, url, payload, \
             status, attempt_number, max_attempts, created_at_ms, updated_at_ms) \
             VALUES (?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&new.webhook_id)
        .bind(&new.job_id)
        .bind(&new.event)
        .bind(&new.url)
        .bind(new.payload.to_string())
        .bind(new.max_attempts)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM webhook_deliveries WHERE id = ?")
            .bind(&id)
            .fetch_one(&self.pool)
            .await?;
        delivery_from_row(&row)
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
        sqlx::query(
            "UPDATE webhook_deliveries SET status = ?, attempt_number = ?, next_retry_at_ms = ?, \
             response_status = ?, error = ?, updated_at_ms = ? WHERE id = ?",
        )
        .bind(delivery.status.as_str())
        .bind(delivery.attempt_number)
        .bind(delivery.next_retry_at_ms)
        .bind(delivery.response_status)
        .bind(&delivery.error)
        .bind(now_ms())
        .bind(&delivery.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn due_deliveries(&self, now_ms: i64, limit: i64) -> Result<Vec<WebhookDelivery>> {
        let rows = sqlx::query(
            "SELECT * FROM webhook_deliveries WHERE status = 'retrying' \
             AND next_retry_at_ms <= ? ORDER BY id ASC LIMIT ?",
        )
        .bind(now_ms)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(delivery_from_row).collect()
    }

    async fn deliveries_for_webhook(
        &self,
        webhook_id: &str,
        limit: i64,
    ) -> Result<Vec<WebhookDelivery>> {
        let rows = sqlx::query(
            "SELECT * FROM webhook_deliveries WHERE webhook_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(webhook_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(delivery_from_row).collect()
    }

    async fn deliveries_for_job(&self, job_id: &str) -> Result<Vec<WebhookDelivery>> {
        let rows =
            sqlx::query("SELECT * FROM webhook_deliveries WHERE job_id = ? ORDER BY id ASC")
                .bind(job_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(delivery_from_row).collect()
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;

    async fn make_store() -> SqliteStore {
        SqliteStore::new("sqlite::memory:").await.unwrap()
    }

    fn new_job(user: &str, tier: &str) -> NewJob {
        NewJob {
            user_id: user.into(),
            job_type: JobType::Crawl,
            url: "https://example.com".into(),
            schema: serde_json::json!({"title": "string"}),
            crawl_options: serde_json::json!({}),
            config_chain: serde_json::json!([]),
            tier: tier.into(),
            is_byok: false,
            webhook_url: None,
        }
    }

    fn new_result(job_id: &str, url: &str) -> NewJobResult {
        NewJobResult {
            job_id: job_id.into(),
            url: url.into(),
            parent_url: None,
            depth: 0,
            crawl_status: CrawlStatus::Completed,
            data: Some(serde_json::json!({"title": "X"})),
            error_message: None,
            error_details: None,
            error_category: None,
            provider: Some("openrouter".into()),
            model: Some("claude-3-5-sonnet".into()),
            is_byok: false,
            retry_count: 0,
            input_tokens: 800,
            output_tokens: 200,
            cost_usd: 0.0054,
            llm_cost_usd: 0.0054,
            fetch_duration_ms: 120,
            extract_duration_ms: 900,
            discovered_at_ms: now_ms(),
        }
    }

    async fn sync_builtin_tiers(store: &SqliteStore) {
        let table = quarry_config::TierTable::new();
        let snapshot = table.snapshot();
        store.sync_tier_limits(&snapshot).await.unwrap();
    }

    #[tokio::test]
    async fn create_and_get_job() {
        let store = make_store().await;
        let job = store.create_job(new_job("u1", "standard")).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at_ms.is_none());

        let fetched = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.schema, serde_json::json!({"title": "string"}));

        assert!(store.get_job_for_user("u2", &job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_pending_sets_running_and_started() {
        let store = make_store().await;
        sync_builtin_tiers(&store).await;
        let job = store.create_job(new_job("u1", "standard")).await.unwrap();

        let claimed = store.claim_pending(0).await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(claimed.started_at_ms.is_some());
        assert_eq!(claimed.job_type, JobType::Crawl);
    }

    #[tokio::test]
    async fn claim_pending_empty_queue_returns_none() {
        let store = make_store().await;
        sync_builtin_tiers(&store).await;
        assert!(store.claim_pending(0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_pending_skips_non_crawl_jobs() {
        let store = make_store().await;
        sync_builtin_tiers(&store).await;
        let mut extract = new_job("u1", "standard");
        extract.job_type = JobType::Extract;
        store.create_job(extract).await.unwrap();

        assert!(store.claim_pending(0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_pending_prefers_higher_tier_priority() {
        let store = make_store().await;
        sync_builtin_tiers(&store).await;
        // Free tenant submits first; pro should still win.
        store.create_job(new_job("free-user", "free")).await.unwrap();
        let pro = store.create_job(new_job("pro-user", "pro")).await.unwrap();

        let claimed = store.claim_pending(0).await.unwrap().unwrap();
        assert_eq!(claimed.id, pro.id);
    }

    #[tokio::test]
    async fn claim_pending_ties_break_on_created_at() {
        let store = make_store().await;
        sync_builtin_tiers(&store).await;
        let first = store.create_job(new_job("a", "standard")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(3)).await;
        store.create_job(new_job("b", "standard")).await.unwrap();

        let claimed = store.claim_pending(0).await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
    }

    #[tokio::test]
    async fn claim_pending_enforces_tenant_concurrency_cap() {
        let store = make_store().await;
        sync_builtin_tiers(&store).await;
        // Free tier caps at 2 concurrent jobs.
        for _ in 0..3 {
            store.create_job(new_job("u1", "free")).await.unwrap();
        }

        let first = store.claim_pending(0).await.unwrap().unwrap();
        assert!(store.claim_pending(0).await.unwrap().is_some());
        assert!(
            store.claim_pending(0).await.unwrap().is_none(),
            "third claim must respect the tenant cap"
        );

        // A capped tenant does not starve others.
        let other = store.create_job(new_job("u2", "free")).await.unwrap();
        let claimed = store.claim_pending(0).await.unwrap().unwrap();
        assert_eq!(claimed.id, other.id);

        // Completing one job frees the slot for the third.
        store.finish_job(&first.id, JobOutcome::completed()).await.unwrap();
        let third = store.claim_pending(0).await.unwrap().unwrap();
        assert_eq!(third.user_id, "u1");
    }

    #[tokio::test]
    async fn capped_tenant_does_not_block_lower_priority_tenant() {
        let store = make_store().await;
        sync_builtin_tiers(&store).await;
        // Pro tenant at cap would outrank free, but limit removes eligibility.
        let table = quarry_config::TierTable::new();
        let mut snapshot = (*table.snapshot()).clone();
        if let Some(pro) = snapshot.get_mut("pro") {
            pro.max_concurrent_jobs = 1;
        }
        store.sync_tier_limits(&snapshot).await.unwrap();

        store.create_job(new_job("pro-user", "pro")).await.unwrap();
        store.create_job(new_job("pro-user", "pro")).await.unwrap();
        let free = store.create_job(new_job("free-user", "free")).await.unwrap();

        assert!(store.claim_pending(0).await.unwrap().is_some());
        let second = store.claim_pending(0).await.unwrap().unwrap();
        assert_eq!(second.id, free.id, "priority only orders eligible jobs");
    }

    #[tokio::test]
    async fn parallel_claims_get_distinct_jobs() {
        let store = std::sync::Arc::new(make_store().await);
        sync_builtin_tiers(&store).await;
        store.create_job(new_job("u1", "standard")).await.unwrap();

        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.claim_pending(0).await.unwrap() })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.claim_pending(0).await.unwrap() })
        };
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(
            a.is_some() ^ b.is_some(),
            "exactly one worker may claim the single job"
        );
    }

    #[tokio::test]
    async fn zero_concurrency_limit_means_unlimited() {
        let store = make_store().await;
        sync_builtin_tiers(&store).await;
        for _ in 0..5 {
            store.create_job(new_job("u1", "selfhosted")).await.unwrap();
        }
        for _ in 0..5 {
            assert!(store.claim_pending(0).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn stale_running_jobs_do_not_count_toward_cap() {
        let store = make_store().await;
        sync_builtin_tiers(&store).await;
        store.create_job(new_job("u1", "free")).await.unwrap();
        store.create_job(new_job("u1", "free")).await.unwrap();
        store.create_job(new_job("u1", "free")).await.unwrap();

        assert!(store.claim_pending(0).await.unwrap().is_some());
        assert!(store.claim_pending(0).await.unwrap().is_some());
        assert!(store.claim_pending(0).await.unwrap().is_none());

        // With a future cutoff both running jobs read as stale, freeing slots.
        let cutoff = now_ms() + 60_000;
        assert!(store.claim_pending(cutoff).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn add_result_rolls_up_job_counters() {
        let store = make_store().await;
        let job = store.create_job(new_job("u1", "standard")).await.unwrap();

        store.add_result(new_result(&job.id, "https://example.com/a")).await.unwrap();
        store.add_result(new_result(&job.id, "https://example.com/b")).await.unwrap();

        let job = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.page_count, 2);
        assert_eq!(job.input_tokens, 1600);
        assert_eq!(job.output_tokens, 400);
        assert!((job.cost_usd - 0.0108).abs() < 1e-9);
        assert_eq!(job.page_count, store.count_results(&job.id).await.unwrap());
    }

    #[tokio::test]
    async fn results_after_returns_new_rows_in_id_order() {
        let store = make_store().await;
        let job = store.create_job(new_job("u1", "standard")).await.unwrap();

        let r1 = store.add_result(new_result(&job.id, "https://example.com/1")).await.unwrap();
        let r2 = store.add_result(new_result(&job.id, "https://example.com/2")).await.unwrap();
        let r3 = store.add_result(new_result(&job.id, "https://example.com/3")).await.unwrap();
        assert!(r1.id < r2.id && r2.id < r3.id);

        let all = store.results_after(&job.id, None, 100).await.unwrap();
        assert_eq!(
            all.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec![r1.id.as_str(), r2.id.as_str(), r3.id.as_str()]
        );

        let after = store.results_after(&job.id, Some(&r1.id), 100).await.unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].id, r2.id);
    }

    #[tokio::test]
    async fn fail_stale_flips_old_running_jobs() {
        let store = make_store().await;
        sync_builtin_tiers(&store).await;
        let job = store.create_job(new_job("u1", "standard")).await.unwrap();
        store.claim_pending(0).await.unwrap().unwrap();

        let flipped = store
            .fail_stale(now_ms() + 1_000, "server restart or timeout")
            .await
            .unwrap();
        assert_eq!(flipped, 1);

        let job = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_category.as_deref(), Some("timeout"));
        assert!(job.completed_at_ms.is_some());
    }

    #[tokio::test]
    async fn finish_job_writes_terminal_row() {
        let store = make_store().await;
        let job = store.create_job(new_job("u1", "standard")).await.unwrap();
        store.finish_job(&job.id, JobOutcome::completed()).await.unwrap();

        let job = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at_ms.is_some());
    }

    #[tokio::test]
    async fn urls_queued_is_monotonic() {
        let store = make_store().await;
        let job = store.create_job(new_job("u1", "standard")).await.unwrap();

        store.set_urls_queued(&job.id, 10).await.unwrap();
        store.set_urls_queued(&job.id, 4).await.unwrap();
        let job = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.urls_queued, 10);
    }

    #[tokio::test]
    async fn delete_jobs_before_cascades() {
        let store = make_store().await;
        let job = store.create_job(new_job("u1", "standard")).await.unwrap();
        store.add_result(new_result(&job.id, "https://example.com/a")).await.unwrap();

        let deleted = store.delete_jobs_before(now_ms() + 1_000).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.count_results(&job.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn effective_chain_prefers_tier_over_default() {
        let store = make_store().await;
        let entry = |provider: &str, model: &str| NewChainEntry {
            provider: provider.into(),
            model: model.into(),
            temperature: None,
            max_tokens: None,
            strict_mode: None,
            enabled: true,
        };

        store
            .replace_chain(&ChainScope::Default, vec![
                entry("openai", "gpt-4o-mini"),
                entry("openrouter", "claude-3-5-sonnet"),
            ])
            .await
            .unwrap();

        // No tier chain yet: default applies.
        let chain = store.effective_admin_chain("pro").await.unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].provider, "openai");
        assert_eq!(chain[0].position, 1);

        store
            .replace_chain(&ChainScope::Tier("pro".into()), vec![entry(
                "anthropic",
                "claude-3-7-sonnet",
            )])
            .await
            .unwrap();

        let chain = store.effective_admin_chain("pro").await.unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].provider, "anthropic");
        // Other tiers still see the default.
        let chain = store.effective_admin_chain("free").await.unwrap();
        assert_eq!(chain.len(), 2);
    }

    #[tokio::test]
    async fn disabled_entries_are_filtered_from_effective_chain() {
        let store = make_store().await;
        store
            .replace_chain(&ChainScope::Default, vec![
                NewChainEntry {
                    provider: "openai".into(),
                    model: "gpt-4o-mini".into(),
                    temperature: None,
                    max_tokens: None,
                    strict_mode: None,
                    enabled: false,
                },
                NewChainEntry {
                    provider: "openrouter".into(),
                    model: "claude-3-5-sonnet".into(),
                    temperature: Some(0.1),
                    max_tokens: Some(8192),
                    strict_mode: Some(true),
                    enabled: true,
                },
            ])
            .await
            .unwrap();

        let chain = store.effective_admin_chain("standard").await.unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].provider, "openrouter");
        assert_eq!(chain[0].strict_mode, Some(true));

        // Admin listing still shows both.
        let all = store.list_chain(&ChainScope::Default).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn replace_chain_reorders_without_conflicts() {
        let store = make_store().await;
        let entry = |provider: &str| NewChainEntry {
            provider: provider.into(),
            model: "m".into(),
            temperature: None,
            max_tokens: None,
            strict_mode: None,
            enabled: true,
        };

        store
            .replace_chain(&ChainScope::Default, vec![entry("a"), entry("b"), entry("c")])
            .await
            .unwrap();
        let swapped = store
            .replace_chain(&ChainScope::Default, vec![entry("c"), entry("b"), entry("a")])
            .await
            .unwrap();

        assert_eq!(
            swapped.iter().map(|e| e.provider.as_str()).collect::<Vec<_>>(),
            vec!["c", "b", "a"]
        );
        assert_eq!(
            swapped.iter().map(|e| e.position).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn user_chain_is_scoped() {
        let store = make_store().await;
        let entry = NewChainEntry {
            provider: "anthropic".into(),
            model: "claude-3-5-haiku".into(),
            temperature: None,
            max_tokens: None,
            strict_mode: None,
            enabled: true,
        };
        store
            .replace_chain(&ChainScope::User("u1".into()), vec![entry])
            .await
            .unwrap();

        assert_eq!(store.user_chain("u1").await.unwrap().len(), 1);
        assert!(store.user_chain("u2").await.unwrap().is_empty());
        // User chains never leak into admin chains.
        assert!(store.effective_admin_chain("free").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn service_key_upsert_and_enabled_filter() {
        let store = make_store().await;
        store.upsert_service_key("openai", "sk-1", true).await.unwrap();
        store.upsert_service_key("openai", "sk-2", false).await.unwrap();

        assert!(store.service_key("openai").await.unwrap().is_none());
        let all = store.list_service_keys().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].api_key, "sk-2");
    }

    #[tokio::test]
    async fn user_keys_unique_per_provider() {
        let store = make_store().await;
        store.upsert_user_key("u1", "openai", "sk-a").await.unwrap();
        store.upsert_user_key("u1", "openai", "sk-b").await.unwrap();

        let key = store.user_key("u1", "openai").await.unwrap().unwrap();
        assert_eq!(key.api_key, "sk-b");
        assert_eq!(store.list_user_keys("u1").await.unwrap().len(), 1);
        assert!(store.user_key("u2", "openai").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn suspension_backoff_doubles_and_caps() {
        let store = make_store().await;
        let now = 1_000_000;

        let s1 = store.record_rate_limit("hash", now).await.unwrap();
        assert_eq!(s1.backoff_count, 1);
        assert_eq!(s1.suspended_until_ms, now + 5_000);

        let s2 = store.record_rate_limit("hash", now).await.unwrap();
        assert_eq!(s2.backoff_count, 2);
        assert_eq!(s2.suspended_until_ms, now + 10_000);

        let s3 = store.record_rate_limit("hash", now).await.unwrap();
        assert_eq!(s3.backoff_count, 3);
        assert_eq!(s3.suspended_until_ms, now + 20_000);

        // Far down the curve the window caps at five minutes.
        for _ in 0..10 {
            store.record_rate_limit("hash", now).await.unwrap();
        }
        let capped = store.suspension("hash").await.unwrap().unwrap();
        assert_eq!(capped.suspended_until_ms, now + 5 * 60 * 1_000);

        store.clear_suspension("hash").await.unwrap();
        assert!(store.suspension("hash").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn webhook_crud_and_unique_name() {
        let store = make_store().await;
        let new = NewWebhook {
            user_id: "u1".into(),
            name: "prod".into(),
            url: "https://example.com/hook".into(),
            events: vec!["job.completed".into()],
            secret_ciphertext: vec![9, 9, 9],
            headers: serde_json::json!({"x-env": "prod"}),
            active: true,
        };
        let hook = store.create_webhook(new.clone()).await.unwrap();
        assert!(matches!(
            store.create_webhook(new).await,
            Err(Error::Conflict { .. })
        ));

        let hooks = store.webhooks_for_event("u1", "job.completed").await.unwrap();
        assert_eq!(hooks.len(), 1);
        assert!(store.webhooks_for_event("u1", "job.failed").await.unwrap().is_empty());

        store
            .update_webhook(&hook.user_id, &hook.id, WebhookPatch {
                active: Some(false),
                ..WebhookPatch::default()
            })
            .await
            .unwrap();
        assert!(store.webhooks_for_event("u1", "job.completed").await.unwrap().is_empty());

        store.delete_webhook("u1", &hook.id).await.unwrap();
        assert!(store.list_webhooks("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deliveries_due_selection_in_id_order() {
        let store = make_store().await;
        let job = store.create_job(new_job("u1", "standard")).await.unwrap();
        let new_delivery = |event: &str| NewDelivery {
            webhook_id: None,
            job_id: job.id.clone(),
            event: event.into(),
            url: "https://example.com/hook".into(),
            payload: serde_json::json!({"event": event}),
            max_attempts: 5,
        };

        let mut d1 = store.create_delivery(new_delivery("job.completed")).await.unwrap();
        let mut d2 = store.create_delivery(new_delivery("job.failed")).await.unwrap();
        assert_eq!(d1.status, DeliveryStatus::Pending);

        d1.status = DeliveryStatus::Retrying;
        d1.attempt_number = 1;
        d1.next_retry_at_ms = Some(5_000);
        store.update_delivery(&d1).await.unwrap();
        d2.status = DeliveryStatus::Retrying;
        d2.attempt_number = 1;
        d2.next_retry_at_ms = Some(50_000);
        store.update_delivery(&d2).await.unwrap();

        let due = store.due_deliveries(10_000, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, d1.id);

        let due = store.due_deliveries(60_000, 10).await.unwrap();
        assert_eq!(due.iter().map(|d| d.id.as_str()).collect::<Vec<_>>(), vec![
            d1.id.as_str(),
            d2.id.as_str()
        ]);

        assert_eq!(store.deliveries_for_job(&job.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn api_key_principal_lookup() {
        let store = make_store().await;
        let principal = ApiPrincipal {
            user_id: "u1".into(),
            tier: "pro".into(),
            is_admin: false,
            is_byok: true,
        };
        store.insert_api_key("hash-1", &principal).await.unwrap();

        let found = store.principal_for_key_hash("hash-1").await.unwrap().unwrap();
        assert_eq!(found.user_id, "u1");
        assert!(found.is_byok);
        assert!(store.principal_for_key_hash("hash-2").await.unwrap().is_none());
    }
}
