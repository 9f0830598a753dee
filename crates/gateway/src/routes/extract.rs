//! Extraction entry points: synchronous extract/analyze and async crawl.

use {
    axum::{Extension, Json, extract::State},
    serde::Deserialize,
    serde_json::json,
    tokio_util::sync::CancellationToken,
    tracing::info,
    url::Url,
};

use {
    quarry_crawler::{CrawlOptions, FetchMode, Fetcher as _},
    quarry_llm::{ExtractFailure, ExtractRequest},
    quarry_store::{
        JobStore as _,
        types::{CrawlStatus, JobOutcome, JobType, NewJob, NewJobResult, now_ms},
    },
};

use crate::{
    auth::Principal,
    error::{ApiError, ApiResult},
    state::SharedState,
};

#[derive(Debug, Deserialize)]
pub struct ExtractBody {
    pub url: String,
    pub schema: serde_json::Value,
    #[serde(default)]
    pub options: ExtractOptions,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ExtractOptions {
    pub dynamic: bool,
}

#[derive(Debug, Deserialize)]
pub struct CrawlBody {
    pub url: String,
    pub schema: serde_json::Value,
    #[serde(default)]
    pub crawl_options: CrawlOptions,
    /// Inline delivery URL for this job only.
    pub webhook: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeBody {
    pub url: String,
    #[serde(default)]
    pub options: ExtractOptions,
}

/// Schema used by `/analyze` to ask the model for a schema.
fn analyze_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "page_type": {"type": "string"},
            "description": {"type": "string"},
            "suggested_schema": {"type": "object"},
        },
        "required": ["page_type", "suggested_schema"],
    })
}

fn parse_url(raw: &str) -> ApiResult<Url> {
    let url = Url::parse(raw).map_err(|e| ApiError::bad_request(format!("invalid url: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ApiError::bad_request("url must be http(s)"));
    }
    Ok(url)
}

/// Hide provider internals from platform tenants; BYOK tenants and admins
/// see the raw provider message.
pub fn sanitize_failure(principal: &Principal, failure: &ExtractFailure) -> String {
    if principal.0.is_byok || principal.0.is_admin {
        failure.message.clone()
    } else {
        failure.category.canonical_message().to_string()
    }
}

/// `POST /extract`: fetch one page and run the chain synchronously.
pub async fn extract(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<ExtractBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let url = parse_url(&body.url)?;
    let chain = state
        .resolver
        .resolve(principal.user_id(), &principal.0.tier, principal.0.is_byok)
        .await?;
    if chain.is_empty() {
        return Err(ApiError::bad_request(
            "no extraction config available: configure keys or contact support",
        ));
    }

    let job = state
        .jobs
        .create_job(NewJob {
            user_id: principal.user_id().to_string(),
            job_type: JobType::Extract,
            url: url.to_string(),
            schema: body.schema.clone(),
            crawl_options: json!({}),
            config_chain: serde_json::to_value(&chain).map_err(anyhow::Error::from)?,
            tier: principal.0.tier.clone(),
            is_byok: principal.0.is_byok,
            webhook_url: None,
        })
        .await?;

    let mode = if body.options.dynamic {
        FetchMode::Dynamic
    } else {
        FetchMode::Static
    };

    let discovered_at = now_ms();
    let fetch_started = std::time::Instant::now();
    let page = match state.fetcher.fetch(&url, mode).await {
        Ok(page) => page,
        Err(e) => {
            state
                .jobs
                .finish_job(&job.id, JobOutcome::failed(e.to_string(), None))
                .await?;
            return Ok(Json(json!({
                "job_id": job.id,
                "status": "failed",
                "error": e.to_string(),
            })));
        },
    };
    let fetch_ms = fetch_started.elapsed().as_millis() as i64;

    let request = ExtractRequest {
        url: url.to_string(),
        content: page.content,
        schema: body.schema,
    };
    let extract_started = std::time::Instant::now();
    let outcome = state
        .executor
        .execute(&chain, &request, &CancellationToken::new())
        .await;
    let extract_ms = extract_started.elapsed().as_millis() as i64;

    match outcome {
        Ok(result) => {
            state
                .jobs
                .add_result(NewJobResult {
                    job_id: job.id.clone(),
                    url: url.to_string(),
                    parent_url: None,
                    depth: 0,
                    crawl_status: CrawlStatus::Completed,
                    data: Some(result.extraction.data.clone()),
                    error_message: None,
                    error_details: None,
                    error_category: None,
                    provider: Some(result.provider.clone()),
                    model: Some(result.model.clone()),
                    is_byok: principal.0.is_byok,
                    retry_count: result.retry_count,
                    input_tokens: result.extraction.input_tokens,
                    output_tokens: result.extraction.output_tokens,
                    cost_usd: result.extraction.cost_usd,
                    llm_cost_usd: result.extraction.llm_cost_usd,
                    fetch_duration_ms: fetch_ms,
                    extract_duration_ms: extract_ms,
                    discovered_at_ms: discovered_at,
                })
                .await?;
            state.jobs.finish_job(&job.id, JobOutcome::completed()).await?;

            info!(job_id = %job.id, provider = %result.provider, "extract completed");
            Ok(Json(json!({
                "job_id": job.id,
                "status": "completed",
                "data": result.extraction.data,
                "usage": {
                    "input_tokens": result.extraction.input_tokens,
                    "output_tokens": result.extraction.output_tokens,
                    "cost_usd": result.extraction.cost_usd,
                },
            })))
        },
        Err(failure) => {
            let visible = sanitize_failure(&principal, &failure);
            state
                .jobs
                .finish_job(
                    &job.id,
                    JobOutcome::failed(visible.clone(), Some(failure.category.as_str().into())),
                )
                .await?;
            // Failures surface as a failed envelope, not an HTTP error.
            Ok(Json(json!({
                "job_id": job.id,
                "status": "failed",
                "error": visible,
                "error_category": failure.category.as_str(),
            })))
        },
    }
}

/// `POST /crawl`: create a pending crawl job for the scheduler.
pub async fn crawl(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<CrawlBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let url = parse_url(&body.url)?;
    if let Some(webhook) = &body.webhook {
        parse_url(webhook)?;
    }

    let chain = state
        .resolver
        .resolve(principal.user_id(), &principal.0.tier, principal.0.is_byok)
        .await?;
    if chain.is_empty() {
        return Err(ApiError::bad_request(
            "no extraction config available: configure keys or contact support",
        ));
    }

    // The tier's page cap bounds whatever the tenant asked for.
    let mut options = body.crawl_options;
    let limits = state.tiers.get(&principal.0.tier);
    if limits.max_pages_per_crawl > 0 {
        options.max_pages = if options.max_pages == 0 {
            limits.max_pages_per_crawl
        } else {
            options.max_pages.min(limits.max_pages_per_crawl)
        };
    }

    let job = state
        .jobs
        .create_job(NewJob {
            user_id: principal.user_id().to_string(),
            job_type: JobType::Crawl,
            url: url.to_string(),
            schema: body.schema,
            crawl_options: serde_json::to_value(&options).map_err(anyhow::Error::from)?,
            config_chain: serde_json::to_value(&chain).map_err(anyhow::Error::from)?,
            tier: principal.0.tier.clone(),
            is_byok: principal.0.is_byok,
            webhook_url: body.webhook,
        })
        .await?;

    info!(job_id = %job.id, user_id = %job.user_id, "crawl job queued");
    Ok(Json(json!({"job_id": job.id, "status": "pending"})))
}

/// `POST /analyze`: fetch a page and suggest an extraction schema.
pub async fn analyze(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<AnalyzeBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let url = parse_url(&body.url)?;
    let chain = state
        .resolver
        .resolve(principal.user_id(), &principal.0.tier, principal.0.is_byok)
        .await?;
    if chain.is_empty() {
        return Err(ApiError::bad_request(
            "no extraction config available: configure keys or contact support",
        ));
    }

    let mode = if body.options.dynamic {
        FetchMode::Dynamic
    } else {
        FetchMode::Static
    };
    let page = state
        .fetcher
        .fetch(&url, mode)
        .await
        .map_err(|e| ApiError::bad_request(format!("fetch failed: {e}")))?;

    let request = ExtractRequest {
        url: url.to_string(),
        content: page.content,
        schema: analyze_schema(),
    };
    match state
        .executor
        .execute(&chain, &request, &CancellationToken::new())
        .await
    {
        Ok(result) => Ok(Json(json!({
            "url": url.to_string(),
            "analysis": result.extraction.data,
        }))),
        Err(failure) => Ok(Json(json!({
            "url": url.to_string(),
            "error": sanitize_failure(&principal, &failure),
            "error_category": failure.category.as_str(),
        }))),
    }
}
