//! Job queries: listing, results, SSE streaming, crawl map, download.

use std::{collections::HashMap, convert::Infallible, time::Duration};

use {
    axum::{
        Extension, Json,
        extract::{Path, Query, State},
        response::{
            IntoResponse, Response,
            sse::{Event, KeepAlive, Sse},
        },
    },
    futures::Stream,
    serde::{Deserialize, Serialize},
    serde_json::json,
};

use quarry_store::{
    JobStore as _, WebhookStore as _,
    types::{Job, JobResult},
};

use crate::{
    auth::Principal,
    error::{ApiError, ApiResult},
    state::SharedState,
};

/// How often the SSE stream polls for new rows.
const STREAM_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 500;

/// Job as the API exposes it. The row's `config_chain` snapshot carries
/// credentials and never leaves the process.
#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub job_type: &'static str,
    pub status: &'static str,
    pub url: String,
    pub schema: serde_json::Value,
    pub crawl_options: serde_json::Value,
    pub tier: String,
    pub is_byok: bool,
    pub discovery_method: String,
    pub urls_queued: i64,
    pub page_count: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost_usd: f64,
    pub webhook_url: Option<String>,
    pub webhook_status: Option<String>,
    pub error_message: Option<String>,
    pub error_category: Option<String>,
    pub created_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub completed_at_ms: Option<i64>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            user_id: job.user_id,
            job_type: job.job_type.as_str(),
            status: job.status.as_str(),
            url: job.url,
            schema: job.schema,
            crawl_options: job.crawl_options,
            tier: job.tier,
            is_byok: job.is_byok,
            discovery_method: job.discovery_method,
            urls_queued: job.urls_queued,
            page_count: job.page_count,
            input_tokens: job.input_tokens,
            output_tokens: job.output_tokens,
            cost_usd: job.cost_usd,
            webhook_url: job.webhook_url,
            webhook_status: job.webhook_status,
            error_message: job.error_message,
            error_category: job.error_category,
            created_at_ms: job.created_at_ms,
            started_at_ms: job.started_at_ms,
            completed_at_ms: job.completed_at_ms,
        }
    }
}

/// Strip provider error text for platform tenants.
fn sanitize_result(principal: &Principal, mut result: JobResult) -> JobResult {
    if !principal.0.is_byok && !principal.0.is_admin {
        if let Some(category) = result
            .error_category
            .as_deref()
            .and_then(quarry_llm::ErrorCategory::parse)
        {
            result.error_message = Some(category.canonical_message().to_string());
        }
        result.error_details = None;
    }
    result
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    /// Return rows with id strictly greater than this cursor.
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

async fn owned_job(state: &SharedState, principal: &Principal, id: &str) -> ApiResult<Job> {
    state
        .jobs
        .get_job_for_user(principal.user_id(), id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("job {id}")))
}

/// `GET /jobs`
pub async fn list(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0).max(0);
    let jobs = state.jobs.list_jobs(principal.user_id(), limit, offset).await?;
    let views: Vec<JobView> = jobs.into_iter().map(JobView::from).collect();
    Ok(Json(json!({"jobs": views})))
}

/// `GET /jobs/{id}`
pub async fn get(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobView>> {
    let job = owned_job(&state, &principal, &id).await?;
    Ok(Json(JobView::from(job)))
}

/// `GET /jobs/{id}/results?after=<id>`
pub async fn results(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Query(query): Query<ResultsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    owned_job(&state, &principal, &id).await?;
    if let Some(after) = &query.after
        && !quarry_common::ids::is_valid(after)
    {
        return Err(ApiError::bad_request("after must be a result id"));
    }

    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let rows = state
        .jobs
        .results_after(&id, query.after.as_deref(), limit)
        .await?;
    let rows: Vec<JobResult> = rows
        .into_iter()
        .map(|r| sanitize_result(&principal, r))
        .collect();
    Ok(Json(json!({"results": rows})))
}

/// `GET /jobs/{id}/stream`: one `result` event per new row, then `done`.
pub async fn stream(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    owned_job(&state, &principal, &id).await?;

    let stream = async_stream::stream! {
        let mut last_id: Option<String> = None;
        loop {
            let rows = match state.jobs.results_after(&id, last_id.as_deref(), 100).await {
                Ok(rows) => rows,
                Err(e) => {
                    yield Ok(Event::default().event("done").data(
                        json!({"status": "failed", "error": e.to_string()}).to_string(),
                    ));
                    break;
                },
            };

            for row in rows {
                last_id = Some(row.id.clone());
                let row = sanitize_result(&principal, row);
                if let Ok(data) = serde_json::to_string(&row) {
                    yield Ok(Event::default().event("result").data(data));
                }
            }

            match state.jobs.get_job(&id).await {
                Ok(Some(job)) if job.status.is_terminal() => {
                    // Drain once more so rows racing the terminal write
                    // are not lost.
                    if let Ok(rows) = state.jobs.results_after(&id, last_id.as_deref(), 100).await {
                        for row in rows {
                            last_id = Some(row.id.clone());
                            let row = sanitize_result(&principal, row);
                            if let Ok(data) = serde_json::to_string(&row) {
                                yield Ok(Event::default().event("result").data(data));
                            }
                        }
                    }
                    yield Ok(Event::default().event("done").data(
                        json!({
                            "status": job.status.as_str(),
                            "error": job.error_message,
                        })
                        .to_string(),
                    ));
                    break;
                },
                Ok(_) => {},
                Err(e) => {
                    yield Ok(Event::default().event("done").data(
                        json!({"status": "failed", "error": e.to_string()}).to_string(),
                    ));
                    break;
                },
            }

            tokio::time::sleep(STREAM_POLL_INTERVAL).await;
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Serialize)]
struct CrawlMapNode {
    url: String,
    depth: i64,
    crawl_status: &'static str,
    children: Vec<CrawlMapNode>,
}

/// `GET /jobs/{id}/crawl-map`: parent/child tree of attempted pages.
pub async fn crawl_map(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    owned_job(&state, &principal, &id).await?;
    let rows = state.jobs.results_after(&id, None, 10_000).await?;

    let mut children_of: HashMap<Option<String>, Vec<&JobResult>> = HashMap::new();
    for row in &rows {
        children_of.entry(row.parent_url.clone()).or_default().push(row);
    }

    fn build(
        children_of: &HashMap<Option<String>, Vec<&JobResult>>,
        parent: Option<&str>,
    ) -> Vec<CrawlMapNode> {
        children_of
            .get(&parent.map(str::to_string))
            .map(|rows| {
                rows.iter()
                    .map(|r| CrawlMapNode {
                        url: r.url.clone(),
                        depth: r.depth,
                        crawl_status: r.crawl_status.as_str(),
                        children: build(children_of, Some(&r.url)),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    let roots = build(&children_of, None);
    Ok(Json(json!({"job_id": id, "pages": roots})))
}

/// `GET /jobs/{id}/download`: collected results as a JSON attachment.
pub async fn download(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let job = owned_job(&state, &principal, &id).await?;
    let rows = state.jobs.results_after(&id, None, 100_000).await?;

    let body = json!({
        "job": JobView::from(job),
        "results": rows
            .into_iter()
            .map(|r| sanitize_result(&principal, r))
            .collect::<Vec<_>>(),
    });
    let response = (
        [(
            http::header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{id}-results.json\""),
        )],
        Json(body),
    );
    Ok(response.into_response())
}

/// `GET /jobs/{id}/webhooks`: delivery attempts for this job.
pub async fn deliveries(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    owned_job(&state, &principal, &id).await?;
    let rows = state.webhooks.deliveries_for_job(&id).await?;
    Ok(Json(json!({"deliveries": rows})))
}
