//! Router assembly and the HTTP entry point.

use std::net::SocketAddr;

use {
    axum::{
        Json, Router,
        extract::{ConnectInfo, Request, State},
        middleware::{self, Next},
        response::Response,
        routing::{delete, get, post, put},
    },
    tokio_util::sync::CancellationToken,
    tower_http::{
        catch_panic::CatchPanicLayer,
        cors::{AllowOrigin, CorsLayer},
        request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
        trace::TraceLayer,
    },
    tracing::{info, warn},
};

use crate::{
    auth,
    error::ApiError,
    routes::{admin, extract, jobs, llm, webhooks},
    state::SharedState,
};

/// Probe path excluded from auth and idle tracking.
const HEALTH_PATH: &str = "/healthz";

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Count in-flight requests for the idle monitor; probes don't count.
async fn track_activity(State(state): State<SharedState>, request: Request, next: Next) -> Response {
    let _guard = if request.uri().path() == HEALTH_PATH {
        None
    } else {
        state.idle.as_ref().map(|idle| idle.request())
    };
    next.run(request).await
}

/// Refuse blocklisted source IPs before any work happens.
async fn block_ingress(
    State(state): State<SharedState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(remote) = &state.remote
        && let Some(info) = request.extensions().get::<ConnectInfo<SocketAddr>>()
        && remote.is_blocked(info.0.ip())
    {
        warn!(ip = %info.0.ip(), "refused blocklisted address");
        return Err(ApiError::Forbidden);
    }
    Ok(next.run(request).await)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let parsed: Vec<http::HeaderValue> = origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

#[must_use]
pub fn build_router(state: SharedState) -> Router {
    let api = Router::new()
        .route("/extract", post(extract::extract))
        .route("/crawl", post(extract::crawl))
        .route("/analyze", post(extract::analyze))
        .route("/jobs", get(jobs::list))
        .route("/jobs/{id}", get(jobs::get))
        .route("/jobs/{id}/results", get(jobs::results))
        .route("/jobs/{id}/stream", get(jobs::stream))
        .route("/jobs/{id}/crawl-map", get(jobs::crawl_map))
        .route("/jobs/{id}/download", get(jobs::download))
        .route("/jobs/{id}/webhooks", get(jobs::deliveries))
        .route("/llm/keys", get(llm::list_keys).put(llm::put_key))
        .route("/llm/keys/{provider}", delete(llm::delete_key))
        .route("/llm/chain", get(llm::get_chain).put(llm::put_chain))
        .route("/llm/providers", get(llm::providers))
        .route("/llm/models/{provider}", get(llm::models))
        .route("/webhooks", get(webhooks::list).post(webhooks::create))
        .route(
            "/webhooks/{id}",
            put(webhooks::update).delete(webhooks::delete),
        )
        .route("/webhooks/{id}/deliveries", get(webhooks::deliveries))
        .route(
            "/admin/service-keys",
            get(admin::list_service_keys).put(admin::put_service_key),
        )
        .route(
            "/admin/service-keys/{provider}",
            delete(admin::delete_service_key),
        )
        .route(
            "/admin/fallback-chain",
            get(admin::get_chain).put(admin::put_chain),
        )
        .route("/admin/tiers", get(admin::tiers))
        .route("/admin/api-keys", post(admin::mint_api_key))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route(HEALTH_PATH, get(healthz))
        .merge(api)
        .layer(middleware::from_fn_with_state(state.clone(), block_ingress))
        .layer(middleware::from_fn_with_state(state.clone(), track_activity))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .layer(cors_layer(&state.config.cors_origins))
        .with_state(state)
}

/// Bind and serve until the cancellation token fires, then drain.
pub async fn serve(state: SharedState, cancel: CancellationToken) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "gateway listening");

    let router = build_router(state);
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { cancel.cancelled().await })
    .await?;
    info!("gateway stopped");
    Ok(())
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use {
        async_trait::async_trait,
        axum::body::{Body, to_bytes},
        http::{Request as HttpRequest, StatusCode},
        tower::ServiceExt,
        url::Url,
    };

    use super::*;
    use crate::state::AppState;
    use {
        quarry_config::{ServiceConfig, TierTable},
        quarry_crawler::{FetchError, FetchMode, FetchedPage, Fetcher},
        quarry_extract::{ConfigResolver, FallbackExecutor},
        quarry_llm::{
            AttemptConfig, ExtractFailure, ExtractRequest, Extraction, Extractor,
            ProviderRegistry,
        },
        quarry_store::{
            AuthStore, ChainStore, InMemoryStore, JobStore, KeyStore,
            types::{ApiPrincipal, ChainScope, NewChainEntry},
        },
        quarry_webhooks::WebhookDispatcher,
    };

    struct StaticFetcher;

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(&self, url: &Url, _mode: FetchMode) -> Result<FetchedPage, FetchError> {
            Ok(FetchedPage {
                final_url: url.clone(),
                status: 200,
                content: "<html><title>X</title></html>".into(),
            })
        }
    }

    struct EchoExtractor;

    #[async_trait]
    impl Extractor for EchoExtractor {
        async fn extract(
            &self,
            _attempt: &AttemptConfig,
            _request: &ExtractRequest,
        ) -> Result<Extraction, ExtractFailure> {
            Ok(Extraction {
                data: serde_json::json!({"title": "X"}),
                input_tokens: 800,
                output_tokens: 200,
                cost_usd: 0.0054,
                llm_cost_usd: 0.0054,
            })
        }
    }

    async fn test_state() -> (SharedState, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(ProviderRegistry::new());
        let resolver = Arc::new(ConfigResolver::new(
            store.clone(),
            store.clone(),
            registry.clone(),
            None,
        ));
        let executor = Arc::new(FallbackExecutor::new(Arc::new(EchoExtractor), store.clone()));
        let dispatcher = Arc::new(WebhookDispatcher::new(
            store.clone(),
            store.clone(),
            reqwest::Client::new(),
            None,
        ));
        let config = ServiceConfig::from_lookup(|_| None).unwrap();
        let fetcher: Arc<dyn Fetcher> = Arc::new(StaticFetcher);

        let state = Arc::new(AppState {
            config,
            jobs: store.clone(),
            chains: store.clone(),
            keys: store.clone(),
            auth: store.clone(),
            webhooks: store.clone(),
            registry,
            resolver,
            executor,
            fetcher,
            dispatcher,
            tiers: Arc::new(TierTable::new()),
            remote: None,
            cipher: None,
            idle: None,
        });

        // A usable platform chain + key and two principals.
        store
            .replace_chain(&ChainScope::Default, vec![NewChainEntry {
                provider: "openrouter".into(),
                model: "claude-3-5-sonnet".into(),
                temperature: None,
                max_tokens: None,
                strict_mode: None,
                enabled: true,
            }])
            .await
            .unwrap();
        store
            .upsert_service_key("openrouter", "sk-or", true)
            .await
            .unwrap();
        store
            .insert_api_key(&quarry_common::hash::sha256_hex("rf_user"), &ApiPrincipal {
                user_id: "u1".into(),
                tier: "standard".into(),
                is_admin: false,
                is_byok: false,
            })
            .await
            .unwrap();
        store
            .insert_api_key(&quarry_common::hash::sha256_hex("rf_admin"), &ApiPrincipal {
                user_id: "admin".into(),
                tier: "pro".into(),
                is_admin: true,
                is_byok: false,
            })
            .await
            .unwrap();

        (state, store)
    }

    async fn call(
        state: &SharedState,
        method: &str,
        path: &str,
        token: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = HttpRequest::builder().method(method).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = build_router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, json)
    }

    #[tokio::test]
    async fn healthz_requires_no_auth() {
        let (state, _) = test_state().await;
        let (status, body) = call(&state, "GET", "/healthz", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn missing_token_is_401() {
        let (state, _) = test_state().await;
        let (status, _) = call(&state, "GET", "/jobs", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call(&state, "GET", "/jobs", Some("rf_wrong"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn crawl_creates_pending_job_with_frozen_chain() {
        let (state, store) = test_state().await;
        let (status, body) = call(
            &state,
            "POST",
            "/crawl",
            Some("rf_user"),
            Some(serde_json::json!({
                "url": "https://example.com",
                "schema": {"title": "string"},
                "crawl_options": {"max_depth": 1},
            })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "pending");
        let job_id = body["job_id"].as_str().unwrap();

        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.user_id, "u1");
        let chain: Vec<AttemptConfig> = serde_json::from_value(job.config_chain).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].provider, "openrouter");
        // The tier page cap landed on the options.
        assert_eq!(job.crawl_options["max_pages"], 100);
    }

    #[tokio::test]
    async fn extract_runs_synchronously() {
        let (state, store) = test_state().await;
        let (status, body) = call(
            &state,
            "POST",
            "/extract",
            Some("rf_user"),
            Some(serde_json::json!({
                "url": "https://example.com/page",
                "schema": {"title": "string"},
            })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
        assert_eq!(body["data"]["title"], "X");
        assert_eq!(body["usage"]["input_tokens"], 800);

        let job_id = body["job_id"].as_str().unwrap();
        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.page_count, 1);
        assert!((job.cost_usd - 0.0054).abs() < 1e-9);
    }

    #[tokio::test]
    async fn job_view_hides_config_chain() {
        let (state, _) = test_state().await;
        let (_, created) = call(
            &state,
            "POST",
            "/crawl",
            Some("rf_user"),
            Some(serde_json::json!({"url": "https://example.com", "schema": {}})),
        )
        .await;
        let job_id = created["job_id"].as_str().unwrap();

        let (status, body) =
            call(&state, "GET", &format!("/jobs/{job_id}"), Some("rf_user"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.get("config_chain").is_none());
        assert!(!body.to_string().contains("sk-or"), "key must never leak");
    }

    #[tokio::test]
    async fn jobs_are_tenant_scoped() {
        let (state, _) = test_state().await;
        let (_, created) = call(
            &state,
            "POST",
            "/crawl",
            Some("rf_user"),
            Some(serde_json::json!({"url": "https://example.com", "schema": {}})),
        )
        .await;
        let job_id = created["job_id"].as_str().unwrap();

        // The admin principal is a different tenant.
        let (status, _) =
            call(&state, "GET", &format!("/jobs/{job_id}"), Some("rf_admin"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn admin_routes_require_admin() {
        let (state, _) = test_state().await;
        let (status, _) = call(&state, "GET", "/admin/tiers", Some("rf_user"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(&state, "GET", "/admin/tiers", Some("rf_admin"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["tiers"]["free"]["job_priority"].is_number());
    }

    #[tokio::test]
    async fn minted_key_authenticates() {
        let (state, _) = test_state().await;
        let (status, body) = call(
            &state,
            "POST",
            "/admin/api-keys",
            Some("rf_admin"),
            Some(serde_json::json!({"user_id": "u9", "tier": "pro"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let key = body["api_key"].as_str().unwrap().to_string();
        assert!(key.starts_with("rf_"));

        let (status, _) = call(&state, "GET", "/jobs", Some(&key), None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn webhook_create_hides_secret() {
        let (state, _) = test_state().await;
        let (status, body) = call(
            &state,
            "POST",
            "/webhooks",
            Some("rf_user"),
            Some(serde_json::json!({
                "name": "prod",
                "url": "https://example.com/hook",
                "events": ["job.completed"],
                "secret": "whsec_abc",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body.to_string().contains("whsec_abc"));

        let (status, _) = call(
            &state,
            "POST",
            "/webhooks",
            Some("rf_user"),
            Some(serde_json::json!({
                "name": "bad",
                "url": "https://example.com/hook",
                "events": ["nope"],
                "secret": "s",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn llm_catalog_and_byok_keys() {
        let (state, _) = test_state().await;
        let (status, body) = call(&state, "GET", "/llm/providers", Some("rf_user"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["providers"].as_array().unwrap().len() >= 4);

        let (status, _) = call(
            &state,
            "PUT",
            "/llm/keys",
            Some("rf_user"),
            Some(serde_json::json!({"provider": "openai", "api_key": "sk-mine"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&state, "GET", "/llm/keys", Some("rf_user"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["keys"].as_array().unwrap().len(), 1);
        assert!(!body.to_string().contains("sk-mine"));

        let (status, _) = call(
            &state,
            "PUT",
            "/llm/keys",
            Some("rf_user"),
            Some(serde_json::json!({"provider": "bogus", "api_key": "sk"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn results_pagination_cursor_is_validated() {
        let (state, _) = test_state().await;
        let (_, created) = call(
            &state,
            "POST",
            "/crawl",
            Some("rf_user"),
            Some(serde_json::json!({"url": "https://example.com", "schema": {}})),
        )
        .await;
        let job_id = created["job_id"].as_str().unwrap();

        let (status, _) = call(
            &state,
            "GET",
            &format!("/jobs/{job_id}/results?after=not-a-ulid"),
            Some("rf_user"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &state,
            "GET",
            &format!("/jobs/{job_id}/results"),
            Some("rf_user"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["results"].as_array().unwrap().len(), 0);
    }
}
