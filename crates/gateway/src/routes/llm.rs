//! Tenant-facing LLM configuration: BYOK keys, chain, provider catalog.

use {
    axum::{
        Extension, Json,
        extract::{Path, State},
    },
    serde::Deserialize,
    serde_json::json,
};

use quarry_store::{
    ChainStore as _, KeyStore as _,
    types::{ChainScope, NewChainEntry},
};

use crate::{
    auth::Principal,
    error::{ApiError, ApiResult},
    state::SharedState,
};

#[derive(Debug, Deserialize)]
pub struct PutKeyBody {
    pub provider: String,
    pub api_key: String,
}

#[derive(Debug, Deserialize)]
pub struct PutChainBody {
    pub entries: Vec<NewChainEntry>,
}

/// `GET /llm/keys`. Key material is never echoed back.
pub async fn list_keys(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Json<serde_json::Value>> {
    let keys = state.keys.list_user_keys(principal.user_id()).await?;
    Ok(Json(json!({"keys": keys})))
}

/// `PUT /llm/keys`
pub async fn put_key(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<PutKeyBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if state.registry.provider(&body.provider).is_none() {
        return Err(ApiError::bad_request(format!(
            "unknown provider: {}",
            body.provider
        )));
    }
    if body.api_key.trim().is_empty() {
        return Err(ApiError::bad_request("api_key must not be empty"));
    }
    let key = state
        .keys
        .upsert_user_key(principal.user_id(), &body.provider, body.api_key.trim())
        .await?;
    Ok(Json(json!({"provider": key.provider, "enabled": key.enabled})))
}

/// `DELETE /llm/keys/{provider}`
pub async fn delete_key(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path(provider): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.keys.delete_user_key(principal.user_id(), &provider).await?;
    Ok(Json(json!({"deleted": provider})))
}

/// `GET /llm/chain`
pub async fn get_chain(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Json<serde_json::Value>> {
    let scope = ChainScope::User(principal.user_id().to_string());
    let entries = state.chains.list_chain(&scope).await?;
    Ok(Json(json!({"entries": entries})))
}

/// `PUT /llm/chain`: replace the tenant's chain wholesale.
pub async fn put_chain(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<PutChainBody>,
) -> ApiResult<Json<serde_json::Value>> {
    for entry in &body.entries {
        if state.registry.provider(&entry.provider).is_none() {
            return Err(ApiError::bad_request(format!(
                "unknown provider: {}",
                entry.provider
            )));
        }
    }
    let scope = ChainScope::User(principal.user_id().to_string());
    let entries = state.chains.replace_chain(&scope, body.entries).await?;
    Ok(Json(json!({"entries": entries})))
}

/// `GET /llm/providers`
pub async fn providers(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(json!({"providers": state.registry.providers()}))
}

/// `GET /llm/models/{provider}`
pub async fn models(
    State(state): State<SharedState>,
    Path(provider): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    if state.registry.provider(&provider).is_none() {
        return Err(ApiError::not_found(format!("provider {provider}")));
    }
    Ok(Json(json!({"models": state.registry.models(&provider)})))
}
