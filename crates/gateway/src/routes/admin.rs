//! Admin routes: platform keys, admin fallback chains, tier table,
//! API-key minting.

use {
    axum::{
        Extension, Json,
        extract::{Path, Query, State},
    },
    serde::Deserialize,
    serde_json::json,
};

use {
    quarry_common::hash::sha256_hex,
    quarry_store::{
        AuthStore as _, ChainStore as _, KeyStore as _,
        types::{ApiPrincipal, ChainScope, NewChainEntry},
    },
};

use crate::{
    auth::{Principal, generate_api_key},
    error::{ApiError, ApiResult},
    state::SharedState,
};

#[derive(Debug, Deserialize)]
pub struct PutServiceKeyBody {
    pub provider: String,
    pub api_key: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct ChainQuery {
    /// Absent = the default chain.
    pub tier: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PutChainBody {
    pub entries: Vec<NewChainEntry>,
}

#[derive(Debug, Deserialize)]
pub struct MintKeyBody {
    pub user_id: String,
    #[serde(default = "default_tier")]
    pub tier: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub is_byok: bool,
}

fn default_tier() -> String {
    "free".into()
}

fn admin_scope(query: &ChainQuery) -> ChainScope {
    match &query.tier {
        Some(tier) => ChainScope::Tier(tier.clone()),
        None => ChainScope::Default,
    }
}

/// `GET /admin/service-keys`
pub async fn list_service_keys(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Json<serde_json::Value>> {
    principal.require_admin()?;
    let keys = state.keys.list_service_keys().await?;
    Ok(Json(json!({"keys": keys})))
}

/// `PUT /admin/service-keys`
pub async fn put_service_key(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<PutServiceKeyBody>,
) -> ApiResult<Json<serde_json::Value>> {
    principal.require_admin()?;
    if state.registry.provider(&body.provider).is_none() {
        return Err(ApiError::bad_request(format!(
            "unknown provider: {}",
            body.provider
        )));
    }
    let key = state
        .keys
        .upsert_service_key(&body.provider, body.api_key.trim(), body.enabled)
        .await?;
    Ok(Json(json!({"provider": key.provider, "enabled": key.enabled})))
}

/// `DELETE /admin/service-keys/{provider}`
pub async fn delete_service_key(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path(provider): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    principal.require_admin()?;
    state.keys.delete_service_key(&provider).await?;
    Ok(Json(json!({"deleted": provider})))
}

/// `GET /admin/fallback-chain?tier=`
pub async fn get_chain(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<ChainQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    principal.require_admin()?;
    let entries = state.chains.list_chain(&admin_scope(&query)).await?;
    Ok(Json(json!({"tier": query.tier, "entries": entries})))
}

/// `PUT /admin/fallback-chain?tier=`
pub async fn put_chain(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Query(query): Query<ChainQuery>,
    Json(body): Json<PutChainBody>,
) -> ApiResult<Json<serde_json::Value>> {
    principal.require_admin()?;
    for entry in &body.entries {
        if state.registry.provider(&entry.provider).is_none() {
            return Err(ApiError::bad_request(format!(
                "unknown provider: {}",
                entry.provider
            )));
        }
    }
    let entries = state
        .chains
        .replace_chain(&admin_scope(&query), body.entries)
        .await?;
    Ok(Json(json!({"tier": query.tier, "entries": entries})))
}

/// `GET /admin/tiers`: the effective tier table (defaults + overlay).
pub async fn tiers(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Json<serde_json::Value>> {
    principal.require_admin()?;
    let snapshot = state.tiers.snapshot();
    Ok(Json(json!({"tiers": &*snapshot})))
}

/// `POST /admin/api-keys`: mint a platform key; the cleartext is shown
/// exactly once.
pub async fn mint_api_key(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<MintKeyBody>,
) -> ApiResult<Json<serde_json::Value>> {
    principal.require_admin()?;
    let api_key = generate_api_key();
    state
        .auth
        .insert_api_key(&sha256_hex(&api_key), &ApiPrincipal {
            user_id: body.user_id,
            tier: body.tier,
            is_admin: body.is_admin,
            is_byok: body.is_byok,
        })
        .await?;
    Ok(Json(json!({"api_key": api_key})))
}
