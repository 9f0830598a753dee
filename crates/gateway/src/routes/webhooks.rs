//! Webhook CRUD. Secrets are encrypted before they reach the store and
//! never serialized back out.

use {
    axum::{
        Extension, Json,
        extract::{Path, State},
    },
    serde::Deserialize,
    serde_json::json,
};

use quarry_store::{
    WebhookStore as _,
    types::{NewWebhook, WebhookPatch},
};

use crate::{
    auth::Principal,
    error::{ApiError, ApiResult},
    state::SharedState,
};

/// Events a webhook may subscribe to.
pub const SUPPORTED_EVENTS: &[&str] = &["job.completed", "job.failed", "page.completed"];

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    pub name: String,
    pub url: String,
    pub events: Vec<String>,
    pub secret: String,
    #[serde(default)]
    pub headers: serde_json::Value,
    #[serde(default = "default_active")]
    pub active: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct UpdateBody {
    pub name: Option<String>,
    pub url: Option<String>,
    pub events: Option<Vec<String>>,
    pub secret: Option<String>,
    pub headers: Option<serde_json::Value>,
    pub active: Option<bool>,
}

fn default_active() -> bool {
    true
}

fn validate_events(events: &[String]) -> ApiResult<()> {
    for event in events {
        if !SUPPORTED_EVENTS.contains(&event.as_str()) {
            return Err(ApiError::bad_request(format!("unsupported event: {event}")));
        }
    }
    Ok(())
}

fn seal_secret(state: &SharedState, secret: &str) -> ApiResult<Vec<u8>> {
    match &state.cipher {
        Some(cipher) => cipher
            .encrypt(secret.as_bytes())
            .map_err(|e| ApiError::Internal(e.into())),
        // Without a process key, secrets are stored as provided.
        None => Ok(secret.as_bytes().to_vec()),
    }
}

/// `POST /webhooks`
pub async fn create(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<CreateBody>,
) -> ApiResult<Json<serde_json::Value>> {
    validate_events(&body.events)?;
    if body.events.is_empty() {
        return Err(ApiError::bad_request("events must not be empty"));
    }
    url::Url::parse(&body.url).map_err(|e| ApiError::bad_request(format!("invalid url: {e}")))?;

    let hook = state
        .webhooks
        .create_webhook(NewWebhook {
            user_id: principal.user_id().to_string(),
            name: body.name,
            url: body.url,
            events: body.events,
            secret_ciphertext: seal_secret(&state, &body.secret)?,
            headers: body.headers,
            active: body.active,
        })
        .await?;
    Ok(Json(json!({"webhook": hook})))
}

/// `GET /webhooks`
pub async fn list(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
) -> ApiResult<Json<serde_json::Value>> {
    let hooks = state.webhooks.list_webhooks(principal.user_id()).await?;
    Ok(Json(json!({"webhooks": hooks})))
}

/// `PUT /webhooks/{id}`
pub async fn update(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
    Json(body): Json<UpdateBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if let Some(events) = &body.events {
        validate_events(events)?;
    }
    let secret_ciphertext = body
        .secret
        .as_deref()
        .map(|s| seal_secret(&state, s))
        .transpose()?;

    let hook = state
        .webhooks
        .update_webhook(principal.user_id(), &id, WebhookPatch {
            name: body.name,
            url: body.url,
            events: body.events,
            secret_ciphertext,
            headers: body.headers,
            active: body.active,
        })
        .await?;
    Ok(Json(json!({"webhook": hook})))
}

/// `DELETE /webhooks/{id}`
pub async fn delete(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.webhooks.delete_webhook(principal.user_id(), &id).await?;
    Ok(Json(json!({"deleted": id})))
}

/// `GET /webhooks/{id}/deliveries`
pub async fn deliveries(
    State(state): State<SharedState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    // Ownership check before exposing delivery history.
    state
        .webhooks
        .get_webhook(principal.user_id(), &id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("webhook {id}")))?;
    let rows = state.webhooks.deliveries_for_webhook(&id, 100).await?;
    Ok(Json(json!({"deliveries": rows})))
}
