//! Bearer authentication.
//!
//! Two credential shapes: platform API keys (`rf_…`, looked up by SHA-256
//! hash) and externally-issued JWTs verified by a pluggable verifier. The
//! resolved principal rides request extensions.

use {
    axum::{
        extract::{Request, State},
        middleware::Next,
        response::Response,
    },
    tracing::debug,
};

use {
    quarry_common::hash::sha256_hex,
    quarry_store::{AuthStore as _, types::ApiPrincipal},
};

use crate::{error::ApiError, state::SharedState};

/// Prefix of platform-issued API keys.
pub const API_KEY_PREFIX: &str = "rf_";

/// Authenticated identity, cloned into request extensions.
#[derive(Debug, Clone)]
pub struct Principal(pub ApiPrincipal);

impl Principal {
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.0.user_id
    }

    pub fn require_admin(&self) -> Result<(), ApiError> {
        if self.0.is_admin {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }
}

/// Generate a fresh platform API key. Only the SHA-256 hash is persisted.
#[must_use]
pub fn generate_api_key() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 24];
    rand::rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(API_KEY_PREFIX.len() + bytes.len() * 2);
    out.push_str(API_KEY_PREFIX);
    for byte in bytes {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Bearer-token middleware: resolves the principal or rejects with 401.
pub async fn require_auth(
    State(state): State<SharedState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    let principal = if token.starts_with(API_KEY_PREFIX) {
        state
            .auth
            .principal_for_key_hash(&sha256_hex(token))
            .await?
            .ok_or(ApiError::Unauthorized)?
    } else if state.config.clerk_issuer_url.is_some() {
        // External-IdP JWTs are verified out of process; the gateway only
        // consumes the already-verified subject claims forwarded by the
        // ingress. Absent that deployment, JWT bearers are rejected.
        verify_forwarded_jwt(&request).ok_or(ApiError::Unauthorized)?
    } else {
        return Err(ApiError::Unauthorized);
    };

    debug!(user_id = %principal.user_id, tier = %principal.tier, "authenticated");
    request.extensions_mut().insert(Principal(principal));
    Ok(next.run(request).await)
}

/// Trusted-ingress JWT path: the verifying proxy forwards subject claims
/// in `X-Verified-*` headers.
fn verify_forwarded_jwt(request: &Request) -> Option<ApiPrincipal> {
    let header = |name: &str| {
        request
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let user_id = header("x-verified-user")?;
    Some(ApiPrincipal {
        user_id,
        tier: header("x-verified-tier").unwrap_or_else(|| "free".into()),
        is_admin: header("x-verified-admin").as_deref() == Some("true"),
        is_byok: header("x-verified-byok").as_deref() == Some("true"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_have_prefix_and_entropy() {
        let a = generate_api_key();
        let b = generate_api_key();
        assert!(a.starts_with("rf_"));
        assert_eq!(a.len(), 3 + 48);
        assert_ne!(a, b);
    }

    #[test]
    fn admin_gate() {
        let admin = Principal(ApiPrincipal {
            user_id: "u".into(),
            tier: "pro".into(),
            is_admin: true,
            is_byok: false,
        });
        assert!(admin.require_admin().is_ok());

        let plain = Principal(ApiPrincipal {
            user_id: "u".into(),
            tier: "pro".into(),
            is_admin: false,
            is_byok: false,
        });
        assert!(plain.require_admin().is_err());
    }
}
