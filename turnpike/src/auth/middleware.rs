//! Bearer authentication middleware for `/v1/*`.
//!
//! Every failure mode (missing header, malformed token, unknown prefix,
//! wrong secret, revoked key, suspended tenant) collapses into one uniform
//! `unauthorized` response so callers cannot probe which part failed.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::{AuthContext, keys};
use crate::AppState;
use crate::crypto::split_api_key;
use crate::db::errors::DbError;
use crate::db::handlers::{ApiKeys, Tenants};
use crate::errors::{Error, Result};
use crate::ratelimit::LimitConfig;

fn unauthorized() -> Error {
    Error::Unauthorized {
        message: "Invalid or missing API key".to_string(),
    }
}

/// Authenticate the request and attach an [`AuthContext`] extension.
pub async fn bearer_auth(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    match authenticate(&state, request.headers()).await {
        Ok(ctx) => {
            request.extensions_mut().insert(ctx);
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}

async fn authenticate(state: &AppState, headers: &axum::http::HeaderMap) -> Result<AuthContext> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(unauthorized)?;

    let (prefix, secret) = split_api_key(token).ok_or_else(unauthorized)?;

    let api_key = match ApiKeys::find_by_prefix(&state.db, prefix).await {
        Ok(api_key) => api_key,
        Err(DbError::NotFound) => return Err(unauthorized()),
        Err(e) => return Err(e.into()),
    };

    if !keys::verify_secret(secret, &api_key.secret_hash)? {
        return Err(unauthorized());
    }
    if api_key.is_revoked() {
        return Err(unauthorized());
    }

    let tenant = match Tenants::get(&state.db, api_key.tenant_id).await {
        Ok(tenant) => tenant,
        Err(DbError::NotFound) => return Err(unauthorized()),
        Err(e) => return Err(e.into()),
    };
    if !tenant.is_active() {
        return Err(unauthorized());
    }

    let limits = LimitConfig::effective(
        &state.default_limits,
        api_key.rpm_limit,
        api_key.tpm_limit,
        api_key.max_parallel,
    );

    Ok(AuthContext {
        tenant,
        api_key,
        limits,
    })
}
