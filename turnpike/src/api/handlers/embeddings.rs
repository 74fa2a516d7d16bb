//! `POST /v1/embeddings`.

use axum::{
    Extension,
    extract::State,
    http::{HeaderMap, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use bytes::Bytes;

use super::idempotency_key;
use crate::AppState;
use crate::api::AppJson;
use crate::api::budget_headers;
use crate::auth::AuthContext;
use crate::dispatch::Reply;
use crate::errors::Result;
use crate::openai::EmbeddingsRequest;

pub async fn create(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    headers: HeaderMap,
    AppJson(req): AppJson<EmbeddingsRequest>,
) -> Result<Response> {
    let idempotency = idempotency_key(&headers);
    let outcome = state.dispatcher.embeddings(&ctx, &req, idempotency.as_deref()).await?;

    let body = match &outcome.reply {
        Reply::Fresh(response) => {
            let body = Bytes::from(serde_json::to_vec(response).map_err(anyhow::Error::from)?);
            state.dispatcher.cache_response(&ctx, idempotency.as_deref(), &body).await;
            body
        }
        Reply::Cached(bytes) => bytes.clone(),
    };

    let mut response = ([(CONTENT_TYPE, "application/json")], body).into_response();
    for (name, value) in budget_headers(&outcome.snapshot) {
        if let Ok(value) = value.parse() {
            response.headers_mut().insert(name, value);
        }
    }
    Ok(response)
}
