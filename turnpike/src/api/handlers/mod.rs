//! Request handlers for the OpenAI-compatible surface.

pub mod audio;
pub mod batches;
pub mod chat;
pub mod embeddings;
pub mod files;
pub mod health;
pub mod images;
pub mod models;

use axum::http::HeaderMap;

use crate::idempotency::IDEMPOTENCY_HEADER;

/// Client-supplied idempotency key, if any.
pub(crate) fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .filter(|key| !key.is_empty())
}
