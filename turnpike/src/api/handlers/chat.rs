//! `POST /v1/chat/completions`: sync JSON or SSE streaming.

use axum::{
    Extension,
    extract::State,
    http::{HeaderMap, header::CONTENT_TYPE},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use bytes::Bytes;
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use super::idempotency_key;
use crate::AppState;
use crate::api::AppJson;
use crate::api::budget_headers;
use crate::auth::AuthContext;
use crate::dispatch::Reply;
use crate::errors::Result;
use crate::openai::ChatRequest;

pub async fn completions(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    headers: HeaderMap,
    AppJson(req): AppJson<ChatRequest>,
) -> Result<Response> {
    if req.is_stream() {
        return stream(state, ctx, req).await;
    }

    let idempotency = idempotency_key(&headers);
    let outcome = state.dispatcher.chat(&ctx, &req, idempotency.as_deref()).await?;

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

async fn stream(state: AppState, ctx: AuthContext, req: ChatRequest) -> Result<Response> {
    let reply = state.dispatcher.chat_stream(&ctx, &req).await?;
    let snapshot = reply.snapshot;

    let events = ReceiverStream::new(reply.frames).map(|frame| Ok::<Event, std::convert::Infallible>(Event::default().data(frame)));

    let mut response = Sse::new(events).keep_alive(KeepAlive::default()).into_response();
    for (name, value) in budget_headers(&snapshot) {
        if let Ok(value) = value.parse() {
            response.headers_mut().insert(name, value);
        }
    }
    Ok(response)
}
