//! HTTP surface: the OpenAI-compatible `/v1` router plus `/healthz`.

pub mod handlers;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, FromRequest, Request, rejection::JsonRejection},
    http::{HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::AppState;
use crate::auth::middleware::bearer_auth;
use crate::budget::BudgetSnapshot;
use crate::errors::Error;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// JSON extractor whose rejection is the OpenAI error envelope instead of
/// axum's plain-text default.
pub struct AppJson<T>(pub T);

impl<S, T> FromRequest<S> for AppJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(AppJson(value)),
            Err(rejection) => Err(Error::InvalidRequest {
                message: rejection.body_text(),
            }),
        }
    }
}

/// Unknown routes also answer with the envelope.
async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": {
                "type": "invalid_request_error",
                "code": "unknown_url",
                "message": "Unknown request URL",
            }
        })),
    )
        .into_response()
}

/// Attach a generated request id to the request extensions and echo it on
/// the response.
async fn request_id(mut request: Request, next: Next) -> Response {
    let id = uuid::Uuid::new_v4().to_string();
    request.extensions_mut().insert(RequestId(id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// `X-Budget-*` response headers for billed requests. Tenants without a
/// configured budget get none.
pub fn budget_headers(snapshot: &BudgetSnapshot) -> Vec<(HeaderName, String)> {
    if snapshot.is_unlimited() {
        return Vec::new();
    }
    fn dollars(cents: i64) -> String {
        format!("{:.2}", cents as f64 / 100.0)
    }
    vec![
        (HeaderName::from_static("x-budget-limit"), dollars(snapshot.limit_cents)),
        (HeaderName::from_static("x-budget-used"), dollars(snapshot.used_cents)),
        (
            HeaderName::from_static("x-budget-remaining"),
            dollars(snapshot.remaining_cents()),
        ),
        (
            HeaderName::from_static("x-budget-warning-threshold"),
            format!("{}", snapshot.warning_threshold),
        ),
        (
            HeaderName::from_static("x-budget-exceeded"),
            snapshot.exceeded.to_string(),
        ),
    ]
}

/// Assemble the application router.
pub fn router(state: AppState) -> Router {
    let ai = Router::new()
        .route("/models", get(handlers::models::list))
        .route("/models/{alias}", get(handlers::models::retrieve))
        .route("/chat/completions", post(handlers::chat::completions))
        .route("/embeddings", post(handlers::embeddings::create))
        .route("/images/generations", post(handlers::images::generations))
        .route("/images/edits", post(handlers::images::edits))
        .route("/images/variations", post(handlers::images::variations))
        .route("/audio/transcriptions", post(handlers::audio::transcriptions))
        .route("/audio/translations", post(handlers::audio::translations))
        .route("/audio/speech", post(handlers::audio::speech))
        .route("/files", post(handlers::files::upload).get(handlers::files::list))
        .route(
            "/files/{id}",
            get(handlers::files::retrieve).delete(handlers::files::delete),
        )
        .route("/files/{id}/content", get(handlers::files::content))
        .route("/batches", post(handlers::batches::create).get(handlers::batches::list))
        .route("/batches/{id}", get(handlers::batches::retrieve))
        .route("/batches/{id}/cancel", post(handlers::batches::cancel))
        .layer(middleware::from_fn_with_state::<_, _, (axum::extract::State<AppState>, Request)>(
            state.clone(),
            bearer_auth,
        ))
        .layer(DefaultBodyLimit::max(state.config.file_storage.max_upload_bytes));

    Router::new()
        .nest("/v1", ai)
        .route("/healthz", get(handlers::health::healthz))
        .fallback(not_found)
        .layer(middleware::from_fn(request_id))
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_budget_headers_format_dollars() {
        let snapshot = BudgetSnapshot {
            limit_cents: 1000,
            used_cents: 1,
            warning_threshold: 0.8,
            exceeded: false,
            window_start: Utc::now(),
        };
        let headers = budget_headers(&snapshot);
        let find = |name: &str| {
            headers
                .iter()
                .find(|(header, _)| header.as_str() == name)
                .map(|(_, value)| value.clone())
                .unwrap()
        };
        assert_eq!(find("x-budget-limit"), "10.00");
        assert_eq!(find("x-budget-used"), "0.01");
        assert_eq!(find("x-budget-remaining"), "9.99");
        assert_eq!(find("x-budget-exceeded"), "false");
    }

    #[test]
    fn test_unlimited_budget_has_no_headers() {
        assert!(budget_headers(&BudgetSnapshot::unlimited()).is_empty());
    }
}
