//! `GET /healthz`: liveness plus Postgres and Redis round-trip latency.

use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;
use std::time::Instant;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct DependencyHealth {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub postgres: DependencyHealth,
    pub redis: DependencyHealth,
}

pub async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let postgres = {
        let start = Instant::now();
        match sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&state.db).await {
            Ok(_) => DependencyHealth {
                ok: true,
                latency_ms: Some(start.elapsed().as_millis() as u64),
                error: None,
            },
            Err(e) => DependencyHealth {
                ok: false,
                latency_ms: None,
                error: Some(e.to_string()),
            },
        }
    };

    let redis = match state.limiter.ping().await {
        Ok(latency) => DependencyHealth {
            ok: true,
            latency_ms: Some(latency.as_millis() as u64),
            error: None,
        },
        Err(e) => DependencyHealth {
            ok: false,
            latency_ms: None,
            error: Some(e.user_message()),
        },
    };

    let healthy = postgres.ok && redis.ok;
    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" },
        postgres,
        redis,
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}
