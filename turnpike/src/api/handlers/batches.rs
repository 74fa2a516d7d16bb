//! `/v1/batches`: OpenAI-compatible batch lifecycle endpoints.

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppState;
use crate::api::AppJson;
use crate::auth::AuthContext;
use crate::db::models::batches::Batch;
use crate::errors::{Error, Result};
use crate::types::BatchId;

#[derive(Debug, Deserialize)]
pub struct CreateBatchRequest {
    pub input_file_id: String,
    pub endpoint: String,
    pub completion_window: String,
    /// Gateway extension: per-batch item concurrency cap
    #[serde(default)]
    pub max_concurrency: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct RequestCounts {
    pub total: i32,
    pub completed: i32,
    pub failed: i32,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub id: BatchId,
    pub object: &'static str,
    pub endpoint: String,
    pub input_file_id: String,
    pub completion_window: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_file_id: Option<String>,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_progress_at: Option<i64>,
    pub expires_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalizing_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<i64>,
    pub request_counts: RequestCounts,
}

fn to_batch_response(batch: Batch) -> BatchResponse {
    BatchResponse {
        id: batch.id,
        object: "batch",
        endpoint: batch.endpoint,
        input_file_id: batch.input_file_id.to_string(),
        completion_window: batch.completion_window,
        status: batch.status,
        output_file_id: batch.result_file_id.map(|id| id.to_string()),
        error_file_id: batch.error_file_id.map(|id| id.to_string()),
        created_at: batch.created_at.timestamp(),
        in_progress_at: batch.in_progress_at.map(|at| at.timestamp()),
        expires_at: batch.expires_at.timestamp(),
        finalizing_at: batch.finalizing_at.map(|at| at.timestamp()),
        completed_at: batch.completed_at.map(|at| at.timestamp()),
        failed_at: batch.failed_at.map(|at| at.timestamp()),
        cancelled_at: batch.cancelled_at.map(|at| at.timestamp()),
        request_counts: RequestCounts {
            total: batch.total,
            completed: batch.completed,
            failed: batch.failed,
        },
    }
}

pub async fn create(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    AppJson(req): AppJson<CreateBatchRequest>,
) -> Result<(StatusCode, Json<BatchResponse>)> {
    let input_file_id = Uuid::parse_str(&req.input_file_id).map_err(|_| Error::InvalidRequest {
        message: format!("invalid input_file_id `{}`", req.input_file_id),
    })?;

    let batch = state
        .batches
        .create(&ctx, input_file_id, &req.endpoint, &req.completion_window, req.max_concurrency)
        .await?;
    Ok((StatusCode::CREATED, Json(to_batch_response(batch))))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub after: Option<BatchId>,
}

#[derive(Debug, Serialize)]
pub struct BatchListResponse {
    pub object: &'static str,
    pub data: Vec<BatchResponse>,
    pub has_more: bool,
}

pub async fn list(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<ListQuery>,
) -> Result<Json<BatchListResponse>> {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let mut batches = state.batches.list(&ctx, limit + 1, query.after).await?;
    let has_more = batches.len() as i64 > limit;
    batches.truncate(limit as usize);

    Ok(Json(BatchListResponse {
        object: "list",
        data: batches.into_iter().map(to_batch_response).collect(),
        has_more,
    }))
}

pub async fn retrieve(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<BatchId>,
) -> Result<Json<BatchResponse>> {
    let batch = state.batches.get(&ctx, id).await?;
    Ok(Json(to_batch_response(batch)))
}

pub async fn cancel(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(id): Path<BatchId>,
) -> Result<Json<BatchResponse>> {
    let batch = state.batches.cancel(&ctx, id).await?;
    Ok(Json(to_batch_response(batch)))
}
