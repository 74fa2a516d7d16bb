//! Batch service: NDJSON ingestion, lifecycle transitions, and output file
//! materialization.
//!
//! A batch references an uploaded file with purpose `batch`, one JSON
//! object per line. Ingestion validates each line's shape against the
//! declared endpoint and persists the batch with all its items in a single
//! transaction. The worker (see [`worker`]) claims and executes items; once
//! every item is terminal, [`BatchService::finalize`] writes the result and
//! error NDJSON files, which inherit the batch's remaining lifetime.

pub mod worker;

use bytes::Bytes;
use chrono::Utc;
use sqlx::PgPool;

use crate::db::handlers::{Batches, Files};
use crate::db::models::batches::{
    Batch, BatchItem, BatchItemDraft, BatchStatus, SUPPORTED_BATCH_ENDPOINTS,
};
use crate::db::models::files::FileStatus;
use crate::errors::{Error, Result};
use crate::files::FileService;
use crate::types::{BatchId, FileId};

use crate::auth::AuthContext;
use crate::config::BatchesConfig;

/// Parse batch input NDJSON into item drafts.
///
/// Validates per line: parseable JSON object, `method == "POST"`, `url`
/// equal to the declared endpoint, and a non-empty `body` object. Enforces
/// the per-line byte cap and the total request cap.
pub fn parse_ndjson(
    data: &[u8],
    endpoint: &str,
    max_requests: usize,
    max_line_bytes: usize,
) -> Result<Vec<BatchItemDraft>> {
    let mut drafts = Vec::new();

    for (line_number, line) in data.split(|b| *b == b'\n').enumerate() {
        let line_number = line_number + 1;
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        if line.len() > max_line_bytes {
            return Err(Error::InvalidRequest {
                message: format!("line {line_number} exceeds the {max_line_bytes} byte limit"),
            });
        }
        if drafts.len() >= max_requests {
            return Err(Error::InvalidRequest {
                message: format!("batch exceeds the maximum of {max_requests} requests"),
            });
        }

        let value: serde_json::Value = serde_json::from_slice(line).map_err(|e| Error::InvalidRequest {
            message: format!("line {line_number} is not valid JSON: {e}"),
        })?;

        let method = value.get("method").and_then(|v| v.as_str()).unwrap_or("");
        if !method.eq_ignore_ascii_case("POST") {
            return Err(Error::InvalidRequest {
                message: format!("line {line_number}: method must be POST"),
            });
        }
        let url = value.get("url").and_then(|v| v.as_str()).unwrap_or("");
        if url != endpoint {
            return Err(Error::InvalidRequest {
                message: format!("line {line_number}: url `{url}` does not match batch endpoint `{endpoint}`"),
            });
        }
        let body = value.get("body").cloned().unwrap_or(serde_json::Value::Null);
        let body_is_empty = match &body {
            serde_json::Value::Object(map) => map.is_empty(),
            _ => true,
        };
        if body_is_empty {
            return Err(Error::InvalidRequest {
                message: format!("line {line_number}: body must be a non-empty object"),
            });
        }

        drafts.push(BatchItemDraft {
            item_index: drafts.len() as i32,
            custom_id: value.get("custom_id").and_then(|v| v.as_str()).map(String::from),
            body,
        });
    }

    if drafts.is_empty() {
        return Err(Error::InvalidRequest {
            message: "batch input file contains no requests".to_string(),
        });
    }
    Ok(drafts)
}

/// Normalized per-item failure envelope for the error output file.
///
/// `code` maps from the HTTP status: 400 → invalid_request_error, 403 →
/// permission_error, 429 → rate_limit_error, 503 → service_unavailable,
/// anything else → provider_error.
pub fn encode_item_error(err: &Error) -> serde_json::Value {
    let status = err.status_code().as_u16();
    let code = match status {
        400 => "invalid_request_error",
        403 => "permission_error",
        429 => "rate_limit_error",
        503 => "service_unavailable",
        _ => "provider_error",
    };
    serde_json::json!({
        "error": {
            "type": "batch_error",
            "code": code,
            "message": err.user_message(),
            "status": status,
        }
    })
}

#[derive(Clone)]
pub struct BatchService {
    pool: PgPool,
    files: FileService,
    config: BatchesConfig,
}

impl BatchService {
    pub fn new(pool: PgPool, files: FileService, config: BatchesConfig) -> Self {
        Self { pool, files, config }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Ingest a batch: validate the input file, parse every line, persist
    /// batch + items atomically in `queued` state.
    pub async fn create(
        &self,
        ctx: &AuthContext,
        input_file_id: FileId,
        endpoint: &str,
        completion_window: &str,
        max_concurrency: Option<i32>,
    ) -> Result<Batch> {
        if !SUPPORTED_BATCH_ENDPOINTS.contains(&endpoint) {
            return Err(Error::InvalidRequest {
                message: format!(
                    "unsupported endpoint `{endpoint}`; supported: {}",
                    SUPPORTED_BATCH_ENDPOINTS.join(", ")
                ),
            });
        }
        if completion_window != "24h" {
            return Err(Error::InvalidRequest {
                message: "only a '24h' completion_window is supported".to_string(),
            });
        }

        let (file, data) = self.files.content(ctx.tenant.id, input_file_id).await?;
        if file.purpose != "batch" {
            return Err(Error::InvalidRequest {
                message: format!("file {input_file_id} has purpose `{}`, expected `batch`", file.purpose),
            });
        }

        let items = parse_ndjson(&data, endpoint, self.config.max_requests, self.config.max_line_bytes)?;
        let max_concurrency = max_concurrency
            .filter(|c| *c > 0)
            .unwrap_or(self.config.default_item_concurrency);
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.config.ttl).unwrap_or_else(|_| chrono::Duration::hours(24));

        let batch = Batches::create_with_items(
            &self.pool,
            ctx.tenant.id,
            Some(ctx.api_key.id),
            endpoint,
            input_file_id,
            max_concurrency,
            completion_window,
            expires_at,
            &items,
        )
        .await?;

        tracing::info!(batch = %batch.id, tenant = %ctx.tenant.id, total = batch.total, "batch created");
        Ok(batch)
    }

    pub async fn get(&self, ctx: &AuthContext, id: BatchId) -> Result<Batch> {
        Ok(Batches::get_for_tenant(&self.pool, ctx.tenant.id, id).await?)
    }

    pub async fn list(&self, ctx: &AuthContext, limit: i64, after: Option<BatchId>) -> Result<Vec<Batch>> {
        Ok(Batches::list_for_tenant(&self.pool, ctx.tenant.id, limit, after).await?)
    }

    /// Cancel a non-terminal batch. Queued items are cancelled immediately;
    /// running executors observe the cancellation on their next claim.
    pub async fn cancel(&self, ctx: &AuthContext, id: BatchId) -> Result<Batch> {
        // Ownership check before mutating anything
        let existing = Batches::get_for_tenant(&self.pool, ctx.tenant.id, id).await?;
        let cancellable = [BatchStatus::Queued, BatchStatus::InProgress, BatchStatus::Finalizing];

        let Some(batch) = Batches::transition(&self.pool, existing.id, &cancellable, BatchStatus::Cancelled).await?
        else {
            return Err(Error::InvalidRequest {
                message: format!("batch {id} is already in a terminal state ({})", existing.status),
            });
        };

        Batches::cancel_remaining_items(&self.pool, batch.id).await?;
        tracing::info!(batch = %batch.id, "batch cancelled");
        Batches::get_for_tenant(&self.pool, ctx.tenant.id, id).await.map_err(Into::into)
    }

    /// Materialize output files and move the batch to its terminal state.
    /// Call only when every item is terminal; returns the final row.
    pub async fn finalize(&self, batch: &Batch) -> Result<Batch> {
        let Some(batch) = Batches::transition(&self.pool, batch.id, &[BatchStatus::InProgress], BatchStatus::Finalizing).await?
        else {
            // Another actor (cancel, concurrent worker) took it; leave as-is
            return Ok(Batches::get(&self.pool, batch.id).await?);
        };

        let items = Batches::finished_items(&self.pool, batch.id).await?;
        let result_ndjson = render_result_lines(&items);
        let error_ndjson = render_error_lines(&items);

        let result_file = self
            .files
            .upload(
                batch.tenant_id,
                &format!("batch_{}_output.jsonl", batch.id),
                crate::db::models::files::BATCH_OUTPUT_PURPOSE,
                "application/jsonl",
                Bytes::from(result_ndjson),
                Some(batch.expires_at),
            )
            .await?;

        let error_file = if let Some(error_ndjson) = error_ndjson {
            Some(
                self.files
                    .upload(
                        batch.tenant_id,
                        &format!("batch_{}_errors.jsonl", batch.id),
                        crate::db::models::files::BATCH_OUTPUT_PURPOSE,
                        "application/jsonl",
                        Bytes::from(error_ndjson),
                        Some(batch.expires_at),
                    )
                    .await?,
            )
        } else {
            None
        };

        Batches::set_output_files(&self.pool, batch.id, Some(result_file.id), error_file.map(|f| f.id)).await?;

        // The input file has served its purpose
        if let Err(e) = Files::set_status(&self.pool, batch.input_file_id, FileStatus::Processed).await {
            tracing::warn!(batch = %batch.id, "failed to mark input file processed: {e:#}");
        }

        let terminal = if batch.total > 0 && batch.failed == batch.total {
            BatchStatus::Failed
        } else {
            BatchStatus::Completed
        };
        let finished = Batches::transition(&self.pool, batch.id, &[BatchStatus::Finalizing], terminal).await?;

        let row = match finished {
            Some(row) => row,
            None => Batches::get(&self.pool, batch.id).await?,
        };
        tracing::info!(batch = %row.id, status = %row.status, "batch finalized");
        Ok(row)
    }
}

/// Result lines in submission order: one `{id, custom_id, response}` per
/// completed item.
fn render_result_lines(items: &[BatchItem]) -> Vec<u8> {
    let mut out = Vec::new();
    for item in items {
        if item.status != "completed" {
            continue;
        }
        let line = serde_json::json!({
            "id": item.id,
            "custom_id": item.custom_id,
            "response": item.response,
        });
        out.extend_from_slice(line.to_string().as_bytes());
        out.push(b'\n');
    }
    out
}

/// Error lines for failed items; `None` when every item succeeded.
fn render_error_lines(items: &[BatchItem]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    for item in items {
        if item.status != "failed" {
            continue;
        }
        let line = serde_json::json!({
            "id": item.id,
            "custom_id": item.custom_id,
            "error": item.error,
        });
        out.extend_from_slice(line.to_string().as_bytes());
        out.push(b'\n');
    }
    if out.is_empty() { None } else { Some(out) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(custom_id: &str, url: &str) -> String {
        serde_json::json!({
            "custom_id": custom_id,
            "method": "POST",
            "url": url,
            "body": {"model": "gpt-test", "messages": [{"role": "user", "content": "hi"}]},
        })
        .to_string()
    }

    #[test]
    fn test_parse_valid_ndjson_preserves_order() {
        let data = format!(
            "{}\n{}\n\n{}\n",
            line("a", "/v1/chat/completions"),
            line("b", "/v1/chat/completions"),
            line("c", "/v1/chat/completions"),
        );
        let drafts = parse_ndjson(data.as_bytes(), "/v1/chat/completions", 100, 1024 * 1024).unwrap();
        assert_eq!(drafts.len(), 3);
        assert_eq!(drafts[0].item_index, 0);
        assert_eq!(drafts[2].item_index, 2);
        assert_eq!(drafts[1].custom_id.as_deref(), Some("b"));
    }

    #[test]
    fn test_parse_rejects_wrong_url() {
        let data = line("a", "/v1/embeddings");
        let err = parse_ndjson(data.as_bytes(), "/v1/chat/completions", 100, 1024).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest { .. }));
    }

    #[test]
    fn test_parse_rejects_non_post_method() {
        let data = serde_json::json!({
            "method": "GET",
            "url": "/v1/chat/completions",
            "body": {"model": "m"},
        })
        .to_string();
        assert!(parse_ndjson(data.as_bytes(), "/v1/chat/completions", 100, 1024).is_err());
    }

    #[test]
    fn test_parse_rejects_empty_body() {
        let data = serde_json::json!({
            "method": "POST",
            "url": "/v1/chat/completions",
            "body": {},
        })
        .to_string();
        assert!(parse_ndjson(data.as_bytes(), "/v1/chat/completions", 100, 1024).is_err());
    }

    #[test]
    fn test_parse_enforces_request_cap() {
        let data = format!("{}\n{}\n", line("a", "/v1/chat/completions"), line("b", "/v1/chat/completions"));
        let err = parse_ndjson(data.as_bytes(), "/v1/chat/completions", 1, 1024 * 1024).unwrap_err();
        assert!(err.user_message().contains("maximum"));
    }

    #[test]
    fn test_parse_enforces_line_cap() {
        let data = line("a", "/v1/chat/completions");
        let err = parse_ndjson(data.as_bytes(), "/v1/chat/completions", 100, 16).unwrap_err();
        assert!(err.user_message().contains("byte limit"));
    }

    #[test]
    fn test_parse_rejects_empty_file() {
        assert!(parse_ndjson(b"\n\n", "/v1/chat/completions", 100, 1024).is_err());
    }

    #[test]
    fn test_encode_item_error_status_mapping() {
        let cases: Vec<(Error, &str, u16)> = vec![
            (
                Error::InvalidRequest { message: "bad".into() },
                "invalid_request_error",
                400,
            ),
            (
                Error::GuardrailBlocked {
                    stage: crate::errors::GuardrailStage::Prompt,
                    violations: vec![],
                },
                "permission_error",
                403,
            ),
            (Error::RateLimited { message: "slow".into() }, "rate_limit_error", 429),
            (
                Error::ServiceUnavailable { message: "down".into() },
                "service_unavailable",
                503,
            ),
            (
                Error::Provider {
                    status: Some(500),
                    message: "boom".into(),
                },
                "provider_error",
                502,
            ),
            (
                Error::BudgetExceeded {
                    used_cents: 1,
                    limit_cents: 1,
                },
                "provider_error",
                402,
            ),
        ];
        for (err, expected_code, expected_status) in cases {
            let envelope = encode_item_error(&err);
            assert_eq!(envelope["error"]["type"], "batch_error");
            assert_eq!(envelope["error"]["code"], expected_code, "{envelope}");
            assert_eq!(envelope["error"]["status"], expected_status);
        }
    }

    #[test]
    fn test_render_result_lines_completed_only() {
        let make_item = |index: i32, status: &str| BatchItem {
            id: uuid::Uuid::new_v4(),
            batch_id: uuid::Uuid::new_v4(),
            item_index: index,
            status: status.to_string(),
            custom_id: Some(format!("req-{index}")),
            input: serde_json::json!({}),
            response: Some(serde_json::json!({"ok": index})),
            error: Some(serde_json::json!({"error": {"type": "batch_error"}})),
            started_at: None,
            finished_at: None,
        };
        let items = vec![make_item(0, "completed"), make_item(1, "failed"), make_item(2, "completed")];

        let result = String::from_utf8(render_result_lines(&items)).unwrap();
        let lines: Vec<&str> = result.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("req-0"));
        assert!(lines[1].contains("req-2"));

        let errors = render_error_lines(&items).unwrap();
        assert_eq!(String::from_utf8(errors).unwrap().lines().count(), 1);

        let all_ok = vec![make_item(0, "completed")];
        assert!(render_error_lines(&all_ok).is_none());
    }
}
