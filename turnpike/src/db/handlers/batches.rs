use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};

use crate::db::errors::{DbError, Result};
use crate::db::models::batches::{Batch, BatchItem, BatchItemDraft, BatchStatus};
use crate::types::{ApiKeyId, BatchId, BatchItemId, FileId, TenantId};

const BATCH_COLUMNS: &str = "id, tenant_id, api_key_id, endpoint, status, input_file_id, \
     result_file_id, error_file_id, max_concurrency, total, completed, failed, cancelled, \
     completion_window, expires_at, created_at, in_progress_at, finalizing_at, completed_at, \
     failed_at, cancelled_at";

const ITEM_COLUMNS: &str =
    "id, batch_id, item_index, status, custom_id, input, response, error, started_at, finished_at";

pub struct Batches;

impl Batches {
    /// Persist a batch and all of its items in a single transaction.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_with_items(
        pool: &PgPool,
        tenant_id: TenantId,
        api_key_id: Option<ApiKeyId>,
        endpoint: &str,
        input_file_id: FileId,
        max_concurrency: i32,
        completion_window: &str,
        expires_at: DateTime<Utc>,
        items: &[BatchItemDraft],
    ) -> Result<Batch> {
        let mut tx = pool.begin().await?;

        let batch = sqlx::query_as::<_, Batch>(&format!(
            "INSERT INTO batches
                 (tenant_id, api_key_id, endpoint, input_file_id, max_concurrency,
                  completion_window, expires_at, total)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING {BATCH_COLUMNS}",
        ))
        .bind(tenant_id)
        .bind(api_key_id)
        .bind(endpoint)
        .bind(input_file_id)
        .bind(max_concurrency)
        .bind(completion_window)
        .bind(expires_at)
        .bind(items.len() as i32)
        .fetch_one(&mut *tx)
        .await?;

        for item in items {
            sqlx::query(
                "INSERT INTO batch_items (batch_id, item_index, custom_id, input)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(batch.id)
            .bind(item.item_index)
            .bind(&item.custom_id)
            .bind(&item.body)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(batch)
    }

    pub async fn get(pool: &PgPool, id: BatchId) -> Result<Batch> {
        let batch = sqlx::query_as::<_, Batch>(&format!("SELECT {BATCH_COLUMNS} FROM batches WHERE id = $1"))
            .bind(id)
            .fetch_one(pool)
            .await?;
        Ok(batch)
    }

    pub async fn get_for_tenant(pool: &PgPool, tenant_id: TenantId, id: BatchId) -> Result<Batch> {
        let batch = sqlx::query_as::<_, Batch>(&format!(
            "SELECT {BATCH_COLUMNS} FROM batches WHERE id = $1 AND tenant_id = $2",
        ))
        .bind(id)
        .bind(tenant_id)
        .fetch_one(pool)
        .await?;
        Ok(batch)
    }

    pub async fn list_for_tenant(
        pool: &PgPool,
        tenant_id: TenantId,
        limit: i64,
        after: Option<BatchId>,
    ) -> Result<Vec<Batch>> {
        let rows = sqlx::query_as::<_, Batch>(&format!(
            "SELECT {BATCH_COLUMNS} FROM batches
             WHERE tenant_id = $1
               AND ($3::uuid IS NULL OR (created_at, id) > (
                   SELECT created_at, id FROM batches WHERE id = $3))
             ORDER BY created_at, id
             LIMIT $2",
        ))
        .bind(tenant_id)
        .bind(limit)
        .bind(after)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Claim the oldest queued batch, transitioning it to `in_progress`.
    /// `FOR UPDATE SKIP LOCKED` keeps concurrent workers from contending.
    pub async fn claim_next(pool: &PgPool) -> Result<Option<Batch>> {
        let mut tx = pool.begin().await?;

        let claimed: Option<BatchId> = sqlx::query_scalar(
            "SELECT id FROM batches WHERE status = 'queued'
             ORDER BY created_at LIMIT 1
             FOR UPDATE SKIP LOCKED",
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(id) = claimed else {
            tx.rollback().await?;
            return Ok(None);
        };

        let batch = sqlx::query_as::<_, Batch>(&format!(
            "UPDATE batches SET status = 'in_progress', in_progress_at = now()
             WHERE id = $1
             RETURNING {BATCH_COLUMNS}",
        ))
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(batch))
    }

    /// Claim the next queued item of an in-progress batch. Returns `None`
    /// when the batch has no queued items left or is no longer in progress
    /// (cancellation is observed here).
    pub async fn claim_next_item(pool: &PgPool, batch_id: BatchId) -> Result<Option<BatchItem>> {
        let mut tx = pool.begin().await?;

        let in_progress: Option<bool> =
            sqlx::query_scalar("SELECT status = 'in_progress' FROM batches WHERE id = $1")
                .bind(batch_id)
                .fetch_optional(&mut *tx)
                .await?;
        if in_progress != Some(true) {
            tx.rollback().await?;
            return Ok(None);
        }

        let claimed: Option<BatchItemId> = sqlx::query_scalar(
            "SELECT id FROM batch_items
             WHERE batch_id = $1 AND status = 'queued'
             ORDER BY item_index LIMIT 1
             FOR UPDATE SKIP LOCKED",
        )
        .bind(batch_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(id) = claimed else {
            tx.rollback().await?;
            return Ok(None);
        };

        let item = sqlx::query_as::<_, BatchItem>(&format!(
            "UPDATE batch_items SET status = 'running', started_at = now()
             WHERE id = $1
             RETURNING {ITEM_COLUMNS}",
        ))
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(item))
    }

    /// Terminal transition for an item plus its batch counter, atomically.
    /// Exactly one counter column moves per item.
    pub async fn finish_item(
        conn: &mut PgConnection,
        item_id: BatchItemId,
        batch_id: BatchId,
        outcome: ItemOutcome<'_>,
    ) -> Result<()> {
        let (updated, counter) = match outcome {
            ItemOutcome::Completed(response) => (
                sqlx::query(
                    "UPDATE batch_items SET status = 'completed', response = $2, finished_at = now()
                     WHERE id = $1 AND status = 'running'",
                )
                .bind(item_id)
                .bind(response)
                .execute(&mut *conn)
                .await?
                .rows_affected(),
                "completed",
            ),
            ItemOutcome::Failed(error) => (
                sqlx::query(
                    "UPDATE batch_items SET status = 'failed', error = $2, finished_at = now()
                     WHERE id = $1 AND status = 'running'",
                )
                .bind(item_id)
                .bind(error)
                .execute(&mut *conn)
                .await?
                .rows_affected(),
                "failed",
            ),
        };

        if updated == 0 {
            return Err(DbError::NotFound);
        }

        sqlx::query(&format!("UPDATE batches SET {counter} = {counter} + 1 WHERE id = $1"))
            .bind(batch_id)
            .execute(conn)
            .await?;
        Ok(())
    }

    /// Cancel any still-queued items of a cancelled batch, bumping the
    /// cancelled counter once per item. Used by the worker when draining.
    pub async fn cancel_remaining_items(pool: &PgPool, batch_id: BatchId) -> Result<u64> {
        let mut tx = pool.begin().await?;
        let cancelled = sqlx::query(
            "UPDATE batch_items SET status = 'cancelled', finished_at = now()
             WHERE batch_id = $1 AND status = 'queued'",
        )
        .bind(batch_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if cancelled > 0 {
            sqlx::query("UPDATE batches SET cancelled = cancelled + $2 WHERE id = $1")
                .bind(batch_id)
                .bind(cancelled as i32)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(cancelled)
    }

    /// Guarded status transition; returns the fresh row when the source
    /// status matched, `None` when another actor got there first.
    pub async fn transition(
        pool: &PgPool,
        id: BatchId,
        from: &[BatchStatus],
        to: BatchStatus,
    ) -> Result<Option<Batch>> {
        let from_list: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let timestamp_column = match to {
            BatchStatus::InProgress => "in_progress_at",
            BatchStatus::Finalizing => "finalizing_at",
            BatchStatus::Completed => "completed_at",
            BatchStatus::Failed => "failed_at",
            BatchStatus::Cancelled => "cancelled_at",
            BatchStatus::Queued => return Ok(None),
        };
        let batch = sqlx::query_as::<_, Batch>(&format!(
            "UPDATE batches SET status = $2, {timestamp_column} = now()
             WHERE id = $1 AND status = ANY($3)
             RETURNING {BATCH_COLUMNS}",
        ))
        .bind(id)
        .bind(to.as_str())
        .bind(&from_list)
        .fetch_optional(pool)
        .await?;
        Ok(batch)
    }

    pub async fn set_output_files(
        pool: &PgPool,
        id: BatchId,
        result_file_id: Option<FileId>,
        error_file_id: Option<FileId>,
    ) -> Result<()> {
        sqlx::query("UPDATE batches SET result_file_id = $2, error_file_id = $3 WHERE id = $1")
            .bind(id)
            .bind(result_file_id)
            .bind(error_file_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Items in a terminal state, ordered by submission index for output
    /// file materialization.
    pub async fn finished_items(pool: &PgPool, batch_id: BatchId) -> Result<Vec<BatchItem>> {
        let rows = sqlx::query_as::<_, BatchItem>(&format!(
            "SELECT {ITEM_COLUMNS} FROM batch_items
             WHERE batch_id = $1 AND status IN ('completed', 'failed', 'cancelled')
             ORDER BY item_index",
        ))
        .bind(batch_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}

/// Terminal outcome of one executed batch item. Items cancelled in bulk go
/// through [`Batches::cancel_remaining_items`] instead.
pub enum ItemOutcome<'a> {
    Completed(&'a serde_json::Value),
    Failed(&'a serde_json::Value),
}
