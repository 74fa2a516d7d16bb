use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::db::errors::Result;
use crate::db::models::files::{FileRow, FileStatus};
use crate::types::{FileId, TenantId};

const FILE_COLUMNS: &str = "id, tenant_id, filename, purpose, content_type, bytes, storage_key, \
     checksum_sha256, encrypted, expires_at, status, created_at, updated_at";

pub struct Files;

impl Files {
    /// Create the row in `uploading` state; the blob put happens afterwards
    /// and flips the status via [`Files::mark_uploaded`].
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        pool: &PgPool,
        tenant_id: TenantId,
        filename: &str,
        purpose: &str,
        content_type: &str,
        bytes: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<FileRow> {
        let row = sqlx::query_as::<_, FileRow>(&format!(
            "INSERT INTO files (tenant_id, filename, purpose, content_type, bytes, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {FILE_COLUMNS}",
        ))
        .bind(tenant_id)
        .bind(filename)
        .bind(purpose)
        .bind(content_type)
        .bind(bytes)
        .bind(expires_at)
        .fetch_one(pool)
        .await?;
        Ok(row)
    }

    pub async fn mark_uploaded(
        pool: &PgPool,
        id: FileId,
        storage_key: &str,
        checksum_sha256: &str,
        encrypted: bool,
    ) -> Result<FileRow> {
        let row = sqlx::query_as::<_, FileRow>(&format!(
            "UPDATE files
             SET status = 'uploaded', storage_key = $2, checksum_sha256 = $3, encrypted = $4,
                 updated_at = now()
             WHERE id = $1
             RETURNING {FILE_COLUMNS}",
        ))
        .bind(id)
        .bind(storage_key)
        .bind(checksum_sha256)
        .bind(encrypted)
        .fetch_one(pool)
        .await?;
        Ok(row)
    }

    pub async fn set_status(pool: &PgPool, id: FileId, status: FileStatus) -> Result<()> {
        sqlx::query("UPDATE files SET status = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn get_for_tenant(pool: &PgPool, tenant_id: TenantId, id: FileId) -> Result<FileRow> {
        let row = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE id = $1 AND tenant_id = $2 AND status <> 'deleted'",
        ))
        .bind(id)
        .bind(tenant_id)
        .fetch_one(pool)
        .await?;
        Ok(row)
    }

    /// Cursor pagination: files created strictly after the `after` row,
    /// oldest first, capped at `limit`.
    pub async fn list_for_tenant(
        pool: &PgPool,
        tenant_id: TenantId,
        limit: i64,
        after: Option<FileId>,
    ) -> Result<Vec<FileRow>> {
        let rows = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE tenant_id = $1
               AND status <> 'deleted'
               AND ($3::uuid IS NULL OR (created_at, id) > (
                   SELECT created_at, id FROM files WHERE id = $3))
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

    pub async fn mark_deleted(pool: &PgPool, id: FileId) -> Result<()> {
        sqlx::query("UPDATE files SET status = 'deleted', updated_at = now() WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Files whose TTL has elapsed, for the sweeper. Already-deleted rows are
    /// included so a partially swept file can be retried safely.
    pub async fn list_expired(pool: &PgPool, now: DateTime<Utc>, limit: i64) -> Result<Vec<FileRow>> {
        let rows = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {FILE_COLUMNS} FROM files
             WHERE expires_at IS NOT NULL AND expires_at <= $1
             ORDER BY expires_at
             LIMIT $2",
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    /// Hard-delete the row once the blob is gone.
    pub async fn purge(pool: &PgPool, id: FileId) -> Result<()> {
        sqlx::query("DELETE FROM files WHERE id = $1").bind(id).execute(pool).await?;
        Ok(())
    }
}
