//! File lifecycle service: rows in Postgres, bytes in the blob store.
//!
//! Upload is two-phase: the row is created in `uploading`, the blob is put
//! under a fresh key, and the row flips to `uploaded` with checksum and
//! storage key. A put failure leaves the row in `error`, never a dangling
//! `uploaded` row. The TTL sweeper deletes blob then row and is safe to
//! re-run over partially swept files.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::db::errors::DbError;
use crate::db::handlers::Files;
use crate::db::models::files::{FileRow, FileStatus};
use crate::errors::{Error, Result};
use crate::storage::{BlobStore, ObjectMeta, fresh_key};
use crate::types::{FileId, TenantId};

#[derive(Clone)]
pub struct FileService {
    pool: PgPool,
    store: Arc<dyn BlobStore>,
    encrypted: bool,
    default_ttl: Option<Duration>,
}

impl FileService {
    pub fn new(pool: PgPool, store: Arc<dyn BlobStore>, encrypted: bool, default_ttl: Option<Duration>) -> Self {
        Self {
            pool,
            store,
            encrypted,
            default_ttl,
        }
    }

    /// Store an uploaded file. `expires_at` overrides the configured default
    /// TTL (used by the batch finalizer to inherit the batch's lifetime).
    pub async fn upload(
        &self,
        tenant_id: TenantId,
        filename: &str,
        purpose: &str,
        content_type: &str,
        data: Bytes,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<FileRow> {
        let expires_at = expires_at.or_else(|| {
            self.default_ttl
                .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
                .map(|ttl| Utc::now() + ttl)
        });

        let checksum = hex_digest(&data);
        let row = Files::create(
            &self.pool,
            tenant_id,
            filename,
            purpose,
            content_type,
            data.len() as i64,
            expires_at,
        )
        .await?;

        let key = fresh_key();
        let meta = ObjectMeta {
            content_type: content_type.to_string(),
            metadata: Default::default(),
        };
        if let Err(e) = self.store.put(&key, data, meta).await {
            // Leave a diagnosable row rather than a phantom upload
            if let Err(mark_err) = Files::set_status(&self.pool, row.id, FileStatus::Error).await {
                tracing::error!(file = %row.id, "failed to mark file errored: {mark_err:#}");
            }
            return Err(Error::Database(e));
        }

        let row = Files::mark_uploaded(&self.pool, row.id, &key, &checksum, self.encrypted).await?;
        tracing::info!(file = %row.id, tenant = %tenant_id, purpose, bytes = row.bytes, "file uploaded");
        Ok(row)
    }

    pub async fn get(&self, tenant_id: TenantId, id: FileId) -> Result<FileRow> {
        Ok(Files::get_for_tenant(&self.pool, tenant_id, id).await?)
    }

    pub async fn list(&self, tenant_id: TenantId, limit: i64, after: Option<FileId>) -> Result<Vec<FileRow>> {
        Ok(Files::list_for_tenant(&self.pool, tenant_id, limit, after).await?)
    }

    /// Fetch row and decrypted content together.
    pub async fn content(&self, tenant_id: TenantId, id: FileId) -> Result<(FileRow, Bytes)> {
        let row = Files::get_for_tenant(&self.pool, tenant_id, id).await?;
        if !row.is_uploaded() {
            return Err(Error::InvalidRequest {
                message: format!("file {id} has no content (status: {})", row.status),
            });
        }
        let (data, _meta) = self.store.get(&row.storage_key).await?;
        Ok((row, data))
    }

    /// Soft-delete: blob goes away, the row stays as a tombstone until the
    /// sweeper purges it.
    pub async fn delete(&self, tenant_id: TenantId, id: FileId) -> Result<FileRow> {
        let row = Files::get_for_tenant(&self.pool, tenant_id, id).await?;
        if !row.storage_key.is_empty()
            && let Err(e) = self.store.delete(&row.storage_key).await
        {
            tracing::warn!(file = %id, "blob delete failed, row will be swept later: {e:#}");
        }
        Files::mark_deleted(&self.pool, id).await?;
        tracing::info!(file = %id, tenant = %tenant_id, "file deleted");
        Ok(row)
    }

    /// One sweep pass: delete expired blobs and purge their rows. Returns
    /// the number of files fully removed.
    pub async fn sweep_expired(&self) -> Result<u64> {
        let expired = Files::list_expired(&self.pool, Utc::now(), 500).await?;
        let mut swept = 0u64;

        for row in expired {
            if !row.storage_key.is_empty()
                && let Err(e) = self.store.delete(&row.storage_key).await
            {
                tracing::warn!(file = %row.id, "sweep blob delete failed, keeping row for retry: {e:#}");
                continue;
            }
            match Files::purge(&self.pool, row.id).await {
                Ok(()) => swept += 1,
                // Still referenced (e.g. a batch's input file): tombstone it
                Err(DbError::ForeignKeyViolation { .. }) => {
                    Files::set_status(&self.pool, row.id, FileStatus::Deleted).await?;
                    swept += 1;
                }
                Err(e) => return Err(Error::Database(e)),
            }
        }

        if swept > 0 {
            tracing::info!(swept, "ttl sweep removed expired files");
        }
        Ok(swept)
    }

    /// Background loop driving [`FileService::sweep_expired`].
    pub async fn run_ttl_sweeper(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("ttl sweeper stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.sweep_expired().await {
                tracing::error!("ttl sweep failed: {e:#}");
            }
        }
    }
}

/// Lowercase hex SHA-256 of the plaintext.
pub fn hex_digest(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_digest_known_vector() {
        // sha256("abc")
        assert_eq!(
            hex_digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hex_digest_empty() {
        assert_eq!(
            hex_digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
