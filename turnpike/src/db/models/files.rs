use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::{FileId, TenantId};

/// File lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Uploading,
    Uploaded,
    Processed,
    Error,
    Deleted,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Uploading => "uploading",
            FileStatus::Uploaded => "uploaded",
            FileStatus::Processed => "processed",
            FileStatus::Error => "error",
            FileStatus::Deleted => "deleted",
        }
    }
}

/// Purposes accepted on upload. `batch_output` is reserved for files the
/// batch finalizer materializes itself.
pub const ACCEPTED_PURPOSES: &[&str] = &["fine-tune", "batch", "assistants", "user_data", "vision"];

/// Purpose of files produced by the batch finalizer.
pub const BATCH_OUTPUT_PURPOSE: &str = "batch_output";

#[derive(Debug, Clone, FromRow)]
pub struct FileRow {
    pub id: FileId,
    pub tenant_id: TenantId,
    pub filename: String,
    pub purpose: String,
    pub content_type: String,
    /// Plaintext byte length; the stored blob may be longer when encrypted.
    pub bytes: i64,
    pub storage_key: String,
    pub checksum_sha256: String,
    pub encrypted: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileRow {
    pub fn is_uploaded(&self) -> bool {
        self.status == FileStatus::Uploaded.as_str() || self.status == FileStatus::Processed.as_str()
    }
}
