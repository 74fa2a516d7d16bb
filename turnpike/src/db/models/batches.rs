use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::{ApiKeyId, BatchId, BatchItemId, FileId, TenantId};

/// Endpoints a batch may target.
pub const SUPPORTED_BATCH_ENDPOINTS: &[&str] =
    &["/v1/chat/completions", "/v1/embeddings", "/v1/images/generations"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Queued,
    InProgress,
    Finalizing,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Queued => "queued",
            BatchStatus::InProgress => "in_progress",
            BatchStatus::Finalizing => "finalizing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(BatchStatus::Queued),
            "in_progress" => Some(BatchStatus::InProgress),
            "finalizing" => Some(BatchStatus::Finalizing),
            "completed" => Some(BatchStatus::Completed),
            "failed" => Some(BatchStatus::Failed),
            "cancelled" => Some(BatchStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchItemStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BatchItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchItemStatus::Queued => "queued",
            BatchItemStatus::Running => "running",
            BatchItemStatus::Completed => "completed",
            BatchItemStatus::Failed => "failed",
            BatchItemStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Batch {
    pub id: BatchId,
    pub tenant_id: TenantId,
    pub api_key_id: Option<ApiKeyId>,
    pub endpoint: String,
    pub status: String,
    pub input_file_id: FileId,
    pub result_file_id: Option<FileId>,
    pub error_file_id: Option<FileId>,
    pub max_concurrency: i32,
    pub total: i32,
    pub completed: i32,
    pub failed: i32,
    pub cancelled: i32,
    pub completion_window: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub in_progress_at: Option<DateTime<Utc>>,
    pub finalizing_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn batch_status(&self) -> Option<BatchStatus> {
        BatchStatus::parse(&self.status)
    }

    /// All items have reached a terminal state; equality triggers finalization.
    pub fn counts_settled(&self) -> bool {
        self.completed + self.failed + self.cancelled == self.total
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct BatchItem {
    pub id: BatchItemId,
    pub batch_id: BatchId,
    pub item_index: i32,
    pub status: String,
    pub custom_id: Option<String>,
    pub input: serde_json::Value,
    pub response: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One parsed NDJSON line, ready for insertion.
#[derive(Debug, Clone)]
pub struct BatchItemDraft {
    pub item_index: i32,
    pub custom_id: Option<String>,
    pub body: serde_json::Value,
}
