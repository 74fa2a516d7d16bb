use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::types::{ApiKeyId, TenantId, UsageRowId};

/// Append-only usage record; one row per billed request.
#[derive(Debug, Clone, FromRow)]
pub struct UsageRow {
    pub id: UsageRowId,
    pub tenant_id: TenantId,
    pub api_key_id: Option<ApiKeyId>,
    pub alias: String,
    pub provider: String,
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub total_tokens: i32,
    pub cost_cents: i64,
    pub latency_ms: i32,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Fields the recorder needs to insert a usage row.
#[derive(Debug, Clone)]
pub struct UsageDraft {
    pub tenant_id: TenantId,
    pub api_key_id: Option<ApiKeyId>,
    pub alias: String,
    pub provider: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost_cents: i64,
    pub latency_ms: u64,
    pub status: String,
}
