use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::types::{ApiKeyId, TenantId};

#[derive(Debug, Clone, FromRow)]
pub struct GuardrailPolicyRow {
    pub id: uuid::Uuid,
    pub scope: String,
    pub tenant_id: Option<TenantId>,
    pub api_key_id: Option<ApiKeyId>,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Recorded guardrail decision or webhook failure, for admin review.
#[derive(Debug, Clone)]
pub struct GuardrailEventDraft {
    pub tenant_id: TenantId,
    pub api_key_id: Option<ApiKeyId>,
    pub stage: String,
    pub action: String,
    pub violations: Vec<String>,
    pub error: Option<String>,
}
