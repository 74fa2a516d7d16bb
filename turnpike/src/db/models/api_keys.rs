use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::types::{ApiKeyId, TenantId};

/// Persisted API key. The secret itself is never stored; `secret_hash` is an
/// Argon2id hash and `prefix` is the public lookup handle.
#[derive(Debug, Clone, FromRow)]
pub struct ApiKey {
    pub id: ApiKeyId,
    pub tenant_id: TenantId,
    pub name: String,
    pub prefix: String,
    pub secret_hash: String,
    pub scopes: serde_json::Value,
    pub rpm_limit: Option<i64>,
    pub tpm_limit: Option<i64>,
    pub max_parallel: Option<i64>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}
