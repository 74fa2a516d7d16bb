use sqlx::PgPool;

use crate::db::errors::Result;
use crate::db::models::api_keys::ApiKey;

pub struct ApiKeys;

impl ApiKeys {
    /// Look up a key by its public prefix. Revocation and tenant status are
    /// checked by the caller so the failure mode stays uniform.
    pub async fn find_by_prefix(pool: &PgPool, prefix: &str) -> Result<ApiKey> {
        let key = sqlx::query_as::<_, ApiKey>(
            "SELECT id, tenant_id, name, prefix, secret_hash, scopes,
                    rpm_limit, tpm_limit, max_parallel, revoked_at, created_at
             FROM api_keys WHERE prefix = $1",
        )
        .bind(prefix)
        .fetch_one(pool)
        .await?;
        Ok(key)
    }

    pub async fn get(pool: &PgPool, id: crate::types::ApiKeyId) -> Result<ApiKey> {
        let key = sqlx::query_as::<_, ApiKey>(
            "SELECT id, tenant_id, name, prefix, secret_hash, scopes,
                    rpm_limit, tpm_limit, max_parallel, revoked_at, created_at
             FROM api_keys WHERE id = $1",
        )
        .bind(id)
        .fetch_one(pool)
        .await?;
        Ok(key)
    }
}
