use sqlx::PgPool;

use crate::db::errors::Result;
use crate::db::models::guardrails::{GuardrailEventDraft, GuardrailPolicyRow};
use crate::types::{ApiKeyId, TenantId};

pub struct Guardrails;

impl Guardrails {
    pub async fn tenant_policy(pool: &PgPool, tenant_id: TenantId) -> Result<Option<GuardrailPolicyRow>> {
        let row = sqlx::query_as::<_, GuardrailPolicyRow>(
            "SELECT id, scope, tenant_id, api_key_id, config, created_at, updated_at
             FROM guardrail_policies WHERE scope = 'tenant' AND tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    pub async fn api_key_policy(pool: &PgPool, api_key_id: ApiKeyId) -> Result<Option<GuardrailPolicyRow>> {
        let row = sqlx::query_as::<_, GuardrailPolicyRow>(
            "SELECT id, scope, tenant_id, api_key_id, config, created_at, updated_at
             FROM guardrail_policies WHERE scope = 'api_key' AND api_key_id = $1",
        )
        .bind(api_key_id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    pub async fn record_event(pool: &PgPool, event: &GuardrailEventDraft) -> Result<()> {
        sqlx::query(
            "INSERT INTO guardrail_events (tenant_id, api_key_id, stage, action, violations, error)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(event.tenant_id)
        .bind(event.api_key_id)
        .bind(&event.stage)
        .bind(&event.action)
        .bind(serde_json::json!(event.violations))
        .bind(&event.error)
        .execute(pool)
        .await?;
        Ok(())
    }
}
