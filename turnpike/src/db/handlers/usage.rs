use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};

use crate::db::errors::Result;
use crate::db::models::usage::{UsageDraft, UsageRow};
use crate::types::TenantId;

const USAGE_COLUMNS: &str = "id, tenant_id, api_key_id, alias, provider, prompt_tokens, \
     completion_tokens, total_tokens, cost_cents, latency_ms, status, created_at";

pub struct UsageRows;

impl UsageRows {
    /// Insert one usage row. Takes a connection so callers can bundle the
    /// insert with the mutation it accounts for.
    pub async fn insert(conn: &mut PgConnection, draft: &UsageDraft) -> Result<UsageRow> {
        let row = sqlx::query_as::<_, UsageRow>(&format!(
            "INSERT INTO usage_rows
                 (tenant_id, api_key_id, alias, provider, prompt_tokens,
                  completion_tokens, total_tokens, cost_cents, latency_ms, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             RETURNING {USAGE_COLUMNS}",
        ))
        .bind(draft.tenant_id)
        .bind(draft.api_key_id)
        .bind(&draft.alias)
        .bind(&draft.provider)
        .bind(draft.prompt_tokens as i32)
        .bind(draft.completion_tokens as i32)
        .bind((draft.prompt_tokens + draft.completion_tokens) as i32)
        .bind(draft.cost_cents)
        .bind(draft.latency_ms as i32)
        .bind(&draft.status)
        .fetch_one(conn)
        .await?;
        Ok(row)
    }

    /// Total spend (cents) for a tenant inside [start, end).
    pub async fn window_spend_cents(
        pool: &PgPool,
        tenant_id: TenantId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64> {
        let total: Option<i64> = sqlx::query_scalar(
            "SELECT SUM(cost_cents)::bigint FROM usage_rows
             WHERE tenant_id = $1 AND created_at >= $2 AND created_at < $3",
        )
        .bind(tenant_id)
        .bind(start)
        .bind(end)
        .fetch_one(pool)
        .await?;
        Ok(total.unwrap_or(0))
    }
}
