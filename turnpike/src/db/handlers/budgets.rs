use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::db::errors::Result;
use crate::db::models::budgets::{AlertLevel, BudgetAlertEvent, BudgetDefaults, TenantBudgetOverride};
use crate::types::TenantId;

pub struct Budgets;

impl Budgets {
    pub async fn defaults(pool: &PgPool) -> Result<BudgetDefaults> {
        let defaults = sqlx::query_as::<_, BudgetDefaults>(
            "SELECT limit_cents, warning_threshold, refresh_schedule, alert_cooldown_secs
             FROM budget_defaults WHERE id = 1",
        )
        .fetch_one(pool)
        .await?;
        Ok(defaults)
    }

    pub async fn tenant_override(pool: &PgPool, tenant_id: TenantId) -> Result<Option<TenantBudgetOverride>> {
        let row = sqlx::query_as::<_, TenantBudgetOverride>(
            "SELECT tenant_id, limit_cents, warning_threshold, refresh_schedule, alert_cooldown_secs
             FROM tenant_budget_overrides WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    /// Timestamp of the most recent successfully dispatched alert for the
    /// (tenant, level) pair; drives cooldown dedupe.
    pub async fn last_alert_sent_at(
        pool: &PgPool,
        tenant_id: TenantId,
        level: AlertLevel,
    ) -> Result<Option<DateTime<Utc>>> {
        let at: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT created_at FROM budget_alert_events
             WHERE tenant_id = $1 AND level = $2 AND success
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(tenant_id)
        .bind(level.as_str())
        .fetch_optional(pool)
        .await?;
        Ok(at)
    }

    /// Append-only record of an alert dispatch attempt, failed ones included.
    pub async fn record_alert_event(
        pool: &PgPool,
        tenant_id: TenantId,
        level: AlertLevel,
        window_start: DateTime<Utc>,
        used_cents: i64,
        limit_cents: i64,
        outcome: std::result::Result<(), String>,
    ) -> Result<BudgetAlertEvent> {
        let (success, error) = match outcome {
            Ok(()) => (true, None),
            Err(msg) => (false, Some(msg)),
        };
        let event = sqlx::query_as::<_, BudgetAlertEvent>(
            "INSERT INTO budget_alert_events
                 (tenant_id, level, window_start, used_cents, limit_cents, success, error)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING id, tenant_id, level, window_start, used_cents, limit_cents, success, error, created_at",
        )
        .bind(tenant_id)
        .bind(level.as_str())
        .bind(window_start)
        .bind(used_cents)
        .bind(limit_cents)
        .bind(success)
        .bind(error)
        .fetch_one(pool)
        .await?;
        Ok(event)
    }
}
