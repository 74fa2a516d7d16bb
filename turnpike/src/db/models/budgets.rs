use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::TenantId;

/// How a budget window refreshes.
///
/// Serialized form matches the persisted text: `calendar_month`, `weekly`,
/// or `rolling_<N>d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshSchedule {
    CalendarMonth,
    Weekly,
    RollingDays(u32),
}

impl RefreshSchedule {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "calendar_month" => Some(RefreshSchedule::CalendarMonth),
            "weekly" => Some(RefreshSchedule::Weekly),
            other => {
                let days = other.strip_prefix("rolling_")?.strip_suffix('d')?;
                days.parse().ok().filter(|d| *d > 0).map(RefreshSchedule::RollingDays)
            }
        }
    }

    pub fn to_string_form(&self) -> String {
        match self {
            RefreshSchedule::CalendarMonth => "calendar_month".to_string(),
            RefreshSchedule::Weekly => "weekly".to_string(),
            RefreshSchedule::RollingDays(n) => format!("rolling_{n}d"),
        }
    }
}

/// System-wide budget defaults (single row).
#[derive(Debug, Clone, FromRow)]
pub struct BudgetDefaults {
    pub limit_cents: i64,
    pub warning_threshold: Decimal,
    pub refresh_schedule: String,
    pub alert_cooldown_secs: i64,
}

/// Per-tenant overrides; any NULL field falls back to the defaults.
#[derive(Debug, Clone, FromRow)]
pub struct TenantBudgetOverride {
    pub tenant_id: TenantId,
    pub limit_cents: Option<i64>,
    pub warning_threshold: Option<Decimal>,
    pub refresh_schedule: Option<String>,
    pub alert_cooldown_secs: Option<i64>,
}

/// Budget alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Exceeded,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Warning => "warning",
            AlertLevel::Exceeded => "exceeded",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct BudgetAlertEvent {
    pub id: uuid::Uuid,
    pub tenant_id: TenantId,
    pub level: String,
    pub window_start: DateTime<Utc>,
    pub used_cents: i64,
    pub limit_cents: i64,
    pub success: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_schedule_parse() {
        assert_eq!(RefreshSchedule::parse("calendar_month"), Some(RefreshSchedule::CalendarMonth));
        assert_eq!(RefreshSchedule::parse("weekly"), Some(RefreshSchedule::Weekly));
        assert_eq!(RefreshSchedule::parse("rolling_7d"), Some(RefreshSchedule::RollingDays(7)));
        assert_eq!(RefreshSchedule::parse("rolling_30d"), Some(RefreshSchedule::RollingDays(30)));
        assert_eq!(RefreshSchedule::parse("rolling_0d"), None);
        assert_eq!(RefreshSchedule::parse("hourly"), None);
    }

    #[test]
    fn test_refresh_schedule_round_trip() {
        for schedule in [
            RefreshSchedule::CalendarMonth,
            RefreshSchedule::Weekly,
            RefreshSchedule::RollingDays(14),
        ] {
            assert_eq!(RefreshSchedule::parse(&schedule.to_string_form()), Some(schedule));
        }
    }
}
