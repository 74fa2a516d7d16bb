//! Budget evaluation: window resolution, spend pre-checks, and deduplicated
//! alert dispatch.
//!
//! Budgets are windows over `usage_rows` spend. The pre-check is
//! non-predictive: a request is admitted while `used < limit`, so overshoot
//! is bounded by concurrent in-flight spend, and the *next* request after
//! crossing the line is denied. Warning and exceeded alerts are deduplicated
//! through the append-only `budget_alert_events` table rather than an
//! in-memory timer, so cooldowns survive restarts.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, FixedOffset, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

use crate::alerts::{AlertDispatcher, AlertPayload};
use crate::db::handlers::{Budgets, UsageRows};
use crate::db::models::budgets::{AlertLevel, RefreshSchedule};
use crate::db::models::tenants::Tenant;
use crate::errors::{Error, Result};

/// Budget configuration after tenant overrides are applied.
#[derive(Debug, Clone)]
pub struct ResolvedBudget {
    pub limit_cents: i64,
    pub warning_threshold: Decimal,
    pub schedule: RefreshSchedule,
    pub cooldown: Duration,
}

/// Point-in-time view of a tenant's budget, also the source for the
/// `X-Budget-*` response headers.
#[derive(Debug, Clone, Copy)]
pub struct BudgetSnapshot {
    pub limit_cents: i64,
    pub used_cents: i64,
    pub warning_threshold: f64,
    pub exceeded: bool,
    pub window_start: DateTime<Utc>,
}

impl BudgetSnapshot {
    pub fn remaining_cents(&self) -> i64 {
        (self.limit_cents - self.used_cents).max(0)
    }

    /// An unlimited tenant (no budget configured) never hits the evaluator.
    pub fn unlimited() -> Self {
        Self {
            limit_cents: 0,
            used_cents: 0,
            warning_threshold: 1.0,
            exceeded: false,
            window_start: Utc::now(),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.limit_cents <= 0
    }
}

/// Resolve the [start, end) window for a schedule at `now`, evaluated in
/// the reporting timezone and returned in UTC.
pub fn window_bounds(schedule: RefreshSchedule, now: DateTime<Utc>, offset: FixedOffset) -> (DateTime<Utc>, DateTime<Utc>) {
    let local = now.with_timezone(&offset);
    match schedule {
        RefreshSchedule::CalendarMonth => {
            let start_date = NaiveDate::from_ymd_opt(local.year(), local.month(), 1).expect("valid first of month");
            let (next_year, next_month) = if local.month() == 12 {
                (local.year() + 1, 1)
            } else {
                (local.year(), local.month() + 1)
            };
            let end_date = NaiveDate::from_ymd_opt(next_year, next_month, 1).expect("valid first of next month");
            (local_midnight(start_date, offset), local_midnight(end_date, offset))
        }
        RefreshSchedule::Weekly => {
            let days_from_monday = local.weekday().num_days_from_monday() as i64;
            let start_date = local.date_naive() - ChronoDuration::days(days_from_monday);
            let start = local_midnight(start_date, offset);
            (start, start + ChronoDuration::days(7))
        }
        RefreshSchedule::RollingDays(days) => (now - ChronoDuration::hours(24 * days as i64), now),
    }
}

fn local_midnight(date: NaiveDate, offset: FixedOffset) -> DateTime<Utc> {
    let naive = date.and_hms_opt(0, 0, 0).expect("midnight exists");
    offset
        .from_local_datetime(&naive)
        .single()
        .expect("fixed offsets have unambiguous local times")
        .with_timezone(&Utc)
}

pub struct BudgetEvaluator {
    pool: PgPool,
    dispatcher: Arc<AlertDispatcher>,
    offset: FixedOffset,
}

impl BudgetEvaluator {
    pub fn new(pool: PgPool, dispatcher: Arc<AlertDispatcher>, utc_offset_minutes: i32) -> Self {
        let offset = FixedOffset::east_opt(utc_offset_minutes * 60)
            .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset is valid"));
        Self {
            pool,
            dispatcher,
            offset,
        }
    }

    async fn resolve(&self, tenant: &Tenant) -> Result<ResolvedBudget> {
        let defaults = Budgets::defaults(&self.pool).await?;
        let overrides = Budgets::tenant_override(&self.pool, tenant.id).await?;

        let (limit_cents, warning_threshold, schedule_text, cooldown_secs) = match overrides {
            Some(o) => (
                o.limit_cents.unwrap_or(defaults.limit_cents),
                o.warning_threshold.unwrap_or(defaults.warning_threshold),
                o.refresh_schedule.unwrap_or(defaults.refresh_schedule),
                o.alert_cooldown_secs.unwrap_or(defaults.alert_cooldown_secs),
            ),
            None => (
                defaults.limit_cents,
                defaults.warning_threshold,
                defaults.refresh_schedule,
                defaults.alert_cooldown_secs,
            ),
        };

        let schedule = RefreshSchedule::parse(&schedule_text).unwrap_or(RefreshSchedule::CalendarMonth);
        Ok(ResolvedBudget {
            limit_cents,
            warning_threshold,
            schedule,
            cooldown: Duration::from_secs(cooldown_secs.max(0) as u64),
        })
    }

    async fn evaluate(&self, tenant: &Tenant) -> Result<(BudgetSnapshot, ResolvedBudget)> {
        let budget = self.resolve(tenant).await?;
        if budget.limit_cents <= 0 {
            return Ok((BudgetSnapshot::unlimited(), budget));
        }

        let (start, end) = window_bounds(budget.schedule, Utc::now(), self.offset);
        let used_cents = UsageRows::window_spend_cents(&self.pool, tenant.id, start, end).await?;
        let snapshot = BudgetSnapshot {
            limit_cents: budget.limit_cents,
            used_cents,
            warning_threshold: budget.warning_threshold.to_f64().unwrap_or(1.0),
            exceeded: used_cents >= budget.limit_cents,
            window_start: start,
        };
        Ok((snapshot, budget))
    }

    /// Admission check. Returns the snapshot for response headers, or
    /// `budget_exceeded` when the window's spend has reached the limit.
    /// Alerts are enqueued as thresholds are crossed, under cooldown.
    pub async fn pre_check(&self, tenant: &Tenant) -> Result<BudgetSnapshot> {
        let (snapshot, budget) = self.evaluate(tenant).await?;
        if snapshot.is_unlimited() {
            return Ok(snapshot);
        }

        self.alert_on_thresholds(tenant, &snapshot, &budget).await;

        if snapshot.exceeded {
            return Err(Error::BudgetExceeded {
                used_cents: snapshot.used_cents,
                limit_cents: snapshot.limit_cents,
            });
        }
        Ok(snapshot)
    }

    /// Post-recording re-evaluation: fires threshold alerts that the just
    /// recorded spend crossed. Never fails the request.
    pub async fn post_update(&self, tenant: &Tenant) -> BudgetSnapshot {
        match self.evaluate(tenant).await {
            Ok((snapshot, budget)) => {
                if !snapshot.is_unlimited() {
                    self.alert_on_thresholds(tenant, &snapshot, &budget).await;
                }
                snapshot
            }
            Err(e) => {
                tracing::error!(tenant = %tenant.id, "budget post-update failed: {e:#}");
                BudgetSnapshot::unlimited()
            }
        }
    }

    async fn alert_on_thresholds(&self, tenant: &Tenant, snapshot: &BudgetSnapshot, budget: &ResolvedBudget) {
        let warn_at = (Decimal::from(budget.limit_cents) * budget.warning_threshold).to_i64().unwrap_or(i64::MAX);
        if snapshot.used_cents >= warn_at {
            self.maybe_send(tenant, AlertLevel::Warning, snapshot, budget).await;
        }
        if snapshot.exceeded {
            self.maybe_send(tenant, AlertLevel::Exceeded, snapshot, budget).await;
        }
    }

    /// Send one alert unless a successful one for this (tenant, level) is
    /// still inside the cooldown. Dispatch outcome is recorded either way.
    async fn maybe_send(&self, tenant: &Tenant, level: AlertLevel, snapshot: &BudgetSnapshot, budget: &ResolvedBudget) {
        let last = match Budgets::last_alert_sent_at(&self.pool, tenant.id, level).await {
            Ok(last) => last,
            Err(e) => {
                tracing::error!(tenant = %tenant.id, "alert dedupe lookup failed: {e:#}");
                return;
            }
        };
        if let Some(last) = last {
            let elapsed = Utc::now().signed_duration_since(last);
            if elapsed < ChronoDuration::from_std(budget.cooldown).unwrap_or(ChronoDuration::hours(1)) {
                return;
            }
        }

        let payload = AlertPayload {
            tenant_id: tenant.id,
            tenant_name: tenant.name.clone(),
            level,
            used_cents: snapshot.used_cents,
            limit_cents: snapshot.limit_cents,
            window_start: snapshot.window_start,
        };
        let outcome = self.dispatcher.dispatch(&payload).await;
        if let Err(e) = Budgets::record_alert_event(
            &self.pool,
            tenant.id,
            level,
            snapshot.window_start,
            snapshot.used_cents,
            snapshot.limit_cents,
            outcome,
        )
        .await
        {
            tracing::error!(tenant = %tenant.id, "failed to record alert event: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn offset(hours: i32) -> FixedOffset {
        FixedOffset::east_opt(hours * 3600).unwrap()
    }

    #[test]
    fn test_calendar_month_window() {
        let now = utc(2026, 7, 15, 12, 0);
        let (start, end) = window_bounds(RefreshSchedule::CalendarMonth, now, offset(0));
        assert_eq!(start, utc(2026, 7, 1, 0, 0));
        assert_eq!(end, utc(2026, 8, 1, 0, 0));
    }

    #[test]
    fn test_calendar_month_december_rolls_over() {
        let now = utc(2026, 12, 20, 9, 30);
        let (start, end) = window_bounds(RefreshSchedule::CalendarMonth, now, offset(0));
        assert_eq!(start, utc(2026, 12, 1, 0, 0));
        assert_eq!(end, utc(2027, 1, 1, 0, 0));
    }

    #[test]
    fn test_calendar_month_respects_reporting_offset() {
        // 2026-07-01 01:00 UTC is still June 30th in UTC-5
        let now = utc(2026, 7, 1, 1, 0);
        let (start, _end) = window_bounds(RefreshSchedule::CalendarMonth, now, offset(-5));
        // June 1st 00:00 at UTC-5 is 05:00 UTC
        assert_eq!(start, utc(2026, 6, 1, 5, 0));
    }

    #[test]
    fn test_weekly_window_starts_monday() {
        // 2026-07-15 is a Wednesday
        let now = utc(2026, 7, 15, 12, 0);
        let (start, end) = window_bounds(RefreshSchedule::Weekly, now, offset(0));
        assert_eq!(start, utc(2026, 7, 13, 0, 0));
        assert_eq!(end, utc(2026, 7, 20, 0, 0));
    }

    #[test]
    fn test_weekly_window_on_monday_is_current_week() {
        // 2026-07-13 is a Monday
        let now = utc(2026, 7, 13, 0, 30);
        let (start, _) = window_bounds(RefreshSchedule::Weekly, now, offset(0));
        assert_eq!(start, utc(2026, 7, 13, 0, 0));
    }

    #[test]
    fn test_rolling_window() {
        let now = utc(2026, 7, 15, 12, 0);
        let (start, end) = window_bounds(RefreshSchedule::RollingDays(7), now, offset(0));
        assert_eq!(end, now);
        assert_eq!(start, utc(2026, 7, 8, 12, 0));
    }

    #[test]
    fn test_snapshot_remaining_floors_at_zero() {
        let snapshot = BudgetSnapshot {
            limit_cents: 100,
            used_cents: 130,
            warning_threshold: 0.8,
            exceeded: true,
            window_start: Utc::now(),
        };
        assert_eq!(snapshot.remaining_cents(), 0);
    }
}
