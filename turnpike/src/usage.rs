//! Usage recording and cost computation.
//!
//! One append-only row per billed request. Cost is derived from the
//! serving route's per-1K-token prices; image and audio operations use
//! flat per-call overrides from catalog metadata when present. A recording
//! failure is logged and never flips a successful response into an error -
//! the missing row is detectable downstream.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal::prelude::ToPrimitive;
use sqlx::PgPool;

use crate::db::errors::Result as DbResult;
use crate::db::handlers::UsageRows;
use crate::db::models::usage::{UsageDraft, UsageRow};

/// `round((prompt * price_in + completion * price_out) / 1000 * 100)` with
/// prices in dollars per 1K tokens, result in cents.
pub fn cost_cents(prompt_tokens: u32, completion_tokens: u32, price_input: Decimal, price_output: Decimal) -> i64 {
    let dollars = (Decimal::from(prompt_tokens) * price_input + Decimal::from(completion_tokens) * price_output)
        / Decimal::from(1000);
    (dollars * Decimal::from(100))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(0)
}

/// Flat per-call cost from catalog metadata (`price_image_cents`,
/// `price_audio_cents`, ...), multiplied by the unit count.
pub fn flat_cost_cents(metadata: &serde_json::Value, field: &str, units: u32) -> i64 {
    metadata
        .get(field)
        .and_then(|v| v.as_i64())
        .map(|cents| cents * units as i64)
        .unwrap_or(0)
}

/// Rough token estimate for streams whose provider reported no usage:
/// four tokens per three whitespace-separated words, rounded up.
pub fn estimate_tokens(text: &str) -> u32 {
    let words = text.split_whitespace().count() as u32;
    (words * 4).div_ceil(3)
}

#[derive(Clone)]
pub struct UsageRecorder {
    pool: PgPool,
}

impl UsageRecorder {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert one usage row in its own transaction.
    pub async fn record(&self, draft: &UsageDraft) -> DbResult<UsageRow> {
        let mut tx = self.pool.begin().await?;
        let row = UsageRows::insert(&mut *tx, draft).await?;
        tx.commit().await?;
        Ok(row)
    }

    /// Record and swallow failures (logged); used on the request path where
    /// the response must not be flipped to an error.
    pub async fn record_best_effort(&self, draft: &UsageDraft) {
        if let Err(e) = self.record(draft).await {
            tracing::error!(
                tenant = %draft.tenant_id,
                alias = %draft.alias,
                "failed to record usage row: {e:#}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        Decimal::from_str_exact(s).unwrap()
    }

    #[test]
    fn test_cost_cents_formula() {
        // 1000 prompt at $0.03/1K + 500 completion at $0.06/1K = $0.06 = 6 cents
        assert_eq!(cost_cents(1000, 500, d("0.03"), d("0.06")), 6);
    }

    #[test]
    fn test_cost_cents_rounds_half_up() {
        // 50 prompt tokens at $0.1/1K = $0.005 = 0.5 cents, rounds away from zero
        assert_eq!(cost_cents(50, 0, d("0.1"), d("0")), 1);
        // just below the midpoint rounds down
        assert_eq!(cost_cents(49, 0, d("0.1"), d("0")), 0);
    }

    #[test]
    fn test_cost_cents_zero_prices() {
        assert_eq!(cost_cents(100_000, 100_000, d("0"), d("0")), 0);
    }

    #[test]
    fn test_cost_cents_typical_chat() {
        // 9 prompt + 12 completion at $0.50/$1.50 per 1K
        // (9*0.5 + 12*1.5)/1000 = $0.0225 = 2.25 cents -> 2
        assert_eq!(cost_cents(9, 12, d("0.5"), d("1.5")), 2);
    }

    #[test]
    fn test_flat_cost_from_metadata() {
        let metadata = serde_json::json!({"price_image_cents": 4});
        assert_eq!(flat_cost_cents(&metadata, "price_image_cents", 3), 12);
        assert_eq!(flat_cost_cents(&metadata, "price_audio_cents", 3), 0);
    }

    #[test]
    fn test_estimate_tokens_scales_with_words() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("one two three"), 4);
        assert_eq!(estimate_tokens("one two three four five six"), 8);
        // non-multiples of three land close to words * 4/3
        let estimate = estimate_tokens("a b c d");
        assert!((5..=7).contains(&estimate), "got {estimate}");
    }
}
