//! Engine configuration constants and environment flag parsing.
//!
//! This module contains fee fractions, window lengths, batching limits, and
//! environment variable helpers shared across the settlement engine.

/// Milliseconds in a day
pub const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Fraction of the resolution payout pool routed to the market creator.
/// Not charged on CANCEL resolutions (refunds must be exact).
pub const CREATOR_FEE: f64 = 0.04;

/// Fraction of gross sale proceeds routed to the market creator on a bet sale
pub const SALE_FEE: f64 = 0.04;

/// Maximum write operations per batch accepted by the store backends.
/// Callers chunk bulk updates to this size.
pub const MAX_BATCH_WRITES: usize = 500;

/// Maximum commit attempts for an optimistic multi-document transaction
pub const TRANSACTION_RETRIES: u32 = 5;

/// Metrics batch job cadence (15 minutes in the reference deployment)
pub const METRICS_INTERVAL_SECS: u64 = 15 * 60;

/// Portfolio history loaded by the metrics job: trailing ~31 days,
/// so the monthly profit window always has a baseline snapshot.
pub const PORTFOLIO_HISTORY_WINDOW_MS: i64 = 31 * DAY_MS;

/// Leaderboard entries retained per group, per side (traders/creators)
pub const LEADERBOARD_SIZE: usize = 50;

/// Quantize a money amount to whole cents.
///
/// Calculators return unrounded values; every balance mutation passes
/// through here at the persistence boundary so ledger state never
/// accumulates sub-cent drift.
#[inline]
pub fn round_to_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

/// Current wall-clock time in epoch milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Dry-run mode (set DRY_RUN=1 to enable)
/// When enabled, the metrics job computes and logs all updates but skips
/// the bulk writes. Useful for verifying aggregation logic against a
/// production snapshot.
pub fn dry_run_enabled() -> bool {
    static CACHED: std::sync::OnceLock<bool> = std::sync::OnceLock::new();
    *CACHED.get_or_init(|| {
        std::env::var("DRY_RUN")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_to_cents() {
        assert_eq!(round_to_cents(12.3456), 12.35);
        assert_eq!(round_to_cents(1.004), 1.0);
        assert_eq!(round_to_cents(0.1 + 0.2), 0.3);
        assert_eq!(round_to_cents(0.0), 0.0);
    }
}
