//! Core entity definitions for the settlement engine.
//!
//! These types mirror the externally-defined store schema (camelCase JSON
//! documents): contracts, bets, users, portfolio snapshots, and groups.
//! The engine never owns this schema; it computes over it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// === Contracts ===

/// Market question format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeType {
    /// Two-sided YES/NO market
    #[serde(rename = "BINARY")]
    Binary,
    /// Multiple user-submitted answers, one or more may win
    #[serde(rename = "FREE_RESPONSE")]
    FreeResponse,
}

/// Liquidity pool of a constant-product market
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CpmmPool {
    #[serde(rename = "YES")]
    pub yes: f64,
    #[serde(rename = "NO")]
    pub no: f64,
}

impl CpmmPool {
    /// Probability of YES implied by the pool: NO liquidity share of the
    /// pool. Scarce YES liquidity means expensive YES shares.
    pub fn probability(&self) -> f64 {
        self.no / (self.yes + self.no)
    }

    /// Constant-product invariant `yes * no`
    pub fn invariant(&self) -> f64 {
        self.yes * self.no
    }
}

/// Pricing mechanism, tagged the way the store schema tags it.
///
/// Each variant carries the pool state that mechanism actually maintains:
/// cpmm keeps a two-sided liquidity pool, dpm keeps parimutuel per-outcome
/// pools plus outstanding share and stake totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mechanism")]
pub enum Mechanism {
    /// Constant-product market maker (binary markets only)
    #[serde(rename = "cpmm-1")]
    Cpmm { pool: CpmmPool },
    /// Dynamic parimutuel (legacy; binary and free-response)
    #[serde(rename = "dpm-2")]
    Dpm {
        pool: HashMap<String, f64>,
        #[serde(rename = "totalShares")]
        total_shares: HashMap<String, f64>,
        #[serde(rename = "totalBets")]
        total_bets: HashMap<String, f64>,
    },
}

impl Mechanism {
    /// Current probability of the given outcome implied by pool state
    pub fn outcome_probability(&self, outcome: &str) -> f64 {
        match self {
            Mechanism::Cpmm { pool } => match outcome {
                "YES" => pool.probability(),
                "NO" => 1.0 - pool.probability(),
                _ => 0.0,
            },
            Mechanism::Dpm { pool, .. } => {
                let total: f64 = pool.values().sum();
                if total <= 0.0 {
                    0.0
                } else {
                    pool.get(outcome).copied().unwrap_or(0.0) / total
                }
            }
        }
    }

    /// Pool-derived probability of YES (the headline probability for
    /// binary markets, used when no bets exist yet)
    pub fn probability(&self) -> f64 {
        self.outcome_probability("YES")
    }
}

/// Probability deltas bucketed by recency, cached on cpmm contracts
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbChanges {
    pub day: f64,
    pub week: f64,
    pub month: f64,
}

/// A market. Resolution fields are write-once: they are set exactly once by
/// the resolution orchestrator and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contract {
    pub id: String,
    pub creator_id: String,
    pub question: String,
    pub outcome_type: OutcomeType,
    #[serde(flatten)]
    pub mechanism: Mechanism,
    pub created_time: i64,
    #[serde(default)]
    pub close_time: Option<i64>,

    // Resolution state (unset until resolved)
    #[serde(default)]
    pub is_resolved: bool,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub resolution_probability: Option<f64>,
    #[serde(default)]
    pub resolutions: Option<HashMap<String, f64>>,
    #[serde(default)]
    pub resolution_time: Option<i64>,
    /// Idempotency marker: set before payout disbursement begins, so a
    /// re-run of a crashed resolution can never double-pay.
    #[serde(default)]
    pub payouts_applied: bool,

    // Aggregate counters refreshed by the metrics job
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub volume_24_hours: f64,
    #[serde(default)]
    pub volume_7_days: f64,
    #[serde(default)]
    pub prob: Option<f64>,
    #[serde(default)]
    pub prob_changes: Option<ProbChanges>,
}

impl Contract {
    /// Whether trading on this contract has closed
    pub fn is_closed(&self, now: i64) -> bool {
        matches!(self.close_time, Some(t) if now > t)
    }
}

// === Bets ===

/// Link from a synthetic sale bet back to the bet it liquidated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleRecord {
    /// Gross sale proceeds
    pub amount: f64,
    /// Id of the bet that was sold
    pub bet_id: String,
}

/// An individual wager. Created at bet placement or, with a negative amount
/// and a `sale` record, at sale settlement. Never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bet {
    pub id: String,
    pub user_id: String,
    pub contract_id: String,
    /// Stake in currency units; negative for synthetic sale bets
    pub amount: f64,
    /// Shares acquired on `outcome`; negative for synthetic sale bets
    pub shares: f64,
    pub outcome: String,
    pub prob_before: f64,
    pub prob_after: f64,
    pub created_time: i64,
    /// Transitions false -> true exactly once, never reverses
    #[serde(default)]
    pub is_sold: bool,
    #[serde(default)]
    pub sale: Option<SaleRecord>,
    /// Ante bets seed liquidity and are excluded from trader counts
    #[serde(default)]
    pub is_ante: bool,
}

impl Bet {
    /// Open bets participate in payouts: not sold, and not themselves a
    /// sale settlement.
    pub fn is_open(&self) -> bool {
        !self.is_sold && self.sale.is_none()
    }
}

// === Users ===

/// Cached profit deltas, recomputed from portfolio history each metrics cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfitMetrics {
    pub daily: f64,
    pub weekly: f64,
    pub monthly: f64,
    pub all_time: f64,
}

/// A trading account. Balance is only ever mutated with a ledger reason
/// (payout, sale proceeds, loan); the cached metric fields are derived state
/// refreshed by the metrics job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    pub balance: f64,
    #[serde(default)]
    pub total_deposits: f64,
    #[serde(default)]
    pub creator_volume_cached: f64,
    #[serde(default)]
    pub profit_cached: ProfitMetrics,
    #[serde(default)]
    pub next_loan_cached: f64,
}

/// Point-in-time snapshot of a user's balance, open-bet value, and deposits.
/// Append-only time series; a row is written per metrics cycle only when one
/// of the values changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioSnapshot {
    pub user_id: String,
    pub balance: f64,
    pub investment_value: f64,
    pub total_deposits: f64,
    pub timestamp: i64,
}

// === Payouts ===

/// Ephemeral computed payout; summed per user and applied to balances,
/// never persisted directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payout {
    pub user_id: String,
    pub payout: f64,
}

// === Groups ===

/// A leaderboard entry: user plus opaque score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserScore {
    pub user_id: String,
    pub score: f64,
}

/// Cached per-group leaderboards, top entries by score descending
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Leaderboard {
    pub top_traders: Vec<UserScore>,
    pub top_creators: Vec<UserScore>,
}

/// A curated collection of contracts with its own leaderboard
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub cached_leaderboard: Option<Leaderboard>,
}

/// Membership edge between a group and a contract
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupContract {
    pub group_id: String,
    pub contract_id: String,
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cpmm_contract() -> serde_json::Value {
        json!({
            "id": "c1",
            "creatorId": "alice",
            "question": "Will it rain tomorrow?",
            "outcomeType": "BINARY",
            "mechanism": "cpmm-1",
            "pool": { "YES": 100.0, "NO": 100.0 },
            "createdTime": 0,
            "closeTime": 1000
        })
    }

    #[test]
    fn test_contract_roundtrip_cpmm() {
        let contract: Contract = serde_json::from_value(cpmm_contract()).unwrap();
        assert_eq!(contract.outcome_type, OutcomeType::Binary);
        match &contract.mechanism {
            Mechanism::Cpmm { pool } => {
                assert_eq!(pool.yes, 100.0);
                assert_eq!(pool.no, 100.0);
            }
            other => panic!("expected cpmm mechanism, got {:?}", other),
        }

        // The mechanism tag must survive serialization at the top level
        let value = serde_json::to_value(&contract).unwrap();
        assert_eq!(value["mechanism"], "cpmm-1");
        assert_eq!(value["pool"]["YES"], 100.0);
    }

    #[test]
    fn test_contract_roundtrip_dpm() {
        let contract: Contract = serde_json::from_value(json!({
            "id": "c2",
            "creatorId": "bob",
            "question": "Who wins the league?",
            "outcomeType": "FREE_RESPONSE",
            "mechanism": "dpm-2",
            "pool": { "0": 50.0, "1": 30.0 },
            "totalShares": { "0": 80.0, "1": 40.0 },
            "totalBets": { "0": 50.0, "1": 30.0 },
            "createdTime": 0
        }))
        .unwrap();

        match &contract.mechanism {
            Mechanism::Dpm { pool, total_shares, .. } => {
                assert_eq!(pool["0"], 50.0);
                assert_eq!(total_shares["1"], 40.0);
            }
            other => panic!("expected dpm mechanism, got {:?}", other),
        }
    }

    #[test]
    fn test_cpmm_probability() {
        // Balanced pool -> 50%
        let pool = CpmmPool { yes: 100.0, no: 100.0 };
        assert!((pool.probability() - 0.5).abs() < 1e-12);

        // Scarce YES liquidity -> YES is likely
        let pool = CpmmPool { yes: 25.0, no: 75.0 };
        assert!((pool.probability() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_dpm_outcome_probability() {
        let mech = Mechanism::Dpm {
            pool: HashMap::from([("0".to_string(), 60.0), ("1".to_string(), 40.0)]),
            total_shares: HashMap::new(),
            total_bets: HashMap::new(),
        };
        assert!((mech.outcome_probability("0") - 0.6).abs() < 1e-12);
        assert!((mech.outcome_probability("1") - 0.4).abs() < 1e-12);
        assert_eq!(mech.outcome_probability("missing"), 0.0);
    }

    #[test]
    fn test_bet_is_open() {
        let mut bet: Bet = serde_json::from_value(json!({
            "id": "b1",
            "userId": "u1",
            "contractId": "c1",
            "amount": 10.0,
            "shares": 20.0,
            "outcome": "YES",
            "probBefore": 0.5,
            "probAfter": 0.55,
            "createdTime": 1
        }))
        .unwrap();
        assert!(bet.is_open());

        bet.is_sold = true;
        assert!(!bet.is_open());

        bet.is_sold = false;
        bet.sale = Some(SaleRecord { amount: 5.0, bet_id: "b0".into() });
        assert!(!bet.is_open());
    }

    #[test]
    fn test_is_closed() {
        let contract: Contract = serde_json::from_value(cpmm_contract()).unwrap();
        assert!(!contract.is_closed(999));
        assert!(!contract.is_closed(1000));
        assert!(contract.is_closed(1001));
    }

    #[test]
    fn test_user_defaults() {
        let user: User = serde_json::from_value(json!({
            "id": "u1",
            "name": "Ada",
            "balance": 1000.0
        }))
        .unwrap();
        assert_eq!(user.total_deposits, 0.0);
        assert_eq!(user.profit_cached, ProfitMetrics::default());
        assert_eq!(user.next_loan_cached, 0.0);
    }
}
