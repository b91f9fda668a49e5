//! Derived metric computation: contract volume and probability series,
//! per-user portfolio/profit aggregates, and leaderboard scoring.
//!
//! Everything here is pure; the batch job in `job` loads the snapshots,
//! calls these functions per entity, and writes the results back in bulk.

use rustc_hash::FxHashMap;

use crate::config::{DAY_MS, LEADERBOARD_SIZE};
use crate::types::{
    Bet, Contract, Mechanism, Payout, PortfolioSnapshot, ProbChanges, ProfitMetrics, User,
    UserScore,
};

/// Sum of traded magnitude in the trailing window `(since, now]`.
/// Sale settlements carry negative amounts; volume counts magnitude.
/// Ante bets seed liquidity and do not count as trading.
pub fn compute_volume(bets: &[&Bet], since: i64) -> f64 {
    bets.iter()
        .filter(|bet| bet.created_time > since && !bet.is_ante)
        .map(|bet| bet.amount.abs())
        .sum()
}

/// Probability deltas over the trailing day/week/month.
///
/// `descending` must be sorted by `created_time`, newest first. Each delta
/// is current probability minus the last traded probability before the
/// cutoff; a window with no prior trade contributes zero.
pub fn calculate_prob_changes(descending: &[&Bet], now: i64) -> ProbChanges {
    let Some(latest) = descending.first() else {
        return ProbChanges::default();
    };
    let current = latest.prob_after;

    let change_since = |window: i64| {
        let cutoff = now - window;
        descending
            .iter()
            .find(|bet| bet.created_time < cutoff)
            .map(|bet| current - bet.prob_after)
            .unwrap_or(0.0)
    };

    ProbChanges {
        day: change_since(DAY_MS),
        week: change_since(7 * DAY_MS),
        month: change_since(30 * DAY_MS),
    }
}

/// Total traded volume across the markets a user created
pub fn calculate_creator_volume(contracts: &[&Contract]) -> f64 {
    contracts.iter().map(|contract| contract.volume).sum()
}

/// Current value of one open position at pool-implied prices.
/// Resolved or missing contracts contribute nothing: their payouts are
/// already realized in the balance.
fn bet_value(bet: &Bet, contract: Option<&Contract>) -> f64 {
    let Some(contract) = contract else { return 0.0 };
    if contract.is_resolved || contract.resolution.is_some() {
        return 0.0;
    }
    match &contract.mechanism {
        Mechanism::Cpmm { .. } => {
            contract.mechanism.outcome_probability(&bet.outcome) * bet.shares
        }
        Mechanism::Dpm { pool, total_shares, .. } => {
            let outstanding = total_shares.get(&bet.outcome).copied().unwrap_or(0.0);
            if outstanding <= 0.0 {
                return 0.0;
            }
            bet.shares / outstanding * pool.get(&bet.outcome).copied().unwrap_or(0.0)
        }
    }
}

/// Fresh portfolio snapshot: balance, open-bet value, and deposits
pub fn calculate_new_portfolio(
    user: &User,
    contracts_by_id: &FxHashMap<String, &Contract>,
    bets: &[&Bet],
    now: i64,
) -> PortfolioSnapshot {
    let investment_value = bets
        .iter()
        .filter(|bet| bet.is_open())
        .map(|&bet| bet_value(bet, contracts_by_id.get(&bet.contract_id).copied()))
        .sum();

    PortfolioSnapshot {
        user_id: user.id.clone(),
        balance: user.balance,
        investment_value,
        total_deposits: user.total_deposits,
        timestamp: now,
    }
}

/// A snapshot is persisted only when one of its values moved; this keeps the
/// portfolio time series append-only but sparse.
pub fn did_portfolio_change(last: Option<&PortfolioSnapshot>, new: &PortfolioSnapshot) -> bool {
    match last {
        None => true,
        Some(last) => {
            last.balance != new.balance
                || last.total_deposits != new.total_deposits
                || last.investment_value != new.investment_value
        }
    }
}

/// Profit deltas against the portfolio history.
///
/// Portfolio value is `balance + investment - deposits`; each window's delta
/// compares the current value against the last snapshot at or before the
/// cutoff (falling back to the earliest snapshot for young accounts).
/// `history` must be sorted by timestamp ascending.
pub fn calculate_new_profit(
    history: &[PortfolioSnapshot],
    current: &PortfolioSnapshot,
    now: i64,
) -> ProfitMetrics {
    fn value(snapshot: &PortfolioSnapshot) -> f64 {
        snapshot.balance + snapshot.investment_value - snapshot.total_deposits
    }

    let all_time = value(current);
    let delta_since = |window: i64| {
        let cutoff = now - window;
        let baseline = history
            .iter()
            .rev()
            .find(|snapshot| snapshot.timestamp <= cutoff)
            .or_else(|| history.first());
        baseline.map(|b| all_time - value(b)).unwrap_or(0.0)
    };

    ProfitMetrics {
        daily: delta_since(DAY_MS),
        weekly: delta_since(7 * DAY_MS),
        monthly: delta_since(30 * DAY_MS),
        all_time,
    }
}

/// Top leaderboard entries: score descending, capped at `LEADERBOARD_SIZE`.
/// Ties break deterministically on user id.
pub fn top_user_scores(scores: &FxHashMap<String, f64>) -> Vec<UserScore> {
    let mut entries: Vec<UserScore> = scores
        .iter()
        .map(|(user_id, score)| UserScore { user_id: user_id.clone(), score: *score })
        .collect();
    entries.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    entries.truncate(LEADERBOARD_SIZE);
    entries
}

// === Collaborators ===

/// Opaque lending policy: maps global state to interest-free loan credits
/// for active traders. The engine merges its output into the per-user
/// update; the policy itself is a deployment concern.
pub trait LoanPolicy: Send + Sync {
    fn compute_loans(
        &self,
        users: &[User],
        contracts_by_id: &FxHashMap<String, &Contract>,
        portfolios: &FxHashMap<String, PortfolioSnapshot>,
        bets_by_user: &FxHashMap<String, Vec<&Bet>>,
    ) -> Vec<Payout>;
}

/// Lending disabled
pub struct NoLoans;

impl LoanPolicy for NoLoans {
    fn compute_loans(
        &self,
        _users: &[User],
        _contracts_by_id: &FxHashMap<String, &Contract>,
        _portfolios: &FxHashMap<String, PortfolioSnapshot>,
        _bets_by_user: &FxHashMap<String, Vec<&Bet>>,
    ) -> Vec<Payout> {
        Vec::new()
    }
}

/// Opaque ranking policies for group leaderboards
pub trait Scoring: Send + Sync {
    /// Score market creators across a set of contracts
    fn score_creators(&self, contracts: &[&Contract]) -> FxHashMap<String, f64>;
    /// Score traders across a set of contracts; `bets_by_contract` is
    /// parallel to `contracts`.
    fn score_traders(
        &self,
        contracts: &[&Contract],
        bets_by_contract: &[Vec<&Bet>],
    ) -> FxHashMap<String, f64>;
}

/// Default ranking: creators by the volume their markets attracted, traders
/// by the magnitude they traded.
pub struct VolumeScoring;

impl Scoring for VolumeScoring {
    fn score_creators(&self, contracts: &[&Contract]) -> FxHashMap<String, f64> {
        let mut scores = FxHashMap::default();
        for contract in contracts {
            *scores.entry(contract.creator_id.clone()).or_insert(0.0) += contract.volume;
        }
        scores
    }

    fn score_traders(
        &self,
        _contracts: &[&Contract],
        bets_by_contract: &[Vec<&Bet>],
    ) -> FxHashMap<String, f64> {
        let mut scores = FxHashMap::default();
        for bets in bets_by_contract {
            for bet in bets {
                if !bet.is_ante {
                    *scores.entry(bet.user_id.clone()).or_insert(0.0) += bet.amount.abs();
                }
            }
        }
        scores
    }
}

// =============================================================================
// TESTS
// =============================================================================
