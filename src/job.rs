//! Scheduled metrics batch job: load global state, recompute derived
//! metrics per contract and user, write results back in chunked batches.
//!
//! The job is read-then-recompute-then-overwrite each cycle: safe to run
//! alongside trading (it reads a snapshot and self-corrects next cycle) but
//! guarded by a run-lock so two instances never overlap. The group
//! leaderboard phase is isolated: its failure is logged and the rest of the
//! job still counts as a success.

use std::cmp::Reverse;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::{dry_run_enabled, MAX_BATCH_WRITES, PORTFOLIO_HISTORY_WINDOW_MS};
use crate::error::EngineError;
use crate::metrics::{
    calculate_creator_volume, calculate_new_portfolio, calculate_new_profit,
    calculate_prob_changes, compute_volume, did_portfolio_change, top_user_scores, LoanPolicy,
    Scoring,
};
use crate::store::{Filter, Store, WriteOp};
use crate::types::{
    Bet, Contract, Group, GroupContract, Leaderboard, Mechanism, PortfolioSnapshot, User,
};

/// Counters for one job run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsRunSummary {
    pub contracts_updated: usize,
    pub users_updated: usize,
    pub snapshots_written: usize,
    pub groups_updated: usize,
    /// True when another run held the lock and this one did nothing
    pub skipped: bool,
}

pub struct MetricsJob {
    store: Arc<dyn Store>,
    loans: Arc<dyn LoanPolicy>,
    scoring: Arc<dyn Scoring>,
    running: AtomicBool,
}

impl MetricsJob {
    pub fn new(store: Arc<dyn Store>, loans: Arc<dyn LoanPolicy>, scoring: Arc<dyn Scoring>) -> Self {
        Self {
            store,
            loans,
            scoring,
            running: AtomicBool::new(false),
        }
    }

    /// Run one metrics cycle at the given wall-clock time.
    pub fn run(&self, now: i64) -> Result<MetricsRunSummary, EngineError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("[METRICS] previous run still in progress, skipping this cycle");
            return Ok(MetricsRunSummary { skipped: true, ..Default::default() });
        }

        let result = self.run_locked(now);
        self.running.store(false, Ordering::SeqCst);
        result
    }

    fn run_locked(&self, now: i64) -> Result<MetricsRunSummary, EngineError> {
        let store = self.store.as_ref();

        let users: Vec<User> = load_collection(store, "users", None)?;
        let contracts: Vec<Contract> = load_collection(store, "contracts", None)?;
        let bets: Vec<Bet> = load_collection(store, "bets", None)?;
        let history_filter =
            Filter::gt("timestamp", (now - PORTFOLIO_HISTORY_WINDOW_MS) as f64);
        let portfolio_history: Vec<PortfolioSnapshot> =
            load_collection(store, "portfolios", Some(&history_filter))?;
        let groups: Vec<Group> = load_collection(store, "groups", None)?;
        let group_contracts: Vec<GroupContract> =
            load_collection(store, "group_contracts", None)?;

        info!(
            "[METRICS] loaded {} users, {} contracts, {} bets",
            users.len(),
            contracts.len(),
            bets.len()
        );

        let mut bets_by_contract: FxHashMap<&str, Vec<&Bet>> = FxHashMap::default();
        for bet in &bets {
            bets_by_contract.entry(bet.contract_id.as_str()).or_default().push(bet);
        }

        // Phase 1: per-contract volume windows and cpmm probability series
        let mut contract_ops = Vec::with_capacity(contracts.len());
        for contract in &contracts {
            let contract_bets =
                bets_by_contract.get(contract.id.as_str()).cloned().unwrap_or_default();
            let mut descending = contract_bets.clone();
            descending.sort_by_key(|bet| Reverse(bet.created_time));

            let mut fields = serde_json::Map::new();
            fields.insert("volume".to_string(), json!(compute_volume(&contract_bets, 0)));
            fields.insert(
                "volume24Hours".to_string(),
                json!(compute_volume(&contract_bets, now - crate::config::DAY_MS)),
            );
            fields.insert(
                "volume7Days".to_string(),
                json!(compute_volume(&contract_bets, now - 7 * crate::config::DAY_MS)),
            );
            if let Mechanism::Cpmm { .. } = contract.mechanism {
                let prob = descending
                    .first()
                    .map(|bet| bet.prob_after)
                    .unwrap_or_else(|| contract.mechanism.probability());
                fields.insert("prob".to_string(), json!(prob));
                fields.insert(
                    "probChanges".to_string(),
                    json!(calculate_prob_changes(&descending, now)),
                );
            }
            contract_ops.push(WriteOp::update(
                "contracts",
                &contract.id,
                serde_json::Value::Object(fields),
            ));
        }
        let contracts_updated = write_in_batches(store, contract_ops);
        info!("[METRICS] updated metrics for {} contracts", contracts_updated);

        // Phase 2: per-user portfolio, profit, loans
        let mut contracts_by_id: FxHashMap<String, &Contract> = FxHashMap::default();
        let mut contracts_by_user: FxHashMap<&str, Vec<&Contract>> = FxHashMap::default();
        for contract in &contracts {
            contracts_by_id.insert(contract.id.clone(), contract);
            contracts_by_user.entry(contract.creator_id.as_str()).or_default().push(contract);
        }
        let mut bets_by_user: FxHashMap<String, Vec<&Bet>> = FxHashMap::default();
        for bet in &bets {
            bets_by_user.entry(bet.user_id.clone()).or_default().push(bet);
        }
        let mut history_by_user: FxHashMap<&str, Vec<PortfolioSnapshot>> = FxHashMap::default();
        for snapshot in &portfolio_history {
            history_by_user
                .entry(snapshot.user_id.as_str())
                .or_default()
                .push(snapshot.clone());
        }
        for history in history_by_user.values_mut() {
            history.sort_by_key(|snapshot| snapshot.timestamp);
        }

        struct UserMetrics<'a> {
            user: &'a User,
            creator_volume: f64,
            portfolio: PortfolioSnapshot,
            profit: crate::types::ProfitMetrics,
            changed: bool,
        }

        let empty_history: Vec<PortfolioSnapshot> = Vec::new();
        let empty_bets: Vec<&Bet> = Vec::new();
        let user_metrics: Vec<UserMetrics> = users
            .iter()
            .map(|user| {
                let user_bets = bets_by_user.get(user.id.as_str()).unwrap_or(&empty_bets);
                let history =
                    history_by_user.get(user.id.as_str()).unwrap_or(&empty_history);
                let user_contracts =
                    contracts_by_user.get(user.id.as_str()).cloned().unwrap_or_default();

                let portfolio =
                    calculate_new_portfolio(user, &contracts_by_id, user_bets, now);
                let profit = calculate_new_profit(history, &portfolio, now);
                let changed = did_portfolio_change(history.last(), &portfolio);

                UserMetrics {
                    user,
                    creator_volume: calculate_creator_volume(&user_contracts),
                    portfolio,
                    profit,
                    changed,
                }
            })
            .collect();

        let portfolios_by_user: FxHashMap<String, PortfolioSnapshot> = user_metrics
            .iter()
            .map(|m| (m.user.id.clone(), m.portfolio.clone()))
            .collect();
        let loan_payouts =
            self.loans
                .compute_loans(&users, &contracts_by_id, &portfolios_by_user, &bets_by_user);
        let loans_by_user: FxHashMap<&str, f64> = loan_payouts
            .iter()
            .map(|payout| (payout.user_id.as_str(), payout.payout))
            .collect();

        let mut user_ops = Vec::with_capacity(user_metrics.len());
        let mut snapshot_ops = Vec::new();
        for m in &user_metrics {
            let next_loan = loans_by_user.get(m.user.id.as_str()).copied().unwrap_or(0.0);
            user_ops.push(WriteOp::update(
                "users",
                &m.user.id,
                json!({
                    "creatorVolumeCached": m.creator_volume,
                    "profitCached": m.profit,
                    "nextLoanCached": next_loan,
                }),
            ));
            if m.changed {
                snapshot_ops.push(WriteOp::set(
                    "portfolios",
                    &store.allocate_id("portfolios"),
                    json!(m.portfolio),
                ));
            }
        }
        let users_updated = write_in_batches(store, user_ops);
        let snapshots_written = write_in_batches(store, snapshot_ops);
        info!(
            "[METRICS] updated metrics for {} users ({} new snapshots)",
            users_updated, snapshots_written
        );

        // Phase 3: group leaderboards. Isolated on purpose: a failure here
        // is logged and must not abort the rest of the job.
        let groups_updated = match self.update_group_leaderboards(
            &groups,
            &group_contracts,
            &contracts_by_id,
            &bets_by_contract,
        ) {
            Ok(count) => count,
            Err(e) => {
                error!("[METRICS] error while updating group leaderboards: {}", e);
                0
            }
        };

        Ok(MetricsRunSummary {
            contracts_updated,
            users_updated,
            snapshots_written,
            groups_updated,
            skipped: false,
        })
    }

    fn update_group_leaderboards(
        &self,
        groups: &[Group],
        group_contracts: &[GroupContract],
        contracts_by_id: &FxHashMap<String, &Contract>,
        bets_by_contract: &FxHashMap<&str, Vec<&Bet>>,
    ) -> Result<usize, EngineError> {
        let mut ops = Vec::with_capacity(groups.len());
        for group in groups {
            let member_contracts: Vec<&Contract> = group_contracts
                .iter()
                .filter(|edge| edge.group_id == group.id)
                .filter_map(|edge| contracts_by_id.get(&edge.contract_id).copied())
                .collect();
            let bets: Vec<Vec<&Bet>> = member_contracts
                .iter()
                .map(|contract| {
                    bets_by_contract.get(contract.id.as_str()).cloned().unwrap_or_default()
                })
                .collect();

            let creator_scores = self.scoring.score_creators(&member_contracts);
            let trader_scores = self.scoring.score_traders(&member_contracts, &bets);
            let leaderboard = Leaderboard {
                top_traders: top_user_scores(&trader_scores),
                top_creators: top_user_scores(&creator_scores),
            };

            ops.push(WriteOp::update(
                "groups",
                &group.id,
                json!({ "cachedLeaderboard": leaderboard }),
            ));
        }
        Ok(write_in_batches(self.store.as_ref(), ops))
    }
}

/// Load and decode a whole collection, skipping malformed documents with a
/// warning rather than failing the run.
pub fn load_collection<T: DeserializeOwned>(
    store: &dyn Store,
    collection: &str,
    filter: Option<&Filter>,
) -> Result<Vec<T>, EngineError> {
    let docs = store.list(collection, filter)?;
    let mut entities = Vec::with_capacity(docs.len());
    for doc in docs {
        match doc.parse::<T>() {
            Ok(entity) => entities.push(entity),
            Err(e) => warn!("[METRICS] skipping malformed {}/{}: {}", collection, doc.id, e),
        }
    }
    Ok(entities)
}

/// Apply writes in chunks of `MAX_BATCH_WRITES`. A failed chunk is logged
/// and the remaining chunks still run; returns the applied count.
pub fn write_in_batches(store: &dyn Store, ops: Vec<WriteOp>) -> usize {
    if dry_run_enabled() {
        info!("[METRICS] DRY RUN - would write {} ops", ops.len());
        return ops.len();
    }

    let mut applied = 0;
    for chunk in ops.chunks(MAX_BATCH_WRITES) {
        match store.batch_write(chunk) {
            Ok(count) => applied += count,
            Err(e) => error!("[METRICS] batch of {} writes failed: {}", chunk.len(), e),
        }
    }
    applied
}
