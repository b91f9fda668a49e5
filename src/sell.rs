//! Bet sale: liquidation of an open position before resolution.
//!
//! The calculator is pure and mechanism-polymorphic; the orchestrator wraps
//! it in one atomic transaction spanning the seller, the contract, the bet
//! being sold, the synthetic sale bet, and (when distinct) the creator.

use serde_json::json;
use tracing::info;

use crate::config::{round_to_cents, SALE_FEE};
use crate::error::{EngineError, ValidationError};
use crate::store::{Store, StoreError};
use crate::types::{Bet, Contract, CpmmPool, Mechanism, SaleRecord, User};

/// Result of the pure sale computation
#[derive(Debug, Clone)]
pub struct SaleInfo {
    /// Synthetic bet documenting the sale: negative amount and shares,
    /// referencing the liquidated bet. Historical bet amounts stay intact
    /// while volume and share accounting remain consistent.
    pub new_bet: Bet,
    /// Mechanism state after the shares return to the pool
    pub new_mechanism: Mechanism,
    /// Gross proceeds before the creator fee
    pub sale_value: f64,
    pub creator_fee: f64,
    /// Seller's balance after netting proceeds minus fee (unrounded;
    /// quantized to cents at the persistence boundary)
    pub new_balance: f64,
}

/// Compute the effect of selling a bet back to the market.
///
/// Preconditions (caller-enforced): contract not resolved, not closed, bet
/// not already sold. This function guards the numeric invariants only.
pub fn compute_sale(
    user: &User,
    bet: &Bet,
    contract: &Contract,
    new_bet_id: &str,
    now: i64,
) -> Result<SaleInfo, EngineError> {
    if bet.shares <= 0.0 {
        return Err(EngineError::Invariant(format!(
            "bet {} has non-positive shares {}",
            bet.id, bet.shares
        )));
    }

    let (sale_value, new_mechanism, prob_before, prob_after) = match &contract.mechanism {
        Mechanism::Cpmm { pool } => {
            let (value, new_pool) = cpmm_sale_value(pool, &bet.outcome, bet.shares)?;
            (
                value,
                Mechanism::Cpmm { pool: new_pool },
                pool.probability(),
                new_pool.probability(),
            )
        }
        Mechanism::Dpm { pool, total_shares, total_bets } => {
            let outstanding = total_shares.get(&bet.outcome).copied().unwrap_or(0.0);
            if bet.shares > outstanding + 1e-9 {
                return Err(EngineError::Invariant(format!(
                    "selling {} shares on {:?} but only {} outstanding",
                    bet.shares, bet.outcome, outstanding
                )));
            }
            let side = pool.get(&bet.outcome).copied().unwrap_or(0.0);
            let value = if outstanding > 0.0 { bet.shares / outstanding * side } else { 0.0 };
            if value > side + 1e-9 {
                return Err(EngineError::Invariant(format!(
                    "sale proceeds {} exceed the {:?} pool of {}",
                    value, bet.outcome, side
                )));
            }

            let mechanism_before = &contract.mechanism;
            let mut pool = pool.clone();
            let mut total_shares = total_shares.clone();
            let mut total_bets = total_bets.clone();
            pool.insert(bet.outcome.clone(), (side - value).max(0.0));
            total_shares.insert(bet.outcome.clone(), outstanding - bet.shares);
            let staked = total_bets.get(&bet.outcome).copied().unwrap_or(0.0);
            total_bets.insert(bet.outcome.clone(), (staked - bet.amount).max(0.0));

            let new_mechanism = Mechanism::Dpm { pool, total_shares, total_bets };
            let before = mechanism_before.outcome_probability(&bet.outcome);
            let after = new_mechanism.outcome_probability(&bet.outcome);
            (value, new_mechanism, before, after)
        }
    };

    let creator_fee = SALE_FEE * sale_value;
    let new_bet = Bet {
        id: new_bet_id.to_string(),
        user_id: bet.user_id.clone(),
        contract_id: bet.contract_id.clone(),
        amount: -sale_value,
        shares: -bet.shares,
        outcome: bet.outcome.clone(),
        prob_before,
        prob_after,
        created_time: now,
        is_sold: false,
        sale: Some(SaleRecord { amount: sale_value, bet_id: bet.id.clone() }),
        is_ante: false,
    };

    Ok(SaleInfo {
        new_bet,
        new_mechanism,
        sale_value,
        creator_fee,
        new_balance: user.balance + sale_value - creator_fee,
    })
}

/// Sell `s` shares back to a constant-product pool `(y, n)`.
///
/// The returned shares join the pool and the payout `m` burns equal amounts
/// of both sides (one currency unit = one YES + one NO share), holding
/// `y * n` invariant: for a YES sale, `(y + s - m)(n - m) = y * n`, giving
/// `m = ((y + n + s) - sqrt((y + n + s)^2 - 4sn)) / 2` (symmetric for NO).
fn cpmm_sale_value(
    pool: &CpmmPool,
    outcome: &str,
    shares: f64,
) -> Result<(f64, CpmmPool), EngineError> {
    let CpmmPool { yes: y, no: n } = *pool;
    if y <= 0.0 || n <= 0.0 {
        return Err(EngineError::Invariant(format!(
            "cpmm pool is drained: YES={y} NO={n}"
        )));
    }

    let s = shares;
    let sum = y + n + s;
    let opposite = match outcome {
        "YES" => n,
        "NO" => y,
        other => {
            return Err(EngineError::Invariant(format!(
                "unknown cpmm outcome {other:?}"
            )))
        }
    };
    let value = (sum - (sum * sum - 4.0 * s * opposite).sqrt()) / 2.0;

    let new_pool = match outcome {
        "YES" => CpmmPool { yes: y + s - value, no: n - value },
        _ => CpmmPool { yes: y - value, no: n + s - value },
    };

    if !(value.is_finite() && value >= 0.0) || new_pool.yes <= 0.0 || new_pool.no <= 0.0 {
        return Err(EngineError::Invariant(format!(
            "sale of {s} shares would drain the pool (YES={y} NO={n})"
        )));
    }

    Ok((value, new_pool))
}

// === Orchestrator ===

#[derive(Debug, Clone)]
pub struct SellRequest {
    pub contract_id: String,
    pub bet_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone)]
pub struct SaleSummary {
    pub new_bet_id: String,
    pub sale_value: f64,
    pub creator_fee: f64,
    pub new_balance: f64,
}

/// Sell an open bet in a single atomic transaction.
///
/// All touched documents are read and written within one transaction; a
/// concurrent modification to any of them aborts and is retried by the
/// store, so exactly one of two racing sales of the same bet can succeed.
pub fn sell_bet(store: &dyn Store, req: &SellRequest, now: i64) -> Result<SaleSummary, EngineError> {
    if req.user_id.is_empty() {
        return Err(ValidationError::NotAuthorized.into());
    }

    let new_bet_id = store.allocate_id("bets");
    let mut summary = None;

    store.transact(&mut |txn| {
        let user: User = txn
            .get("users", &req.user_id)?
            .ok_or(ValidationError::UserNotFound)?
            .parse()?;
        let contract: Contract = txn
            .get("contracts", &req.contract_id)?
            .ok_or(ValidationError::InvalidContract)?
            .parse()?;

        if contract.is_closed(now) {
            return Err(ValidationError::TradingClosed.into());
        }
        if contract.is_resolved || contract.resolution.is_some() {
            return Err(ValidationError::AlreadyResolved.into());
        }

        let bet: Bet = txn
            .get("bets", &req.bet_id)?
            .ok_or(ValidationError::InvalidBet)?
            .parse()?;
        if bet.contract_id != req.contract_id {
            return Err(ValidationError::InvalidBet.into());
        }
        if bet.user_id != req.user_id {
            return Err(ValidationError::NotAuthorized.into());
        }
        if bet.is_sold || bet.sale.is_some() {
            return Err(ValidationError::BetAlreadySold.into());
        }

        let sale = compute_sale(&user, &bet, &contract, &new_bet_id, now)?;

        if contract.creator_id == req.user_id {
            // Seller is the creator: proceeds and fee land on one balance
            txn.update(
                "users",
                &req.user_id,
                json!({"balance": round_to_cents(sale.new_balance + sale.creator_fee)}),
            )?;
        } else {
            if let Some(doc) = txn.get("users", &contract.creator_id)? {
                let creator: User = doc.parse()?;
                txn.update(
                    "users",
                    &contract.creator_id,
                    json!({"balance": round_to_cents(creator.balance + sale.creator_fee)}),
                )?;
            }
            txn.update(
                "users",
                &req.user_id,
                json!({"balance": round_to_cents(sale.new_balance)}),
            )?;
        }

        txn.update("bets", &req.bet_id, json!({"isSold": true}))?;
        txn.create(
            "bets",
            &new_bet_id,
            serde_json::to_value(&sale.new_bet).map_err(StoreError::from)?,
        )?;
        txn.update(
            "contracts",
            &req.contract_id,
            serde_json::to_value(&sale.new_mechanism).map_err(StoreError::from)?,
        )?;

        summary = Some(SaleSummary {
            new_bet_id: new_bet_id.clone(),
            sale_value: sale.sale_value,
            creator_fee: sale.creator_fee,
            new_balance: round_to_cents(sale.new_balance),
        });
        Ok(())
    })?;

    let summary = summary.ok_or_else(|| {
        EngineError::Invariant("sale transaction committed without a result".to_string())
    })?;

    info!(
        "[SELL] bet {} on {} sold for {:.2} (fee {:.2})",
        req.bet_id, req.contract_id, summary.sale_value, summary.creator_fee
    );
    Ok(summary)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cpmm_contract(yes: f64, no: f64) -> Contract {
        serde_json::from_value(serde_json::json!({
            "id": "c1",
            "creatorId": "creator",
            "question": "Test market",
            "outcomeType": "BINARY",
            "mechanism": "cpmm-1",
            "pool": { "YES": yes, "NO": no },
            "createdTime": 0
        }))
        .unwrap()
    }

    fn dpm_contract() -> Contract {
        Contract {
            outcome_type: crate::types::OutcomeType::FreeResponse,
            mechanism: Mechanism::Dpm {
                pool: HashMap::from([("0".to_string(), 100.0), ("1".to_string(), 50.0)]),
                total_shares: HashMap::from([("0".to_string(), 200.0), ("1".to_string(), 80.0)]),
                total_bets: HashMap::from([("0".to_string(), 100.0), ("1".to_string(), 50.0)]),
            },
            ..cpmm_contract(0.0, 0.0)
        }
    }

    fn user(balance: f64) -> User {
        User {
            id: "seller".to_string(),
            name: "Seller".to_string(),
            balance,
            total_deposits: 0.0,
            creator_volume_cached: 0.0,
            profit_cached: Default::default(),
            next_loan_cached: 0.0,
        }
    }

    fn open_bet(outcome: &str, amount: f64, shares: f64) -> Bet {
        Bet {
            id: "b1".to_string(),
            user_id: "seller".to_string(),
            contract_id: "c1".to_string(),
            amount,
            shares,
            outcome: outcome.to_string(),
            prob_before: 0.5,
            prob_after: 0.5,
            created_time: 1,
            is_sold: false,
            sale: None,
            is_ante: false,
        }
    }

    #[test]
    fn test_cpmm_sale_preserves_invariant() {
        let contract = cpmm_contract(100.0, 100.0);
        let bet = open_bet("YES", 5.0, 10.0);

        let sale = compute_sale(&user(0.0), &bet, &contract, "b2", 100).unwrap();
        let Mechanism::Cpmm { pool } = &sale.new_mechanism else {
            panic!("mechanism must stay cpmm");
        };

        // The fee comes out of the proceeds, not the pool, so the product
        // is preserved exactly up to floating-point error.
        assert!(
            (pool.invariant() - 100.0 * 100.0).abs() < 1e-6,
            "pool invariant drifted: {}",
            pool.invariant()
        );
    }

    #[test]
    fn test_cpmm_sale_value_near_market_price() {
        // 10 YES shares at p=0.5 are worth ~5, minus slippage
        let contract = cpmm_contract(100.0, 100.0);
        let bet = open_bet("YES", 5.0, 10.0);

        let sale = compute_sale(&user(0.0), &bet, &contract, "b2", 100).unwrap();
        assert!(sale.sale_value > 4.5 && sale.sale_value < 5.0, "got {}", sale.sale_value);
        assert!((sale.creator_fee - SALE_FEE * sale.sale_value).abs() < 1e-12);
    }

    #[test]
    fn test_cpmm_sale_moves_probability_down() {
        let contract = cpmm_contract(100.0, 100.0);
        let bet = open_bet("YES", 5.0, 10.0);

        let sale = compute_sale(&user(0.0), &bet, &contract, "b2", 100).unwrap();
        assert!(
            sale.new_bet.prob_after < sale.new_bet.prob_before,
            "selling YES must push the probability down"
        );
    }

    #[test]
    fn test_cpmm_no_sale_is_symmetric() {
        let yes_sale = compute_sale(
            &user(0.0),
            &open_bet("YES", 5.0, 10.0),
            &cpmm_contract(80.0, 120.0),
            "b2",
            100,
        )
        .unwrap();
        let no_sale = compute_sale(
            &user(0.0),
            &open_bet("NO", 5.0, 10.0),
            &cpmm_contract(120.0, 80.0),
            "b2",
            100,
        )
        .unwrap();
        assert!((yes_sale.sale_value - no_sale.sale_value).abs() < 1e-9);
    }

    #[test]
    fn test_synthetic_bet_shape() {
        let contract = cpmm_contract(100.0, 100.0);
        let bet = open_bet("YES", 5.0, 10.0);

        let sale = compute_sale(&user(20.0), &bet, &contract, "b2", 777).unwrap();
        let new_bet = &sale.new_bet;

        assert_eq!(new_bet.id, "b2");
        assert_eq!(new_bet.amount, -sale.sale_value);
        assert_eq!(new_bet.shares, -10.0);
        assert_eq!(new_bet.outcome, "YES");
        assert_eq!(new_bet.created_time, 777);
        assert!(!new_bet.is_sold);
        let record = new_bet.sale.as_ref().expect("sale record");
        assert_eq!(record.bet_id, "b1");
        assert_eq!(record.amount, sale.sale_value);
        // The synthetic bet is not open: it never participates in payouts
        assert!(!new_bet.is_open());
    }

    #[test]
    fn test_dpm_sale_is_proportional() {
        let contract = dpm_contract();
        // 50 of 200 outstanding shares on "0" -> a quarter of the 100 pool
        let bet = open_bet("0", 25.0, 50.0);

        let sale = compute_sale(&user(0.0), &bet, &contract, "b2", 100).unwrap();
        assert!((sale.sale_value - 25.0).abs() < 1e-9);

        let Mechanism::Dpm { pool, total_shares, total_bets } = &sale.new_mechanism else {
            panic!("mechanism must stay dpm");
        };
        assert!((pool["0"] - 75.0).abs() < 1e-9);
        assert!((total_shares["0"] - 150.0).abs() < 1e-9);
        assert!((total_bets["0"] - 75.0).abs() < 1e-9);
        // The other outcome is untouched
        assert_eq!(pool["1"], 50.0);
    }

    #[test]
    fn test_dpm_overselling_is_fatal() {
        let contract = dpm_contract();
        let bet = open_bet("0", 25.0, 500.0);

        let result = compute_sale(&user(0.0), &bet, &contract, "b2", 100);
        assert!(matches!(result, Err(EngineError::Invariant(_))));
    }

    #[test]
    fn test_drained_pool_is_fatal() {
        let contract = cpmm_contract(0.0, 100.0);
        let bet = open_bet("YES", 5.0, 10.0);

        let result = compute_sale(&user(0.0), &bet, &contract, "b2", 100);
        assert!(matches!(result, Err(EngineError::Invariant(_))));
    }

    #[test]
    fn test_non_positive_shares_is_fatal() {
        let contract = cpmm_contract(100.0, 100.0);
        let bet = open_bet("YES", 5.0, -1.0);

        let result = compute_sale(&user(0.0), &bet, &contract, "b2", 100);
        assert!(matches!(result, Err(EngineError::Invariant(_))));
    }
}
