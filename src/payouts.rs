//! Payout calculation for resolved markets.
//!
//! Pure functions: given a validated outcome and the open bets on a
//! contract, compute per-bet payout amounts. No I/O, no rounding — amounts
//! are quantized to cents at the persistence boundary, not here.

use crate::config::CREATOR_FEE;
use crate::error::EngineError;
use crate::outcome::Outcome;
use crate::types::{Bet, Contract, OutcomeType, Payout};

/// Computed payouts for one resolution.
///
/// `bet_payouts` holds winning entries only (zero payouts are omitted; the
/// orchestrator derives non-winners by set difference for zero-payout
/// notifications). The creator fee is a side channel on top of the bettor
/// pool and is merged with the creator's own bettor payout by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionPayouts {
    pub bet_payouts: Vec<Payout>,
    pub creator_payout: f64,
}

/// Compute per-bet payouts for a resolution outcome.
///
/// A market with zero open bets produces an empty payout list; that is a
/// valid resolution, not an error.
pub fn compute_payouts(
    outcome: &Outcome,
    contract: &Contract,
    open_bets: &[Bet],
) -> Result<ResolutionPayouts, EngineError> {
    let bet_payouts = match (contract.outcome_type, outcome) {
        (OutcomeType::Binary, Outcome::Yes) => share_payouts(open_bets, "YES"),
        (OutcomeType::Binary, Outcome::No) => share_payouts(open_bets, "NO"),
        (OutcomeType::Binary, Outcome::Market(p)) => market_payouts(open_bets, *p),
        (OutcomeType::FreeResponse, Outcome::Answer(id)) => share_payouts(open_bets, id),
        (OutcomeType::FreeResponse, Outcome::WeightedMarket(weights)) => {
            weighted_payouts(open_bets, weights)?
        }
        (_, Outcome::Cancel) => refund_payouts(open_bets),
        (ty, o) => {
            return Err(EngineError::Invariant(format!(
                "outcome {o:?} is not valid for {ty:?} contracts"
            )))
        }
    };

    // Creator fee rides on top of the bettor pool; a voided market refunds
    // exactly, so no fee is charged on CANCEL.
    let creator_payout = match outcome {
        Outcome::Cancel => 0.0,
        _ => {
            let total: f64 = bet_payouts.iter().map(|p| p.payout).sum();
            CREATOR_FEE * total
        }
    };

    Ok(ResolutionPayouts { bet_payouts, creator_payout })
}

/// All-or-nothing resolution: a bet's shares pay out 1:1 when its chosen
/// outcome won. Principal is already reflected in share pricing, so there
/// is no separate stake return.
fn share_payouts(bets: &[Bet], winning: &str) -> Vec<Payout> {
    bets.iter()
        .filter(|bet| bet.outcome == winning && bet.shares > 0.0)
        .map(|bet| Payout { user_id: bet.user_id.clone(), payout: bet.shares })
        .collect()
}

/// Partial binary resolution at probability `p`: a linear blend,
/// `p * yesShares + (1 - p) * noShares` per bet. At p=1 this degenerates to
/// the YES case, at p=0 to the NO case.
fn market_payouts(bets: &[Bet], p: f64) -> Vec<Payout> {
    bets.iter()
        .filter_map(|bet| {
            let weight = match bet.outcome.as_str() {
                "YES" => p,
                "NO" => 1.0 - p,
                _ => 0.0,
            };
            let payout = weight * bet.shares;
            (payout > 0.0).then(|| Payout { user_id: bet.user_id.clone(), payout })
        })
        .collect()
}

/// Multi-outcome partial resolution: weights are normalized to sum to 1,
/// then each bet receives its outcome's weight share of its shares.
fn weighted_payouts(
    bets: &[Bet],
    weights: &std::collections::HashMap<String, f64>,
) -> Result<Vec<Payout>, EngineError> {
    let total_weight: f64 = weights.values().sum();
    if !(total_weight > 0.0) {
        return Err(EngineError::Invariant(
            "resolution weights must sum to a positive value".to_string(),
        ));
    }

    Ok(bets
        .iter()
        .filter_map(|bet| {
            let weight = weights.get(&bet.outcome).copied().unwrap_or(0.0) / total_weight;
            let payout = weight * bet.shares;
            (payout > 0.0).then(|| Payout { user_id: bet.user_id.clone(), payout })
        })
        .collect())
}

/// Voided market: every bettor receives exactly their original stake back,
/// regardless of chosen outcome.
fn refund_payouts(bets: &[Bet]) -> Vec<Payout> {
    bets.iter()
        .filter(|bet| bet.amount != 0.0)
        .map(|bet| Payout { user_id: bet.user_id.clone(), payout: bet.amount })
        .collect()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Mechanism;
    use std::collections::HashMap;

    fn binary_contract() -> Contract {
        serde_json::from_value(serde_json::json!({
            "id": "c1",
            "creatorId": "creator",
            "question": "Test market",
            "outcomeType": "BINARY",
            "mechanism": "cpmm-1",
            "pool": { "YES": 100.0, "NO": 100.0 },
            "createdTime": 0
        }))
        .unwrap()
    }

    fn free_response_contract() -> Contract {
        Contract {
            outcome_type: OutcomeType::FreeResponse,
            mechanism: Mechanism::Dpm {
                pool: HashMap::new(),
                total_shares: HashMap::new(),
                total_bets: HashMap::new(),
            },
            ..binary_contract()
        }
    }

    fn bet(user: &str, outcome: &str, amount: f64, shares: f64) -> Bet {
        Bet {
            id: format!("bet-{user}-{outcome}"),
            user_id: user.to_string(),
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

    fn payout_of(payouts: &ResolutionPayouts, user: &str) -> f64 {
        payouts
            .bet_payouts
            .iter()
            .filter(|p| p.user_id == user)
            .map(|p| p.payout)
            .sum()
    }

    #[test]
    fn test_binary_yes_pays_winning_shares() {
        // A: 10 YES shares, B: 5 NO shares, resolved YES -> {A: 10, B: 0}
        let contract = binary_contract();
        let bets = [bet("a", "YES", 8.0, 10.0), bet("b", "NO", 4.0, 5.0)];

        let payouts = compute_payouts(&Outcome::Yes, &contract, &bets).unwrap();

        assert_eq!(payout_of(&payouts, "a"), 10.0);
        assert_eq!(payout_of(&payouts, "b"), 0.0);
        // Losing-side bets are omitted entirely
        assert_eq!(payouts.bet_payouts.len(), 1);
    }

    #[test]
    fn test_binary_sum_equals_winning_shares() {
        let contract = binary_contract();
        let bets = [
            bet("a", "YES", 8.0, 10.0),
            bet("b", "YES", 3.0, 4.0),
            bet("c", "NO", 4.0, 5.0),
        ];

        let payouts = compute_payouts(&Outcome::Yes, &contract, &bets).unwrap();
        let total: f64 = payouts.bet_payouts.iter().map(|p| p.payout).sum();
        assert_eq!(total, 14.0, "sum of payouts must equal winning-side shares");
    }

    #[test]
    fn test_binary_mkt_blend() {
        // Resolved MKT at p=0.7 -> {A: 7.0, B: 1.5}
        let contract = binary_contract();
        let bets = [bet("a", "YES", 8.0, 10.0), bet("b", "NO", 4.0, 5.0)];

        let payouts = compute_payouts(&Outcome::Market(0.7), &contract, &bets).unwrap();

        assert!((payout_of(&payouts, "a") - 7.0).abs() < 1e-12);
        assert!((payout_of(&payouts, "b") - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_binary_mkt_continuity_at_extremes() {
        let contract = binary_contract();
        let bets = [bet("a", "YES", 8.0, 10.0), bet("b", "NO", 4.0, 5.0)];

        // p=1 degenerates to the YES case
        let at_one = compute_payouts(&Outcome::Market(1.0), &contract, &bets).unwrap();
        let yes = compute_payouts(&Outcome::Yes, &contract, &bets).unwrap();
        assert_eq!(at_one.bet_payouts, yes.bet_payouts);

        // p=0 degenerates to the NO case
        let at_zero = compute_payouts(&Outcome::Market(0.0), &contract, &bets).unwrap();
        let no = compute_payouts(&Outcome::No, &contract, &bets).unwrap();
        assert_eq!(at_zero.bet_payouts, no.bet_payouts);
    }

    #[test]
    fn test_cancel_refunds_stakes_exactly() {
        // Original stakes {A: 8, B: 4} -> payouts {A: 8, B: 4}
        let contract = binary_contract();
        let bets = [bet("a", "YES", 8.0, 10.0), bet("b", "NO", 4.0, 5.0)];

        let payouts = compute_payouts(&Outcome::Cancel, &contract, &bets).unwrap();

        assert_eq!(payout_of(&payouts, "a"), 8.0);
        assert_eq!(payout_of(&payouts, "b"), 4.0);

        let total: f64 = payouts.bet_payouts.iter().map(|p| p.payout).sum();
        let stakes: f64 = bets.iter().map(|b| b.amount).sum();
        assert_eq!(total, stakes, "refund must equal sum of original stakes");
        assert_eq!(payouts.creator_payout, 0.0, "no creator fee on CANCEL");
    }

    #[test]
    fn test_free_response_single_answer() {
        let contract = free_response_contract();
        let bets = [bet("a", "0", 8.0, 10.0), bet("b", "2", 4.0, 5.0)];

        let payouts =
            compute_payouts(&Outcome::Answer("2".into()), &contract, &bets).unwrap();

        assert_eq!(payout_of(&payouts, "a"), 0.0);
        assert_eq!(payout_of(&payouts, "b"), 5.0);
    }

    #[test]
    fn test_weighted_mkt_normalizes_weights() {
        let contract = free_response_contract();
        let bets = [bet("a", "0", 8.0, 10.0), bet("b", "1", 4.0, 6.0)];

        // Weights 3:1 need not sum to 1; they normalize to 0.75 / 0.25
        let weights = HashMap::from([("0".to_string(), 3.0), ("1".to_string(), 1.0)]);
        let payouts =
            compute_payouts(&Outcome::WeightedMarket(weights), &contract, &bets).unwrap();

        assert!((payout_of(&payouts, "a") - 7.5).abs() < 1e-12);
        assert!((payout_of(&payouts, "b") - 1.5).abs() < 1e-12);

        // Sum equals the weight-blended share totals
        let total: f64 = payouts.bet_payouts.iter().map(|p| p.payout).sum();
        assert!((total - (0.75 * 10.0 + 0.25 * 6.0)).abs() < 1e-12);
    }

    #[test]
    fn test_weighted_mkt_unlisted_outcomes_get_nothing() {
        let contract = free_response_contract();
        let bets = [bet("a", "0", 8.0, 10.0), bet("b", "5", 4.0, 6.0)];

        let weights = HashMap::from([("0".to_string(), 1.0)]);
        let payouts =
            compute_payouts(&Outcome::WeightedMarket(weights), &contract, &bets).unwrap();

        assert_eq!(payout_of(&payouts, "a"), 10.0);
        assert_eq!(payout_of(&payouts, "b"), 0.0);
    }

    #[test]
    fn test_creator_fee_is_fraction_of_pool() {
        let contract = binary_contract();
        let bets = [bet("a", "YES", 8.0, 10.0)];

        let payouts = compute_payouts(&Outcome::Yes, &contract, &bets).unwrap();
        assert!((payouts.creator_payout - CREATOR_FEE * 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_market_is_valid() {
        let contract = binary_contract();
        let payouts = compute_payouts(&Outcome::Yes, &contract, &[]).unwrap();
        assert!(payouts.bet_payouts.is_empty());
        assert_eq!(payouts.creator_payout, 0.0);
    }

    #[test]
    fn test_mismatched_outcome_type_is_fatal() {
        let contract = binary_contract();
        let result = compute_payouts(&Outcome::Answer("1".into()), &contract, &[]);
        assert!(matches!(result, Err(EngineError::Invariant(_))));
    }
}
