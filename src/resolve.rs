//! Market resolution: validate the request, finalize the contract, compute
//! and disburse payouts, notify bettors.
//!
//! Deliberately not one large transaction. The resolution fields are a
//! single-document write; payout credits are then applied per user as
//! best-effort bulk work. A crash mid-sequence leaves the contract resolved
//! with incomplete payouts — an accepted weak point, bounded by the
//! `payoutsApplied` marker, which is set before the first credit so a
//! re-run can never double-pay.

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::json;
use tracing::{info, warn};

use crate::config::round_to_cents;
use crate::error::{EngineError, ValidationError};
use crate::notifications::{NotificationChannel, ResolutionNotification};
use crate::outcome::Outcome;
use crate::payouts::compute_payouts;
use crate::store::Store;
use crate::types::{Bet, Contract, Payout, User};

/// Raw resolution request as it arrives from the calling surface
#[derive(Debug, Clone)]
pub struct ResolutionRequest {
    pub contract_id: String,
    /// Acting user; must be the contract's creator
    pub user_id: String,
    pub outcome: String,
    /// Binary MKT probability as a percentage in [0, 100]
    pub probability_int: Option<f64>,
    /// Free-response MKT weights by answer id
    pub resolutions: Option<std::collections::HashMap<String, f64>>,
}

/// What a resolution actually did
#[derive(Debug, Clone)]
pub struct ResolutionSummary {
    pub contract_id: String,
    pub outcome: String,
    /// Per-user credits applied, rounded to cents
    pub payouts: Vec<Payout>,
    pub creator_payout: f64,
    /// Users whose balance credit failed: (user id, error). Siblings are
    /// unaffected; these are reported, not rolled back.
    pub failures: Vec<(String, String)>,
    /// Notifications enqueued (winners plus zero-payout notices)
    pub notified: usize,
}

/// Resolve a market and disburse payouts.
///
/// Validation failures surface before any write. After the resolution
/// fields commit, the contract counts as resolved even if later steps fail.
pub fn resolve_market(
    store: &dyn Store,
    notifications: &NotificationChannel,
    req: &ResolutionRequest,
    now: i64,
) -> Result<ResolutionSummary, EngineError> {
    if req.user_id.is_empty() {
        return Err(ValidationError::NotAuthorized.into());
    }

    let contract: Contract = store
        .get("contracts", &req.contract_id)?
        .ok_or(ValidationError::InvalidContract)?
        .parse()?;

    let outcome = Outcome::parse(
        contract.outcome_type,
        &req.outcome,
        req.probability_int,
        req.resolutions.as_ref(),
    )?;

    if contract.creator_id != req.user_id {
        return Err(ValidationError::NotCreator.into());
    }
    if contract.is_resolved || contract.resolution.is_some() {
        return Err(ValidationError::AlreadyResolved.into());
    }

    let creator: User = store
        .get("users", &contract.creator_id)?
        .ok_or(ValidationError::CreatorNotFound)?
        .parse()?;

    info!(
        "[RESOLVE] resolving {} to {} by {}",
        contract.id,
        outcome.key(),
        creator.id
    );

    // Finalize the contract first: a single-document write, deliberately
    // outside any larger transaction.
    let mut fields = serde_json::Map::new();
    fields.insert("isResolved".to_string(), json!(true));
    fields.insert("resolution".to_string(), json!(outcome.key()));
    fields.insert("resolutionTime".to_string(), json!(now));
    if let Outcome::Market(p) = &outcome {
        fields.insert("resolutionProbability".to_string(), json!(p));
    }
    if let Outcome::WeightedMarket(weights) = &outcome {
        fields.insert("resolutions".to_string(), json!(weights));
    }
    let contract_id = contract.id.clone();
    store.transact(&mut |txn| {
        txn.update("contracts", &contract_id, serde_json::Value::Object(fields.clone()))?;
        Ok(())
    })?;

    // Everything staked on this contract, partitioned into open vs settled
    let bets: Vec<Bet> = store
        .list("bets", None)?
        .iter()
        .filter_map(|doc| doc.parse::<Bet>().ok())
        .filter(|bet| bet.contract_id == contract.id)
        .collect();
    let open_bets: Vec<Bet> = bets.into_iter().filter(Bet::is_open).collect();

    let computed = compute_payouts(&outcome, &contract, &open_bets)?;

    // Group and sum by user; the creator fee rides on the creator's entry
    let mut user_payouts: FxHashMap<String, f64> = FxHashMap::default();
    for payout in &computed.bet_payouts {
        *user_payouts.entry(payout.user_id.clone()).or_insert(0.0) += payout.payout;
    }
    if computed.creator_payout > 0.0 {
        *user_payouts.entry(contract.creator_id.clone()).or_insert(0.0) +=
            computed.creator_payout;
    }

    // Idempotency guard: mark payouts as applied before the first credit.
    // If the marker is already set, a previous run got this far and
    // disbursing again would double-pay.
    let mut already_applied = false;
    store.transact(&mut |txn| {
        let fresh: Contract = txn
            .get("contracts", &contract_id)?
            .ok_or(ValidationError::InvalidContract)?
            .parse()?;
        if fresh.payouts_applied {
            already_applied = true;
            return Ok(());
        }
        txn.update("contracts", &contract_id, json!({"payoutsApplied": true}))?;
        Ok(())
    })?;

    if already_applied {
        warn!(
            "[RESOLVE] payouts already applied for {}, skipping disbursement",
            contract.id
        );
        return Ok(ResolutionSummary {
            contract_id: contract.id,
            outcome: outcome.key().to_string(),
            payouts: Vec::new(),
            creator_payout: computed.creator_payout,
            failures: Vec::new(),
            notified: 0,
        });
    }

    // Balance credits: one write per affected user, not transactional
    // across users. A failed credit is recorded and siblings proceed.
    let mut payouts = Vec::new();
    let mut failures = Vec::new();
    for (user_id, amount) in &user_payouts {
        let credit = round_to_cents(*amount);
        let result = store.transact(&mut |txn| {
            let user: User = txn
                .get("users", user_id)?
                .ok_or(ValidationError::UserNotFound)?
                .parse()?;
            txn.update(
                "users",
                user_id,
                json!({"balance": round_to_cents(user.balance + credit)}),
            )?;
            Ok(())
        });
        match result {
            Ok(()) => payouts.push(Payout { user_id: user_id.clone(), payout: credit }),
            Err(e) => {
                warn!("[RESOLVE] payout of {:.2} to {} failed: {}", credit, user_id, e);
                failures.push((user_id.clone(), e.to_string()));
            }
        }
    }

    // Winners get their payout; open bettors outside the payout set get a
    // zero-payout notice.
    let mut notified = 0;
    let mut notify = |user_id: &str, payout: f64| {
        let sent = notifications.send_resolution(ResolutionNotification {
            user_id: user_id.to_string(),
            payout,
            creator_name: creator.name.clone(),
            contract_id: contract.id.clone(),
            question: contract.question.clone(),
            outcome: outcome.key().to_string(),
            resolution_probability: match &outcome {
                Outcome::Market(p) => Some(*p),
                _ => None,
            },
            resolutions: match &outcome {
                Outcome::WeightedMarket(weights) => Some(weights.clone()),
                _ => None,
            },
        });
        if sent {
            notified += 1;
        }
    };

    for (user_id, amount) in &user_payouts {
        notify(user_id, round_to_cents(*amount));
    }
    let bettors: FxHashSet<&str> = open_bets.iter().map(|bet| bet.user_id.as_str()).collect();
    for user_id in bettors {
        if !user_payouts.contains_key(user_id) {
            notify(user_id, 0.0);
        }
    }

    info!(
        "[RESOLVE] {} resolved to {}: {} payouts applied, {} failed, {} notified",
        contract.id,
        outcome.key(),
        payouts.len(),
        failures.len(),
        notified
    );

    Ok(ResolutionSummary {
        contract_id: contract.id,
        outcome: outcome.key().to_string(),
        payouts,
        creator_payout: computed.creator_payout,
        failures,
        notified,
    })
}
