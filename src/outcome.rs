//! Resolution outcome parsing and validation.
//!
//! Raw resolution requests arrive as loosely-typed strings plus optional
//! probability / weight parameters. They are parsed exactly once, at the
//! orchestrator boundary, into the closed [`Outcome`] union; everything
//! downstream works with validated variants only.

use std::collections::HashMap;

use crate::error::ValidationError;
use crate::types::OutcomeType;

/// A validated resolution outcome
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Binary market resolved YES
    Yes,
    /// Binary market resolved NO
    No,
    /// Binary market resolved partially at a probability in [0, 1]
    Market(f64),
    /// Market voided; every bettor is refunded their stake
    Cancel,
    /// Free-response market resolved to a single answer
    Answer(String),
    /// Free-response market resolved across several answers with weights
    /// (normalized at payout time; they need not sum to 1)
    WeightedMarket(HashMap<String, f64>),
}

impl Outcome {
    /// Parse and validate a raw resolution request against the contract's
    /// outcome type. Binary `MKT` probability arrives as a percentage in
    /// [0, 100] and is converted to [0, 1] here.
    pub fn parse(
        outcome_type: OutcomeType,
        outcome: &str,
        probability_int: Option<f64>,
        resolutions: Option<&HashMap<String, f64>>,
    ) -> Result<Outcome, ValidationError> {
        if let Some(p) = probability_int {
            if !p.is_finite() || !(0.0..=100.0).contains(&p) {
                return Err(ValidationError::InvalidProbability);
            }
        }

        match outcome_type {
            OutcomeType::Binary => match outcome {
                "YES" => Ok(Outcome::Yes),
                "NO" => Ok(Outcome::No),
                "CANCEL" => Ok(Outcome::Cancel),
                "MKT" => {
                    let p = probability_int.ok_or(ValidationError::InvalidProbability)?;
                    Ok(Outcome::Market(p / 100.0))
                }
                _ => Err(ValidationError::InvalidOutcome),
            },
            OutcomeType::FreeResponse => match outcome {
                "CANCEL" => Ok(Outcome::Cancel),
                "MKT" => {
                    let weights = resolutions.ok_or(ValidationError::InvalidOutcome)?;
                    let sum: f64 = weights.values().sum();
                    let valid = !weights.is_empty()
                        && weights.values().all(|w| w.is_finite() && *w >= 0.0)
                        && sum > 0.0;
                    if !valid {
                        return Err(ValidationError::InvalidOutcome);
                    }
                    Ok(Outcome::WeightedMarket(weights.clone()))
                }
                _ if outcome.parse::<u64>().is_ok() => Ok(Outcome::Answer(outcome.to_string())),
                _ => Err(ValidationError::InvalidOutcome),
            },
        }
    }

    /// Outcome string persisted on the contract's resolution field
    pub fn key(&self) -> &str {
        match self {
            Outcome::Yes => "YES",
            Outcome::No => "NO",
            Outcome::Market(_) | Outcome::WeightedMarket(_) => "MKT",
            Outcome::Cancel => "CANCEL",
            Outcome::Answer(id) => id,
        }
    }
}
