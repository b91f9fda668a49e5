//! Error taxonomy for the settlement engine.
//!
//! Four failure classes with distinct handling:
//! - [`ValidationError`]: bad request, surfaced synchronously, never retried
//! - conflict: transaction contention, retried by the store, surfaced only
//!   after the retry budget is exhausted
//! - partial failure: one user's credit or notification fails during a bulk
//!   phase; logged and aggregated, siblings proceed
//! - invariant violation: corrupted pool/share state, fatal for the operation

use serde::Serialize;
use thiserror::Error;

use crate::store::StoreError;

/// Request validation failures. Display strings are the user-visible
/// messages returned by the calling surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Not authorized")]
    NotAuthorized,
    #[error("Invalid contract")]
    InvalidContract,
    #[error("Invalid outcome")]
    InvalidOutcome,
    #[error("Invalid probability")]
    InvalidProbability,
    #[error("User not creator of contract")]
    NotCreator,
    #[error("Contract already resolved")]
    AlreadyResolved,
    #[error("Creator not found")]
    CreatorNotFound,
    #[error("User not found")]
    UserNotFound,
    #[error("Trading is closed")]
    TradingClosed,
    #[error("Invalid bet")]
    InvalidBet,
    #[error("Bet already sold")]
    BetAlreadySold,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// Optimistic transaction lost every retry attempt
    #[error("transaction aborted after {retries} conflict retries")]
    Conflict { retries: u32 },

    /// Pool/share accounting would be corrupted; the operation must abort
    /// without partial persistence.
    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Whether this error is a plain request-validation failure
    pub fn is_validation(&self) -> bool {
        matches!(self, EngineError::Validation(_))
    }
}

/// Wire-shaped result for the callable surfaces: `{"status":"success"}` or
/// `{"status":"error","message":...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ApiResult {
    Success,
    Error { message: String },
}

impl ApiResult {
    pub fn from_engine<T>(result: &Result<T, EngineError>) -> Self {
        match result {
            Ok(_) => ApiResult::Success,
            Err(e) => ApiResult::Error {
                message: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_messages_are_user_visible() {
        assert_eq!(ValidationError::BetAlreadySold.to_string(), "Bet already sold");
        assert_eq!(
            ValidationError::AlreadyResolved.to_string(),
            "Contract already resolved"
        );
        assert_eq!(ValidationError::TradingClosed.to_string(), "Trading is closed");
    }

    #[test]
    fn test_api_result_serialization() {
        let ok = serde_json::to_value(ApiResult::Success).unwrap();
        assert_eq!(ok["status"], "success");

        let err: Result<(), EngineError> =
            Err(EngineError::Validation(ValidationError::InvalidBet));
        let value = serde_json::to_value(ApiResult::from_engine(&err)).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["message"], "Invalid bet");
    }
}
