use thiserror::Error;
use ulid::Ulid;

use crate::model::{ReservationId, ReservationStatus, StationId};

/// Every way a transition or query can fail. All variants are meant to be
/// shown to the caller as-is.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("reservation not found: {0}")]
    NotFound(ReservationId),

    #[error("cannot {op} a reservation in status {from}")]
    InvalidTransition {
        from: ReservationStatus,
        op: &'static str,
    },

    #[error("vehicle unavailable: overlaps reservation {0}")]
    ResourceUnavailable(ReservationId),

    #[error("no free slot at station {0}")]
    StationUnavailable(StationId),

    #[error("contract not approved for reservation {0}")]
    ContractNotApproved(ReservationId),

    #[error("payment reference required for {0}")]
    PaymentRequired(&'static str),

    #[error("payment failed for reservation {id}: {detail}")]
    PaymentFailed { id: Ulid, detail: String },

    #[error("precondition check timed out: {0}")]
    PreconditionCheckTimedOut(String),

    #[error("invalid input: {0}")]
    Validation(&'static str),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// Failures where the same call may succeed later without any change
    /// to the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::PreconditionCheckTimedOut(_) | EngineError::Storage(_)
        )
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::ResourceUnavailable(_) => "resource_unavailable",
            EngineError::StationUnavailable(_) => "station_unavailable",
            EngineError::ContractNotApproved(_) => "contract_not_approved",
            EngineError::PaymentRequired(_) => "payment_required",
            EngineError::PaymentFailed { .. } => "payment_failed",
            EngineError::PreconditionCheckTimedOut(_) => "precondition_timeout",
            EngineError::Validation(_) => "validation",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Storage(_) => "storage",
        }
    }
}
