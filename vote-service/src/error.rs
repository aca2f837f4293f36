use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::ledger::TxHash;

/// Why a voter may not cast this vote
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Ineligible {
    #[error("voter is not registered or not verified")]
    VoterNotVerified,

    #[error("voter has already voted in this election")]
    AlreadyVoted,

    #[error("election is not open for voting")]
    ElectionNotOpen,

    #[error("candidate is not eligible in this election")]
    CandidateIneligible,
}

impl Ineligible {
    pub fn code(&self) -> &'static str {
        match self {
            Ineligible::VoterNotVerified => "voter_not_verified",
            Ineligible::AlreadyVoted => "already_voted",
            Ineligible::ElectionNotOpen => "election_not_open",
            Ineligible::CandidateIneligible => "candidate_ineligible",
        }
    }
}

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error(transparent)]
    Ineligible(#[from] Ineligible),

    #[error("store error during validation: {0}")]
    Store(#[from] sqlx::Error),
}

#[derive(Error, Debug)]
pub enum CommitError {
    #[error(transparent)]
    Ineligible(#[from] Ineligible),

    /// The receipt was committed before. Replays land here.
    #[error("receipt {tx_hash} is already recorded")]
    DuplicateReceipt { tx_hash: TxHash },

    #[error("receipt {tx_hash} is not a successful transaction")]
    FailedReceipt { tx_hash: TxHash },

    #[error("failed to persist vote: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("commit did not finish within {0:?}")]
    Timeout(Duration),
}

/// Outcome of a failed `CastVote`
#[derive(Error, Debug)]
pub enum VoteError {
    #[error(transparent)]
    Ineligible(#[from] Ineligible),

    /// Permanent ledger failure. Retrying the same vote fails again.
    #[error("the ledger rejected the vote: {message}")]
    LedgerRejected {
        attempt_id: Uuid,
        tx_hash: Option<TxHash>,
        message: String,
    },

    #[error("the ledger is unavailable: {message}")]
    LedgerUnavailable { attempt_id: Uuid, message: String },

    /// The transaction may still land. The repair job resolves it.
    #[error("the vote is being processed, check back later")]
    Pending {
        attempt_id: Uuid,
        tx_hash: Option<TxHash>,
    },

    /// The ledger confirmed the vote but the local commit failed
    #[error("the vote was recorded on the ledger and is being processed, check back later")]
    ReconciliationFailed { attempt_id: Uuid, tx_hash: TxHash },

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ValidationError> for VoteError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::Ineligible(reason) => VoteError::Ineligible(reason),
            ValidationError::Store(e) => VoteError::Store(e),
        }
    }
}

impl VoteError {
    pub fn status(&self) -> StatusCode {
        match self {
            VoteError::Ineligible(Ineligible::AlreadyVoted) => StatusCode::CONFLICT,
            VoteError::Ineligible(_) => StatusCode::BAD_REQUEST,
            VoteError::LedgerRejected { .. } | VoteError::LedgerUnavailable { .. } => {
                StatusCode::BAD_GATEWAY
            }
            VoteError::Pending { .. } => StatusCode::GATEWAY_TIMEOUT,
            VoteError::ReconciliationFailed { .. }
            | VoteError::Store(_)
            | VoteError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            VoteError::Ineligible(reason) => reason.code(),
            VoteError::LedgerRejected { .. } => "ledger_rejected",
            VoteError::LedgerUnavailable { .. } => "ledger_unavailable",
            VoteError::Pending { .. } => "vote_pending",
            VoteError::ReconciliationFailed { .. } => "reconciliation_failed",
            VoteError::Store(_) => "store_error",
            VoteError::Internal(_) => "internal_error",
        }
    }

    pub fn attempt_id(&self) -> Option<Uuid> {
        match self {
            VoteError::LedgerRejected { attempt_id, .. }
            | VoteError::LedgerUnavailable { attempt_id, .. }
            | VoteError::Pending { attempt_id, .. }
            | VoteError::ReconciliationFailed { attempt_id, .. } => Some(*attempt_id),
            _ => None,
        }
    }

    pub fn tx_hash(&self) -> Option<TxHash> {
        match self {
            VoteError::LedgerRejected { tx_hash, .. } | VoteError::Pending { tx_hash, .. } => {
                *tx_hash
            }
            VoteError::ReconciliationFailed { tx_hash, .. } => Some(*tx_hash),
            _ => None,
        }
    }
}

/// JSON error body shared by every endpoint
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<TxHash>,
}

impl IntoResponse for VoteError {
    fn into_response(self) -> Response {
        // Store details stay in the logs
        let message = match &self {
            VoteError::Store(_) | VoteError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        };
        let body = ErrorBody {
            error: self.code(),
            message,
            attempt_id: self.attempt_id(),
            transaction_hash: self.tx_hash(),
        };
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let id = Uuid::new_v4();
        let hash = TxHash([1; 32]);
        assert_eq!(VoteError::from(Ineligible::AlreadyVoted).status(), StatusCode::CONFLICT);
        assert_eq!(VoteError::from(Ineligible::ElectionNotOpen).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            VoteError::LedgerUnavailable {
                attempt_id: id,
                message: "down".into()
            }
            .status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            VoteError::Pending {
                attempt_id: id,
                tx_hash: Some(hash)
            }
            .status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            VoteError::ReconciliationFailed {
                attempt_id: id,
                tx_hash: hash
            }
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn pending_message_asks_to_check_back() {
        let err = VoteError::Pending {
            attempt_id: Uuid::new_v4(),
            tx_hash: None,
        };
        assert!(err.to_string().contains("check back"));
        assert_eq!(err.code(), "vote_pending");
    }
}
