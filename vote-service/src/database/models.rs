use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::{Address, TxHash};

/// Registered voter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voter {
    pub id: String,
    pub wallet_address: String,
    pub is_verified: bool,
}

/// Lifecycle of an election relative to its voting window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElectionStatus {
    Upcoming,
    Active,
    Completed,
}

impl ElectionStatus {
    /// Status of the window `[start, end)` at `now`
    pub fn at(start: DateTime<Utc>, end: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        if now < start {
            ElectionStatus::Upcoming
        } else if now < end {
            ElectionStatus::Active
        } else {
            ElectionStatus::Completed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ElectionStatus::Upcoming => "upcoming",
            ElectionStatus::Active => "active",
            ElectionStatus::Completed => "completed",
        }
    }
}

impl FromStr for ElectionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upcoming" => Ok(ElectionStatus::Upcoming),
            "active" => Ok(ElectionStatus::Active),
            "completed" => Ok(ElectionStatus::Completed),
            other => Err(format!("unknown election status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Election {
    pub id: String,
    pub title: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// Last status written by the lifecycle jobs. Never trusted on its own.
    pub status: ElectionStatus,
    pub total_votes: i64,
}

impl Election {
    /// Status recomputed from the window at `now`. An election closed early
    /// by administration stays completed.
    pub fn status_at(&self, now: DateTime<Utc>) -> ElectionStatus {
        if self.status == ElectionStatus::Completed {
            return ElectionStatus::Completed;
        }
        ElectionStatus::at(self.start_date, self.end_date, now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub election_id: String,
    pub name: String,
    pub is_verified: bool,
    pub is_active: bool,
    pub vote_count: i64,
}

impl Candidate {
    pub fn is_eligible(&self) -> bool {
        self.is_verified && self.is_active
    }
}

/// Committed vote, created once per confirmed ledger transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub id: String,
    pub voter_id: String,
    pub candidate_id: String,
    pub election_id: String,
    pub tx_hash: TxHash,
    pub block_number: u64,
    pub gas_used: u64,
    pub cast_at: DateTime<Utc>,
    pub is_valid: bool,
}

/// Entry of a voter's voted-elections list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotedElection {
    pub voter_id: String,
    pub election_id: String,
    pub candidate_id: String,
    pub tx_hash: TxHash,
    pub voted_at: DateTime<Utc>,
}

/// State of a journaled vote attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptState {
    Validated,
    SubmittedToLedger,
    LedgerConfirmed,
    LedgerReverted,
    LedgerTimeout,
    Committed,
    ReconciliationFailed,
    SubmissionFailed,
    Orphaned,
    Expired,
}

impl AttemptState {
    pub const ALL: [AttemptState; 10] = [
        AttemptState::Validated,
        AttemptState::SubmittedToLedger,
        AttemptState::LedgerConfirmed,
        AttemptState::LedgerReverted,
        AttemptState::LedgerTimeout,
        AttemptState::Committed,
        AttemptState::ReconciliationFailed,
        AttemptState::SubmissionFailed,
        AttemptState::Orphaned,
        AttemptState::Expired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::Validated => "VALIDATED",
            AttemptState::SubmittedToLedger => "SUBMITTED_TO_LEDGER",
            AttemptState::LedgerConfirmed => "LEDGER_CONFIRMED",
            AttemptState::LedgerReverted => "LEDGER_REVERTED",
            AttemptState::LedgerTimeout => "LEDGER_TIMEOUT",
            AttemptState::Committed => "COMMITTED",
            AttemptState::ReconciliationFailed => "RECONCILIATION_FAILED",
            AttemptState::SubmissionFailed => "SUBMISSION_FAILED",
            AttemptState::Orphaned => "ORPHANED",
            AttemptState::Expired => "EXPIRED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptState::Committed
                | AttemptState::LedgerReverted
                | AttemptState::SubmissionFailed
                | AttemptState::Orphaned
                | AttemptState::Expired
        )
    }

    /// Covered by the one-per-voter-and-election index. Must match
    /// `idx_attempts_in_flight`.
    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, next: AttemptState) -> bool {
        use AttemptState::*;
        matches!(
            (self, next),
            (
                Validated,
                SubmittedToLedger
                    | SubmissionFailed
                    | LedgerTimeout
                    | ReconciliationFailed
                    | Expired
            )
                | (
                    SubmittedToLedger,
                    LedgerConfirmed | LedgerReverted | LedgerTimeout | Expired
                )
                | (
                    LedgerTimeout,
                    SubmittedToLedger
                        | LedgerConfirmed
                        | LedgerReverted
                        | ReconciliationFailed
                        | Expired
                )
                | (LedgerConfirmed, Committed | ReconciliationFailed | Orphaned)
                | (ReconciliationFailed, Committed | Orphaned)
        )
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        AttemptState::ALL
            .into_iter()
            .find(|state| state.as_str() == upper)
            .ok_or_else(|| format!("unknown attempt state '{}'", s))
    }
}

/// Journal row for one `CastVote` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteAttempt {
    pub id: Uuid,
    pub voter_id: String,
    pub candidate_id: String,
    pub election_id: String,
    pub voter_wallet: Address,
    pub state: AttemptState,
    pub tx_hash: Option<TxHash>,
    pub nonce: Option<u64>,
    /// Chain height observed before sending, start of the nonce scan
    pub from_block: Option<u64>,
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
    pub last_error: Option<String>,
    /// Admission time, also the time reference for the election window
    pub cast_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VoteAttempt {
    pub fn new(
        voter_id: &str,
        candidate_id: &str,
        election_id: &str,
        voter_wallet: Address,
        cast_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            voter_id: voter_id.to_string(),
            candidate_id: candidate_id.to_string(),
            election_id: election_id.to_string(),
            voter_wallet,
            state: AttemptState::Validated,
            tx_hash: None,
            nonce: None,
            from_block: None,
            block_number: None,
            gas_used: None,
            last_error: None,
            cast_at,
            updated_at: cast_at,
        }
    }
}

/// Counter that disagrees with the valid vote records behind it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterMismatch {
    pub id: String,
    pub counter: i64,
    pub actual: i64,
}
