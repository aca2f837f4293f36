//! Eligibility checks for a vote
//!
//! Read-only. The same [`check`] runs before submission on its own read
//! transaction and again inside the reconciliation writer's transaction.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, warn};

use crate::database::models::{Candidate, Election, ElectionStatus, VoteRecord, VotedElection, Voter};
use crate::error::{Ineligible, ValidationError};
use crate::ledger::Address;

/// The rows a successful validation read
#[derive(Debug, Clone)]
pub struct Eligibility {
    pub voter: Voter,
    pub wallet: Address,
    pub election: Election,
    pub candidate: Candidate,
}

/// Run the four checks in order, stopping at the first failure. `at` is the
/// time the election window is checked against.
pub async fn check(
    conn: &mut SqliteConnection,
    voter_id: &str,
    candidate_id: &str,
    election_id: &str,
    at: DateTime<Utc>,
) -> Result<Eligibility, ValidationError> {
    let voter = match Voter::get_by_id(conn, voter_id).await? {
        Some(voter) if voter.is_verified => voter,
        _ => return Err(Ineligible::VoterNotVerified.into()),
    };
    let wallet: Address = match voter.wallet_address.parse() {
        Ok(wallet) => wallet,
        Err(e) => {
            warn!("Voter {} has an unusable wallet address: {}", voter.id, e);
            return Err(Ineligible::VoterNotVerified.into());
        }
    };

    if VoteRecord::get_by_voter_election(conn, voter_id, election_id)
        .await?
        .is_some()
        || VotedElection::exists(conn, voter_id, election_id).await?
    {
        return Err(Ineligible::AlreadyVoted.into());
    }

    let election = match Election::get_by_id(conn, election_id).await? {
        Some(election) if election.status_at(at) == ElectionStatus::Active => election,
        _ => return Err(Ineligible::ElectionNotOpen.into()),
    };

    let candidate = match Candidate::get_by_id(conn, candidate_id).await? {
        Some(candidate) if candidate.is_eligible() && candidate.election_id == election_id => {
            candidate
        }
        _ => return Err(Ineligible::CandidateIneligible.into()),
    };

    Ok(Eligibility {
        voter,
        wallet,
        election,
        candidate,
    })
}

/// Pre-flight validation on a snapshot of the store
#[derive(Clone)]
pub struct EligibilityValidator {
    pool: SqlitePool,
}

impl EligibilityValidator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn validate(
        &self,
        voter_id: &str,
        candidate_id: &str,
        election_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Eligibility, ValidationError> {
        // One read transaction so all checks see the same snapshot
        let mut tx = self.pool.begin().await?;
        let result = check(&mut tx, voter_id, candidate_id, election_id, at).await;
        tx.rollback().await?;

        match &result {
            Ok(_) => debug!("Voter {} eligible in election {}", voter_id, election_id),
            Err(e) => debug!("Voter {} rejected in election {}: {}", voter_id, election_id, e),
        }
        result
    }
}
