//! Reconciliation writer
//!
//! Turns a confirmed ledger receipt into local records inside one SQLite
//! transaction. The transaction hash is the idempotency key: committing the
//! same receipt twice yields [`CommitError::DuplicateReceipt`] and changes
//! nothing.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::database::models::{AttemptState, Candidate, Election, VoteAttempt, VoteRecord, VotedElection};
use crate::database::operations::AttemptUpdate;
use crate::database::{is_busy, unique_violation, UniqueViolation};
use crate::eligibility;
use crate::error::{CommitError, Ineligible, ValidationError};
use crate::ledger::{LedgerReceipt, TxHash};

/// Whole-transaction attempts when SQLite reports lock contention
const MAX_COMMIT_ATTEMPTS: u32 = 5;
const BUSY_BACKOFF: Duration = Duration::from_millis(25);

/// Journal entry a commit settles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptRef {
    pub id: Uuid,
    /// State the attempt must still be in
    pub state: AttemptState,
}

#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub voter_id: String,
    pub candidate_id: String,
    pub election_id: String,
    pub receipt: LedgerReceipt,
    /// When the vote was admitted. Stored on the record and used for the
    /// election window check.
    pub cast_at: DateTime<Utc>,
    pub attempt: Option<AttemptRef>,
}

impl CommitRequest {
    pub fn for_attempt(attempt: &VoteAttempt, receipt: LedgerReceipt) -> Self {
        Self {
            voter_id: attempt.voter_id.clone(),
            candidate_id: attempt.candidate_id.clone(),
            election_id: attempt.election_id.clone(),
            receipt,
            cast_at: attempt.cast_at,
            attempt: Some(AttemptRef {
                id: attempt.id,
                state: attempt.state,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    Invalidated(VoteRecord),
    AlreadyInvalid(VoteRecord),
    NotFound,
}

fn insert_error(tx_hash: TxHash) -> impl Fn(sqlx::Error) -> CommitError {
    move |err| match unique_violation(&err) {
        Some(UniqueViolation::TxHash) => CommitError::DuplicateReceipt { tx_hash },
        Some(UniqueViolation::VoterElection) => CommitError::Ineligible(Ineligible::AlreadyVoted),
        _ => CommitError::Persistence(err),
    }
}

#[derive(Clone)]
pub struct ReconciliationWriter {
    pool: SqlitePool,
}

impl ReconciliationWriter {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Commit the vote described by `request`. Lock contention retries the
    /// whole transaction, re-validation included.
    pub async fn commit(&self, request: &CommitRequest) -> Result<VoteRecord, CommitError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_commit(request).await {
                Err(CommitError::Persistence(e)) if is_busy(&e) && attempt < MAX_COMMIT_ATTEMPTS => {
                    warn!(
                        "Commit of {} hit a locked database (attempt {}/{}): {}",
                        request.receipt.transaction_hash, attempt, MAX_COMMIT_ATTEMPTS, e
                    );
                    sleep(BUSY_BACKOFF * attempt).await;
                }
                result => return result,
            }
        }
    }

    async fn try_commit(&self, request: &CommitRequest) -> Result<VoteRecord, CommitError> {
        let receipt = request.receipt;
        let tx_hash = receipt.transaction_hash;
        if !receipt.success {
            return Err(CommitError::FailedReceipt { tx_hash });
        }

        // Dropping `tx` on any early return rolls everything back
        let mut tx = self.pool.begin().await?;

        if VoteRecord::get_by_tx_hash(&mut tx, &tx_hash).await?.is_some() {
            debug!("Receipt {} already committed", tx_hash);
            return Err(CommitError::DuplicateReceipt { tx_hash });
        }

        eligibility::check(
            &mut tx,
            &request.voter_id,
            &request.candidate_id,
            &request.election_id,
            request.cast_at,
        )
        .await
        .map_err(|e| match e {
            ValidationError::Ineligible(reason) => CommitError::Ineligible(reason),
            ValidationError::Store(e) => CommitError::Persistence(e),
        })?;

        let record = VoteRecord {
            id: Uuid::new_v4().to_string(),
            voter_id: request.voter_id.clone(),
            candidate_id: request.candidate_id.clone(),
            election_id: request.election_id.clone(),
            tx_hash,
            block_number: receipt.block_number,
            gas_used: receipt.gas_used,
            cast_at: request.cast_at,
            is_valid: true,
        };
        if let Err(e) = record.insert(&mut tx).await {
            let err = insert_error(tx_hash)(e);
            // A concurrent commit of the same receipt also trips the voter rule
            if matches!(err, CommitError::Ineligible(Ineligible::AlreadyVoted))
                && VoteRecord::get_by_tx_hash(&mut tx, &tx_hash).await?.is_some()
            {
                return Err(CommitError::DuplicateReceipt { tx_hash });
            }
            return Err(err);
        }

        VotedElection {
            voter_id: request.voter_id.clone(),
            election_id: request.election_id.clone(),
            candidate_id: request.candidate_id.clone(),
            tx_hash,
            voted_at: request.cast_at,
        }
        .insert(&mut tx)
        .await
        .map_err(insert_error(tx_hash))?;

        if !Candidate::adjust_vote_count(&mut tx, &request.candidate_id, 1).await?
            || !Election::adjust_total_votes(&mut tx, &request.election_id, 1).await?
        {
            return Err(CommitError::Persistence(sqlx::Error::RowNotFound));
        }

        if let Some(attempt) = request.attempt {
            let moved = VoteAttempt::transition(
                &mut tx,
                attempt.id,
                attempt.state,
                AttemptState::Committed,
                &AttemptUpdate::receipt(&receipt),
                Utc::now(),
            )
            .await?;
            if !moved {
                return Err(CommitError::Persistence(sqlx::Error::Protocol(format!(
                    "attempt {} is no longer {}",
                    attempt.id, attempt.state
                ))));
            }
        }

        tx.commit().await?;
        info!(
            "Committed vote {} for voter {} in election {} (block {})",
            tx_hash, request.voter_id, request.election_id, receipt.block_number
        );
        Ok(record)
    }

    /// Clear the validity flag of a record and take its vote off both
    /// counters. The voted-elections entry stays, so the voter cannot vote
    /// again in that election.
    pub async fn invalidate(&self, tx_hash: &TxHash) -> Result<Invalidation, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let Some(record) = VoteRecord::get_by_tx_hash(&mut tx, tx_hash).await? else {
            return Ok(Invalidation::NotFound);
        };
        if !VoteRecord::invalidate(&mut tx, tx_hash).await? {
            return Ok(Invalidation::AlreadyInvalid(record));
        }
        Candidate::adjust_vote_count(&mut tx, &record.candidate_id, -1).await?;
        Election::adjust_total_votes(&mut tx, &record.election_id, -1).await?;
        tx.commit().await?;

        info!(
            "Invalidated vote {} for candidate {} in election {}",
            tx_hash, record.candidate_id, record.election_id
        );
        Ok(Invalidation::Invalidated(VoteRecord {
            is_valid: false,
            ..record
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{ElectionStatus, Voter};
    use crate::database::Database;
    use crate::ledger::Address;
    use chrono::Duration as ChronoDuration;

    async fn setup() -> (Database, ReconciliationWriter) {
        let db = Database::connect(":memory:").await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();
        let now = Utc::now();
        for (id, wallet) in [("alice", 0xa1), ("bob", 0xb0)] {
            Voter {
                id: id.into(),
                wallet_address: Address([wallet; 20]).to_string(),
                is_verified: true,
            }
            .insert(&mut conn)
            .await
            .unwrap();
        }
        Election {
            id: "board".into(),
            title: "Board".into(),
            start_date: now - ChronoDuration::hours(1),
            end_date: now + ChronoDuration::hours(1),
            status: ElectionStatus::Active,
            total_votes: 0,
        }
        .insert(&mut conn)
        .await
        .unwrap();
        Candidate {
            id: "carol".into(),
            election_id: "board".into(),
            name: "Carol".into(),
            is_verified: true,
            is_active: true,
            vote_count: 0,
        }
        .insert(&mut conn)
        .await
        .unwrap();
        drop(conn);
        let writer = ReconciliationWriter::new(db.pool().clone());
        (db, writer)
    }

    fn request(voter: &str, hash: u8) -> CommitRequest {
        CommitRequest {
            voter_id: voter.into(),
            candidate_id: "carol".into(),
            election_id: "board".into(),
            receipt: LedgerReceipt {
                transaction_hash: TxHash([hash; 32]),
                block_number: 42,
                gas_used: 85_000,
                success: true,
            },
            cast_at: Utc::now(),
            attempt: None,
        }
    }

    async fn counters(db: &Database) -> (i64, i64) {
        let mut conn = db.pool().acquire().await.unwrap();
        let candidate = Candidate::get_by_id(&mut conn, "carol").await.unwrap().unwrap();
        let election = Election::get_by_id(&mut conn, "board").await.unwrap().unwrap();
        (candidate.vote_count, election.total_votes)
    }

    #[tokio::test]
    async fn commit_writes_record_list_and_counters() {
        let (db, writer) = setup().await;
        let record = writer.commit(&request("alice", 1)).await.unwrap();
        assert_eq!(record.tx_hash, TxHash([1; 32]));
        assert_eq!(record.block_number, 42);
        assert!(record.is_valid);
        assert_eq!(counters(&db).await, (1, 1));

        let mut conn = db.pool().acquire().await.unwrap();
        let voted = VotedElection::list_for_voter(&mut conn, "alice").await.unwrap();
        assert_eq!(voted.len(), 1);
        assert_eq!(voted[0].tx_hash, TxHash([1; 32]));
    }

    #[tokio::test]
    async fn replaying_a_receipt_changes_nothing() {
        let (db, writer) = setup().await;
        writer.commit(&request("alice", 1)).await.unwrap();
        let err = writer.commit(&request("alice", 1)).await.unwrap_err();
        assert!(matches!(err, CommitError::DuplicateReceipt { .. }));
        assert_eq!(counters(&db).await, (1, 1));
    }

    #[tokio::test]
    async fn second_receipt_for_same_voter_is_already_voted() {
        let (db, writer) = setup().await;
        writer.commit(&request("alice", 1)).await.unwrap();
        let err = writer.commit(&request("alice", 2)).await.unwrap_err();
        assert!(matches!(err, CommitError::Ineligible(Ineligible::AlreadyVoted)));
        assert_eq!(counters(&db).await, (1, 1));

        writer.commit(&request("bob", 2)).await.unwrap();
        assert_eq!(counters(&db).await, (2, 2));
    }

    #[tokio::test]
    async fn revalidation_failure_writes_nothing() {
        let (db, writer) = setup().await;
        {
            let mut conn = db.pool().acquire().await.unwrap();
            Candidate::set_active(&mut conn, "carol", false).await.unwrap();
        }
        let err = writer.commit(&request("alice", 1)).await.unwrap_err();
        assert!(matches!(err, CommitError::Ineligible(Ineligible::CandidateIneligible)));
        assert_eq!(counters(&db).await, (0, 0));
        let mut conn = db.pool().acquire().await.unwrap();
        assert_eq!(VoteRecord::count(&mut conn).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn window_closing_after_admission_does_not_block_commit() {
        let (db, writer) = setup().await;
        let mut late = request("alice", 1);
        late.cast_at = Utc::now() - ChronoDuration::minutes(30);
        writer.commit(&late).await.unwrap();
        assert_eq!(counters(&db).await, (1, 1));

        let mut too_early = request("bob", 2);
        too_early.cast_at = Utc::now() - ChronoDuration::hours(2);
        let err = writer.commit(&too_early).await.unwrap_err();
        assert!(matches!(err, CommitError::Ineligible(Ineligible::ElectionNotOpen)));
    }

    #[tokio::test]
    async fn reverted_receipts_are_refused() {
        let (db, writer) = setup().await;
        let mut reverted = request("alice", 1);
        reverted.receipt.success = false;
        let err = writer.commit(&reverted).await.unwrap_err();
        assert!(matches!(err, CommitError::FailedReceipt { .. }));
        assert_eq!(counters(&db).await, (0, 0));
    }

    #[tokio::test]
    async fn commit_settles_the_attempt_in_the_same_transaction() {
        let (db, writer) = setup().await;
        let now = Utc::now();
        let attempt = VoteAttempt::new("alice", "carol", "board", Address([0xa1; 20]), now);
        {
            let mut conn = db.pool().acquire().await.unwrap();
            attempt.insert(&mut conn).await.unwrap();
            for (from, to) in [
                (AttemptState::Validated, AttemptState::SubmittedToLedger),
                (AttemptState::SubmittedToLedger, AttemptState::LedgerConfirmed),
            ] {
                VoteAttempt::transition(&mut conn, attempt.id, from, to, &AttemptUpdate::default(), now)
                    .await
                    .unwrap();
            }
        }

        let mut stale = request("alice", 1);
        stale.attempt = Some(AttemptRef {
            id: attempt.id,
            state: AttemptState::SubmittedToLedger,
        });
        // the attempt moved on, so nothing is written
        assert!(matches!(
            writer.commit(&stale).await.unwrap_err(),
            CommitError::Persistence(_)
        ));
        assert_eq!(counters(&db).await, (0, 0));

        let mut current = request("alice", 1);
        current.attempt = Some(AttemptRef {
            id: attempt.id,
            state: AttemptState::LedgerConfirmed,
        });
        writer.commit(&current).await.unwrap();

        let mut conn = db.pool().acquire().await.unwrap();
        let stored = VoteAttempt::get_by_id(&mut conn, attempt.id).await.unwrap().unwrap();
        assert_eq!(stored.state, AttemptState::Committed);
        assert_eq!(stored.block_number, Some(42));
        assert_eq!(stored.tx_hash, Some(TxHash([1; 32])));
    }

    #[tokio::test]
    async fn invalidation_decrements_once_and_keeps_the_vote_slot() {
        let (db, writer) = setup().await;
        writer.commit(&request("alice", 1)).await.unwrap();

        let first = writer.invalidate(&TxHash([1; 32])).await.unwrap();
        assert!(matches!(first, Invalidation::Invalidated(ref r) if !r.is_valid));
        assert_eq!(counters(&db).await, (0, 0));

        let second = writer.invalidate(&TxHash([1; 32])).await.unwrap();
        assert!(matches!(second, Invalidation::AlreadyInvalid(_)));
        assert_eq!(counters(&db).await, (0, 0));

        assert_eq!(writer.invalidate(&TxHash([9; 32])).await.unwrap(), Invalidation::NotFound);

        let err = writer.commit(&request("alice", 2)).await.unwrap_err();
        assert!(matches!(err, CommitError::Ineligible(Ineligible::AlreadyVoted)));
    }
}
