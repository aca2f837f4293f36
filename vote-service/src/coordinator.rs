//! Vote submission coordinator
//!
//! `cast_vote` runs validation, admits the attempt into the journal, and hands
//! the rest of the pipeline (send, receipt, commit) to a spawned task so a
//! dropped request cannot interrupt a submission or a commit halfway.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::database::models::{AttemptState, VoteAttempt, VoteRecord};
use crate::database::operations::AttemptUpdate;
use crate::database::{is_busy, unique_violation, UniqueViolation};
use crate::eligibility::{self, Eligibility, EligibilityValidator};
use crate::error::{CommitError, Ineligible, VoteError};
use crate::ledger::{LedgerError, SendJournal, SubmissionClient, TxHash, VoteCall};
use crate::metrics::{self, VoteOutcome};
use crate::reconcile::{CommitRequest, Invalidation, ReconciliationWriter};

const MAX_ADMIT_ATTEMPTS: u32 = 5;
const ADMIT_BACKOFF: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Deserialize)]
pub struct CastVoteRequest {
    pub voter_id: String,
    pub candidate_id: String,
    pub election_id: String,
}

/// What the caller gets back for a committed vote
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CastVoteReceipt {
    pub attempt_id: Uuid,
    pub transaction_hash: TxHash,
    pub candidate_name: String,
    pub timestamp: DateTime<Utc>,
    pub block_number: u64,
    pub gas_used: u64,
}

/// Stores each nonce on the attempt before the node sees the transaction,
/// so repair can always find what was sent.
struct NonceJournal<'a> {
    pool: &'a SqlitePool,
    attempt_id: Uuid,
}

#[async_trait]
impl SendJournal for NonceJournal<'_> {
    async fn reserve(&self, nonce: u64, from_block: u64) -> bool {
        let result = match self.pool.acquire().await {
            Ok(mut conn) => {
                VoteAttempt::reserve_nonce(&mut conn, self.attempt_id, nonce, from_block, Utc::now())
                    .await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(true) => true,
            Ok(false) => {
                warn!("Attempt {} left VALIDATED before its send", self.attempt_id);
                false
            }
            Err(e) => {
                error!(attempt_id = %self.attempt_id, "Failed to journal nonce {}: {}", nonce, e);
                false
            }
        }
    }
}

#[derive(Clone)]
pub struct VoteCoordinator {
    pool: SqlitePool,
    validator: EligibilityValidator,
    client: Arc<SubmissionClient>,
    writer: ReconciliationWriter,
    commit_timeout: Duration,
}

impl VoteCoordinator {
    pub fn new(pool: SqlitePool, client: Arc<SubmissionClient>, commit_timeout: Duration) -> Self {
        Self {
            validator: EligibilityValidator::new(pool.clone()),
            writer: ReconciliationWriter::new(pool.clone()),
            pool,
            client,
            commit_timeout,
        }
    }

    pub fn writer(&self) -> &ReconciliationWriter {
        &self.writer
    }

    pub fn client(&self) -> &Arc<SubmissionClient> {
        &self.client
    }

    pub async fn cast_vote(&self, request: &CastVoteRequest) -> Result<CastVoteReceipt, VoteError> {
        info!(
            "CastVote voter={} candidate={} election={}",
            request.voter_id, request.candidate_id, request.election_id
        );
        let result = self.cast_vote_inner(request).await;
        match &result {
            Ok(receipt) => {
                metrics::record_vote_outcome(VoteOutcome::Committed);
                info!(
                    "Vote committed: attempt={} tx={}",
                    receipt.attempt_id, receipt.transaction_hash
                );
            }
            Err(e) => {
                metrics::record_vote_outcome(VoteOutcome::from(e));
                info!("Vote not committed for voter {}: {}", request.voter_id, e);
            }
        }
        result
    }

    async fn cast_vote_inner(&self, request: &CastVoteRequest) -> Result<CastVoteReceipt, VoteError> {
        let cast_at = Utc::now();
        let eligibility = self
            .validator
            .validate(
                &request.voter_id,
                &request.candidate_id,
                &request.election_id,
                cast_at,
            )
            .await?;

        let attempt = self.admit(request, &eligibility, cast_at).await?;
        let attempt_id = attempt.id;

        let pipeline = self.clone();
        let record = tokio::spawn(async move { pipeline.run_pipeline(attempt).await })
            .await
            .map_err(|e| VoteError::Internal(format!("vote pipeline for {} failed: {}", attempt_id, e)))??;

        Ok(CastVoteReceipt {
            attempt_id,
            transaction_hash: record.tx_hash,
            candidate_name: eligibility.candidate.name,
            timestamp: record.cast_at,
            block_number: record.block_number,
            gas_used: record.gas_used,
        })
    }

    /// Journal the attempt as `VALIDATED`. Eligibility is checked again in
    /// the same write transaction, and the in-flight index turns a racing
    /// attempt for the same voter and election into `AlreadyVoted`.
    async fn admit(
        &self,
        request: &CastVoteRequest,
        eligibility: &Eligibility,
        cast_at: DateTime<Utc>,
    ) -> Result<VoteAttempt, VoteError> {
        let attempt = VoteAttempt::new(
            &request.voter_id,
            &request.candidate_id,
            &request.election_id,
            eligibility.wallet,
            cast_at,
        );

        let mut tries = 0;
        loop {
            tries += 1;
            match self.try_admit(&attempt).await {
                Err(VoteError::Store(e)) if is_busy(&e) && tries < MAX_ADMIT_ATTEMPTS => {
                    warn!("Admission of attempt {} hit a locked database: {}", attempt.id, e);
                    sleep(ADMIT_BACKOFF * tries).await;
                }
                Err(e) => return Err(e),
                Ok(()) => {
                    info!("Attempt {} admitted", attempt.id);
                    return Ok(attempt);
                }
            }
        }
    }

    async fn try_admit(&self, attempt: &VoteAttempt) -> Result<(), VoteError> {
        let mut tx = self.pool.begin().await?;
        eligibility::check(
            &mut tx,
            &attempt.voter_id,
            &attempt.candidate_id,
            &attempt.election_id,
            attempt.cast_at,
        )
        .await
        .map_err(VoteError::from)?;

        match attempt.insert(&mut tx).await {
            Ok(()) => {}
            Err(e) if unique_violation(&e) == Some(UniqueViolation::InFlightAttempt) => {
                return Err(Ineligible::AlreadyVoted.into());
            }
            Err(e) => return Err(e.into()),
        }
        tx.commit().await?;
        Ok(())
    }

    async fn run_pipeline(&self, attempt: VoteAttempt) -> Result<VoteRecord, VoteError> {
        let call = VoteCall {
            election_id: attempt.election_id.clone(),
            candidate_id: attempt.candidate_id.clone(),
            voter: attempt.voter_wallet,
        };

        let journal = NonceJournal {
            pool: &self.pool,
            attempt_id: attempt.id,
        };
        let sent = match self.client.send_vote_journaled(&call, &journal).await {
            Ok(sent) => sent,
            Err(err) => {
                return Err(self
                    .settle_ledger_failure(attempt.id, AttemptState::Validated, err)
                    .await)
            }
        };

        let journaled = self
            .journal(
                attempt.id,
                AttemptState::Validated,
                AttemptState::SubmittedToLedger,
                AttemptUpdate {
                    tx_hash: Some(sent.hash),
                    nonce: Some(sent.nonce),
                    from_block: Some(sent.from_block),
                    ..Default::default()
                },
            )
            .await;
        if !journaled {
            // The reserved nonce is on the attempt, so repair can locate it
            return Err(VoteError::Pending {
                attempt_id: attempt.id,
                tx_hash: Some(sent.hash),
            });
        }

        let receipt = match self.client.await_receipt(sent.hash).await {
            Ok(receipt) => receipt,
            Err(err) => {
                return Err(self
                    .settle_ledger_failure(attempt.id, AttemptState::SubmittedToLedger, err)
                    .await)
            }
        };

        let confirmed = self
            .journal(
                attempt.id,
                AttemptState::SubmittedToLedger,
                AttemptState::LedgerConfirmed,
                AttemptUpdate::receipt(&receipt),
            )
            .await;
        if !confirmed {
            // Still SUBMITTED_TO_LEDGER with its hash, so repair picks it up
            return Err(VoteError::ReconciliationFailed {
                attempt_id: attempt.id,
                tx_hash: sent.hash,
            });
        }

        let attempt = VoteAttempt {
            state: AttemptState::LedgerConfirmed,
            ..attempt
        };
        self.commit_confirmed(&attempt, CommitRequest::for_attempt(&attempt, receipt))
            .await
    }

    async fn commit_confirmed(
        &self,
        attempt: &VoteAttempt,
        request: CommitRequest,
    ) -> Result<VoteRecord, VoteError> {
        let tx_hash = request.receipt.transaction_hash;
        let outcome = match timeout(self.commit_timeout, self.writer.commit(&request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(CommitError::Timeout(self.commit_timeout)),
        };

        match outcome {
            Ok(record) => Ok(record),
            Err(CommitError::DuplicateReceipt { .. }) => {
                // Someone else committed this receipt, settle the journal too
                self.journal(
                    attempt.id,
                    attempt.state,
                    AttemptState::Committed,
                    AttemptUpdate::default(),
                )
                .await;
                let mut conn = self.pool.acquire().await?;
                VoteRecord::get_by_tx_hash(&mut conn, &tx_hash)
                    .await?
                    .ok_or(VoteError::ReconciliationFailed {
                        attempt_id: attempt.id,
                        tx_hash,
                    })
            }
            Err(CommitError::Ineligible(reason)) => {
                warn!(
                    attempt_id = %attempt.id,
                    tx_hash = %tx_hash,
                    "Ledger accepted a vote the store refuses ({}); orphaning it",
                    reason
                );
                self.journal(
                    attempt.id,
                    attempt.state,
                    AttemptState::Orphaned,
                    AttemptUpdate::error(reason.to_string()),
                )
                .await;
                Err(VoteError::Ineligible(reason))
            }
            Err(e) => {
                error!(
                    attempt_id = %attempt.id,
                    tx_hash = %tx_hash,
                    "Vote confirmed on the ledger but not recorded: {}",
                    e
                );
                self.journal(
                    attempt.id,
                    attempt.state,
                    AttemptState::ReconciliationFailed,
                    AttemptUpdate::error(e.to_string()),
                )
                .await;
                Err(VoteError::ReconciliationFailed {
                    attempt_id: attempt.id,
                    tx_hash,
                })
            }
        }
    }

    /// Record the ledger failure on the attempt and turn it into the error
    /// the caller sees.
    async fn settle_ledger_failure(
        &self,
        attempt_id: Uuid,
        from: AttemptState,
        err: LedgerError,
    ) -> VoteError {
        warn!(attempt_id = %attempt_id, "Ledger submission failed ({:?}): {}", err.class(), err);
        let message = err.to_string();

        match err {
            LedgerError::Submission { .. } => {
                self.journal(
                    attempt_id,
                    from,
                    AttemptState::SubmissionFailed,
                    AttemptUpdate::error(&message),
                )
                .await;
                VoteError::LedgerUnavailable {
                    attempt_id,
                    message,
                }
            }
            LedgerError::GasEstimation(_) | LedgerError::Rejected(_) => {
                self.journal(
                    attempt_id,
                    from,
                    AttemptState::SubmissionFailed,
                    AttemptUpdate::error(&message),
                )
                .await;
                VoteError::LedgerRejected {
                    attempt_id,
                    tx_hash: None,
                    message,
                }
            }
            LedgerError::NotJournaled { .. } => {
                self.journal(
                    attempt_id,
                    from,
                    AttemptState::SubmissionFailed,
                    AttemptUpdate::error(&message),
                )
                .await;
                VoteError::Internal(message)
            }
            LedgerError::Reverted {
                tx_hash,
                block_number,
                gas_used,
            } => {
                self.journal(
                    attempt_id,
                    from,
                    AttemptState::LedgerReverted,
                    AttemptUpdate {
                        tx_hash: Some(tx_hash),
                        block_number: Some(block_number),
                        gas_used: Some(gas_used),
                        error: Some(message.clone()),
                        ..Default::default()
                    },
                )
                .await;
                VoteError::LedgerRejected {
                    attempt_id,
                    tx_hash: Some(tx_hash),
                    message,
                }
            }
            LedgerError::Timeout { tx_hash, .. } => {
                self.journal(
                    attempt_id,
                    from,
                    AttemptState::LedgerTimeout,
                    AttemptUpdate {
                        tx_hash: Some(tx_hash),
                        error: Some(message),
                        ..Default::default()
                    },
                )
                .await;
                VoteError::Pending {
                    attempt_id,
                    tx_hash: Some(tx_hash),
                }
            }
            LedgerError::Unconfirmed {
                nonce, from_block, ..
            } => {
                self.journal(
                    attempt_id,
                    from,
                    AttemptState::LedgerTimeout,
                    AttemptUpdate {
                        nonce: Some(nonce),
                        from_block: Some(from_block),
                        error: Some(message),
                        ..Default::default()
                    },
                )
                .await;
                VoteError::Pending {
                    attempt_id,
                    tx_hash: None,
                }
            }
        }
    }

    /// Apply a journal transition. Store failures are logged, not
    /// propagated: the attempt keeps its last state for the repair job.
    async fn journal(
        &self,
        id: Uuid,
        from: AttemptState,
        to: AttemptState,
        update: AttemptUpdate,
    ) -> bool {
        let result = match self.pool.acquire().await {
            Ok(mut conn) => {
                VoteAttempt::transition(&mut conn, id, from, to, &update, Utc::now()).await
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(true) => {
                info!("Attempt {}: {} -> {}", id, from, to);
                true
            }
            Ok(false) => {
                warn!("Attempt {} left {} before it could move to {}", id, from, to);
                false
            }
            Err(e) => {
                error!(attempt_id = %id, "Failed to journal {} -> {}: {}", from, to, e);
                false
            }
        }
    }

    pub async fn get_vote(&self, tx_hash: &TxHash) -> Result<Option<VoteRecord>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        VoteRecord::get_by_tx_hash(&mut conn, tx_hash).await
    }

    pub async fn get_attempt(&self, id: Uuid) -> Result<Option<VoteAttempt>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        VoteAttempt::get_by_id(&mut conn, id).await
    }

    pub async fn invalidate(&self, tx_hash: &TxHash) -> Result<Invalidation, sqlx::Error> {
        self.writer.invalidate(tx_hash).await
    }
}
