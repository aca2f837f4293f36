//! Background repair of attempts the request path could not settle
//!
//! Each pass walks the journal for attempts stuck in a non-terminal state and
//! drives them forward: ambiguous ledger outcomes are resolved against the
//! chain and confirmed votes are replayed through the reconciliation writer.
//! An attempt is only expired on chain evidence that its vote can never be
//! mined: no nonce was reserved, or the nonce went to another transaction.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::RepairConfig;
use crate::database::models::{AttemptState, VoteAttempt};
use crate::database::operations::AttemptUpdate;
use crate::error::CommitError;
use crate::ledger::{LedgerReceipt, NonceStatus, RpcError, SubmissionClient, TxHash, VoteCall};
use crate::metrics::{self, RepairOutcome};
use crate::reconcile::{CommitRequest, ReconciliationWriter};

#[derive(Error, Debug)]
enum RepairError {
    #[error("ledger: {0}")]
    Ledger(#[from] RpcError),

    #[error("store: {0}")]
    Store(#[from] sqlx::Error),
}

/// Counts for one pass
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub committed: usize,
    pub reverted: usize,
    pub expired: usize,
    pub orphaned: usize,
    pub located: usize,
    pub failed: usize,
    /// Still unresolved, left for a later pass
    pub pending: usize,
}

impl RepairReport {
    fn record(&mut self, outcome: RepairOutcome) {
        metrics::record_repair_outcome(outcome);
        match outcome {
            RepairOutcome::Committed => self.committed += 1,
            RepairOutcome::Reverted => self.reverted += 1,
            RepairOutcome::Expired => self.expired += 1,
            RepairOutcome::Orphaned => self.orphaned += 1,
            RepairOutcome::Located => self.located += 1,
            RepairOutcome::Failed => self.failed += 1,
        }
    }

    pub fn is_idle(&self) -> bool {
        *self == RepairReport::default()
    }
}

fn before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub struct RepairJob {
    pool: SqlitePool,
    client: Arc<SubmissionClient>,
    writer: ReconciliationWriter,
    config: RepairConfig,
}

impl RepairJob {
    pub fn new(
        pool: SqlitePool,
        client: Arc<SubmissionClient>,
        writer: ReconciliationWriter,
        config: RepairConfig,
    ) -> Self {
        Self {
            pool,
            client,
            writer,
            config,
        }
    }

    /// Run passes every `interval` until `shutdown` flips to true or its
    /// sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Repair job started, interval {:?}", self.config.interval);
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Repair job shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(report) if report.is_idle() => debug!("Repair pass found nothing to do"),
                        Ok(report) => info!("Repair pass finished: {:?}", report),
                        Err(e) => error!("Repair pass failed: {}", e),
                    }
                }
            }
        }
    }

    /// One pass over the journal. Only listing failures abort the pass; a
    /// failure on a single attempt is counted and the pass moves on.
    pub async fn run_once(&self) -> Result<RepairReport, sqlx::Error> {
        metrics::record_repair_pass();
        let now = Utc::now();
        let stale_before = before(now, self.config.stale_after);
        let mut report = RepairReport::default();

        let mut unresolved = self.list(AttemptState::LedgerTimeout, now).await?;
        unresolved.extend(self.list(AttemptState::SubmittedToLedger, stale_before).await?);
        unresolved.extend(self.list(AttemptState::Validated, stale_before).await?);
        for attempt in unresolved {
            if let Err(e) = self.resolve_ledger(&attempt, now, &mut report).await {
                warn!("Repair of attempt {} failed: {}", attempt.id, e);
                report.record(RepairOutcome::Failed);
            }
        }

        let mut confirmed = self.list(AttemptState::ReconciliationFailed, now).await?;
        confirmed.extend(self.list(AttemptState::LedgerConfirmed, stale_before).await?);
        for attempt in confirmed {
            if let Err(e) = self.replay_commit(&attempt, &mut report).await {
                warn!("Commit replay of attempt {} failed: {}", attempt.id, e);
                report.record(RepairOutcome::Failed);
            }
        }

        Ok(report)
    }

    async fn list(
        &self,
        state: AttemptState,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<VoteAttempt>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        VoteAttempt::list_by_state(&mut conn, state, updated_before, self.config.batch_size).await
    }

    async fn transition(
        &self,
        attempt: &VoteAttempt,
        from: AttemptState,
        to: AttemptState,
        update: AttemptUpdate,
    ) -> Result<bool, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        let moved = VoteAttempt::transition(&mut conn, attempt.id, from, to, &update, Utc::now()).await?;
        if moved {
            info!("Repair moved attempt {}: {} -> {}", attempt.id, from, to);
        } else {
            debug!("Attempt {} left {} while being repaired", attempt.id, from);
        }
        Ok(moved)
    }

    async fn expire(
        &self,
        attempt: &VoteAttempt,
        from: AttemptState,
        reason: String,
        report: &mut RepairReport,
    ) -> Result<(), RepairError> {
        if self
            .transition(attempt, from, AttemptState::Expired, AttemptUpdate::error(reason))
            .await?
        {
            report.record(RepairOutcome::Expired);
        }
        Ok(())
    }

    /// The outcome is still open. Nothing is freed while the nonce is
    /// unspent, since the transaction can still be mined.
    fn keep_pending(&self, attempt: &VoteAttempt, now: DateTime<Utc>, report: &mut RepairReport) {
        report.pending += 1;
        let overdue = (now - attempt.cast_at)
            .to_std()
            .is_ok_and(|age| age >= self.config.pending_expiry);
        if overdue {
            warn!(
                attempt_id = %attempt.id,
                "Attempt {} still unresolved in {} after {:?}; relayer nonce {:?} is unspent",
                attempt.id, attempt.state, self.config.pending_expiry, attempt.nonce
            );
        }
    }

    /// Settle an attempt whose ledger outcome is unknown
    async fn resolve_ledger(
        &self,
        attempt: &VoteAttempt,
        now: DateTime<Utc>,
        report: &mut RepairReport,
    ) -> Result<(), RepairError> {
        let Some(nonce) = attempt.nonce else {
            if attempt.tx_hash.is_none() && attempt.state == AttemptState::Validated {
                // Nonces are journaled before the send, so nothing went out
                return self
                    .expire(
                        attempt,
                        attempt.state,
                        "abandoned before its send".to_string(),
                        report,
                    )
                    .await;
            }
            return self.resolve_by_hash(attempt, attempt.state, None, now, report).await;
        };

        // Read before any lookup: a nonce spent before our lookups came back
        // empty was spent by another transaction.
        let spent = self.client.confirmed_nonce().await? > nonce;

        if attempt.tx_hash.is_some() {
            return self
                .resolve_by_hash(attempt, attempt.state, Some(spent), now, report)
                .await;
        }

        let Some(hash) = self.locate(attempt, nonce, spent, now, report).await? else {
            return Ok(());
        };
        let located = self
            .transition(
                attempt,
                attempt.state,
                AttemptState::SubmittedToLedger,
                AttemptUpdate {
                    tx_hash: Some(hash),
                    ..Default::default()
                },
            )
            .await?;
        if !located {
            return Ok(());
        }
        report.record(RepairOutcome::Located);
        let current = VoteAttempt {
            tx_hash: Some(hash),
            ..attempt.clone()
        };
        self.resolve_by_hash(&current, AttemptState::SubmittedToLedger, Some(spent), now, report)
            .await
    }

    /// Poll the receipt of a known hash. `spent` says whether the attempt's
    /// nonce was already used when the pass started; `None` when unknown.
    async fn resolve_by_hash(
        &self,
        attempt: &VoteAttempt,
        state: AttemptState,
        spent: Option<bool>,
        now: DateTime<Utc>,
        report: &mut RepairReport,
    ) -> Result<(), RepairError> {
        let Some(hash) = attempt.tx_hash else {
            self.keep_pending(attempt, now, report);
            return Ok(());
        };

        match self.client.check_receipt(&hash).await? {
            Some(receipt) if receipt.success => {
                let moved = self
                    .transition(
                        attempt,
                        state,
                        AttemptState::LedgerConfirmed,
                        AttemptUpdate::receipt(&receipt),
                    )
                    .await?;
                if moved {
                    let confirmed = VoteAttempt {
                        state: AttemptState::LedgerConfirmed,
                        tx_hash: Some(hash),
                        block_number: Some(receipt.block_number),
                        gas_used: Some(receipt.gas_used),
                        ..attempt.clone()
                    };
                    self.replay_commit(&confirmed, report).await?;
                }
            }
            Some(receipt) => {
                let moved = self
                    .transition(
                        attempt,
                        state,
                        AttemptState::LedgerReverted,
                        AttemptUpdate {
                            block_number: Some(receipt.block_number),
                            gas_used: Some(receipt.gas_used),
                            error: Some(format!("transaction {} reverted", hash)),
                            ..Default::default()
                        },
                    )
                    .await?;
                if moved {
                    report.record(RepairOutcome::Reverted);
                }
            }
            None if spent == Some(true) => {
                info!(
                    "Attempt {}: nonce {:?} was mined without {}; it was replaced",
                    attempt.id, attempt.nonce, hash
                );
                self.expire(
                    attempt,
                    state,
                    format!("transaction {} replaced by another at its nonce", hash),
                    report,
                )
                .await?;
            }
            None => {
                let current = VoteAttempt {
                    state,
                    ..attempt.clone()
                };
                self.keep_pending(&current, now, report);
            }
        }
        Ok(())
    }

    /// Find the hash of a transaction whose send response was lost. Settles
    /// the attempt itself when the chain proves it can never land.
    async fn locate(
        &self,
        attempt: &VoteAttempt,
        nonce: u64,
        spent: bool,
        now: DateTime<Utc>,
        report: &mut RepairReport,
    ) -> Result<Option<TxHash>, RepairError> {
        let Some(from_block) = attempt.from_block else {
            self.keep_pending(attempt, now, report);
            return Ok(None);
        };
        let call = VoteCall {
            election_id: attempt.election_id.clone(),
            candidate_id: attempt.candidate_id.clone(),
            voter: attempt.voter_wallet,
        };

        match self.client.locate(&call, nonce, from_block).await? {
            NonceStatus::Ours(hash) => {
                info!("Attempt {} located on the ledger: nonce {} is {}", attempt.id, nonce, hash);
                Ok(Some(hash))
            }
            NonceStatus::Taken(other) => {
                info!(
                    "Attempt {}: nonce {} went to {}, so this vote was never mined",
                    attempt.id, nonce, other
                );
                self.expire(
                    attempt,
                    attempt.state,
                    format!("nonce {} used by {}", nonce, other),
                    report,
                )
                .await?;
                Ok(None)
            }
            NonceStatus::Unseen if spent => {
                // The nonce is spent but not within the scan window
                error!(
                    attempt_id = %attempt.id,
                    "Nonce {} was mined outside blocks {}..; needs manual reconciliation",
                    nonce, from_block
                );
                let moved = self
                    .transition(
                        attempt,
                        attempt.state,
                        AttemptState::ReconciliationFailed,
                        AttemptUpdate::error(format!(
                            "nonce {} mined but not found from block {}",
                            nonce, from_block
                        )),
                    )
                    .await?;
                if moved {
                    report.record(RepairOutcome::Failed);
                }
                Ok(None)
            }
            NonceStatus::Unseen => {
                self.keep_pending(attempt, now, report);
                Ok(None)
            }
        }
    }

    /// Run a ledger-confirmed vote through the writer again. The writer is
    /// idempotent on the transaction hash.
    async fn replay_commit(
        &self,
        attempt: &VoteAttempt,
        report: &mut RepairReport,
    ) -> Result<(), RepairError> {
        let (Some(tx_hash), Some(block_number)) = (attempt.tx_hash, attempt.block_number) else {
            debug!("Attempt {} has no receipt to replay", attempt.id);
            return Ok(());
        };
        let receipt = LedgerReceipt {
            transaction_hash: tx_hash,
            block_number,
            gas_used: attempt.gas_used.unwrap_or_default(),
            success: true,
        };

        match self
            .writer
            .commit(&CommitRequest::for_attempt(attempt, receipt))
            .await
        {
            Ok(_) => report.record(RepairOutcome::Committed),
            Err(CommitError::DuplicateReceipt { .. }) => {
                if self
                    .transition(
                        attempt,
                        attempt.state,
                        AttemptState::Committed,
                        AttemptUpdate::default(),
                    )
                    .await?
                {
                    report.record(RepairOutcome::Committed);
                }
            }
            Err(CommitError::Ineligible(reason)) => {
                warn!(
                    attempt_id = %attempt.id,
                    tx_hash = %tx_hash,
                    "Confirmed vote no longer eligible ({}); orphaning it",
                    reason
                );
                if self
                    .transition(
                        attempt,
                        attempt.state,
                        AttemptState::Orphaned,
                        AttemptUpdate::error(reason.to_string()),
                    )
                    .await?
                {
                    report.record(RepairOutcome::Orphaned);
                }
            }
            Err(e) => {
                error!(attempt_id = %attempt.id, tx_hash = %tx_hash, "Commit replay failed: {}", e);
                if attempt.state == AttemptState::LedgerConfirmed {
                    self.transition(
                        attempt,
                        attempt.state,
                        AttemptState::ReconciliationFailed,
                        AttemptUpdate::error(e.to_string()),
                    )
                    .await?;
                }
                report.record(RepairOutcome::Failed);
            }
        }
        Ok(())
    }
}
