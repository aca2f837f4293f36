//! Ledger submission client
//!
//! Wraps a [`LedgerRpc`] with the vote submission algorithm: padded gas
//! estimation, serialized nonce allocation for the relayer account, bounded
//! retries for failures that provably sent nothing, and a bounded wait for
//! the receipt. Every failure is classified through [`LedgerError::class`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::abi;
use super::error::{LedgerError, RpcError};
use super::rpc::LedgerRpc;
use super::types::{
    Address, BlockTag, LedgerReceipt, RawReceipt, SentTransaction, TxHash, TxRequest, VoteCall,
};
use crate::config::LedgerConfig;

/// Smallest accepted gas multiplier, in percent
pub const MIN_GAS_MULTIPLIER_PCT: u64 = 120;

/// `ceil(estimate * pct / 100)`
pub fn pad_gas(estimate: u64, pct: u64) -> u64 {
    let padded = (u128::from(estimate) * u128::from(pct)).div_ceil(100);
    u64::try_from(padded).unwrap_or(u64::MAX)
}

/// Durable record of the nonce a vote is about to use. Called with the
/// nonce lock held, right before the node sees the transaction.
#[async_trait]
pub trait SendJournal: Send + Sync {
    /// `false` cancels the send; nothing reaches the node.
    async fn reserve(&self, nonce: u64, from_block: u64) -> bool;
}

#[async_trait]
impl SendJournal for () {
    async fn reserve(&self, _nonce: u64, _from_block: u64) -> bool {
        true
    }
}

/// What the chain holds at one relayer nonce
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NonceStatus {
    /// Mined with the expected call data
    Ours(TxHash),
    /// Mined by a different transaction, so ours can never land
    Taken(TxHash),
    /// Not found within the scan window
    Unseen,
}

enum SendFailure {
    Retryable(String),
    Fatal(LedgerError),
}

impl SendFailure {
    fn retryable(err: RpcError) -> Self {
        SendFailure::Retryable(err.to_string())
    }
}

pub struct SubmissionClient {
    rpc: Arc<dyn LedgerRpc>,
    contract: Address,
    relayer: Address,
    gas_price: u128,
    gas_multiplier_pct: u64,
    receipt_timeout: Duration,
    poll_interval: Duration,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
    max_scan_blocks: u64,
    /// Next nonce for the relayer. `None` forces a re-read from the node.
    next_nonce: Mutex<Option<u64>>,
}

impl SubmissionClient {
    pub fn new(rpc: Arc<dyn LedgerRpc>, config: &LedgerConfig) -> Self {
        Self {
            rpc,
            contract: config.contract_address,
            relayer: config.relayer_address,
            gas_price: config.gas_price_wei,
            gas_multiplier_pct: config.gas_multiplier_pct.max(MIN_GAS_MULTIPLIER_PCT),
            receipt_timeout: config.receipt_timeout,
            poll_interval: config.receipt_poll_interval,
            max_attempts: config.max_submit_attempts.max(1),
            backoff_base: config.backoff_base,
            backoff_max: config.backoff_max,
            max_scan_blocks: config.max_scan_blocks,
            next_nonce: Mutex::new(None),
        }
    }

    pub fn relayer(&self) -> Address {
        self.relayer
    }

    /// Send and confirm a vote in one call.
    pub async fn submit_vote(&self, call: &VoteCall) -> Result<LedgerReceipt, LedgerError> {
        let sent = self.send_vote(call).await?;
        self.await_receipt(sent.hash).await
    }

    /// Get the vote transaction accepted by the node.
    ///
    /// Only failures that certainly sent nothing are retried. A send whose
    /// fate is unknown returns [`LedgerError::Unconfirmed`] immediately,
    /// since a second transaction could land next to the first.
    pub async fn send_vote(&self, call: &VoteCall) -> Result<SentTransaction, LedgerError> {
        self.send_vote_journaled(call, &()).await
    }

    /// [`send_vote`](Self::send_vote), with every nonce handed to `journal`
    /// before it is sent.
    pub async fn send_vote_journaled(
        &self,
        call: &VoteCall,
        journal: &dyn SendJournal,
    ) -> Result<SentTransaction, LedgerError> {
        let data = abi::encode_cast_vote(call);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.try_send(&data, journal).await {
                Ok(sent) => {
                    info!(
                        "Vote for election {} sent: tx={} nonce={} gas_limit={}",
                        call.election_id, sent.hash, sent.nonce, sent.gas_limit
                    );
                    return Ok(sent);
                }
                Err(SendFailure::Retryable(message)) => {
                    if attempt >= self.max_attempts {
                        return Err(LedgerError::Submission {
                            attempts: attempt,
                            message,
                        });
                    }
                    let delay = self.backoff(attempt);
                    warn!(
                        "Ledger submission attempt {}/{} failed: {}; retrying in {:?}",
                        attempt, self.max_attempts, message, delay
                    );
                    sleep(delay).await;
                }
                Err(SendFailure::Fatal(err)) => return Err(err),
            }
        }
    }

    async fn try_send(
        &self,
        data: &[u8],
        journal: &dyn SendJournal,
    ) -> Result<SentTransaction, SendFailure> {
        let from_block = self
            .rpc
            .block_number()
            .await
            .map_err(SendFailure::retryable)?;

        let mut request = TxRequest {
            from: self.relayer,
            to: self.contract,
            data: data.to_vec(),
            ..Default::default()
        };

        // Estimation is a read, so transport failures are safe to retry.
        let estimate = self.rpc.estimate_gas(&request).await.map_err(|e| match e {
            RpcError::Node { message, .. } => SendFailure::Fatal(LedgerError::GasEstimation(message)),
            other => SendFailure::retryable(other),
        })?;
        let gas_limit = pad_gas(estimate, self.gas_multiplier_pct);
        debug!("Gas estimate {} padded to {}", estimate, gas_limit);

        request.gas = Some(gas_limit);
        request.gas_price = Some(self.gas_price);

        // Held until the node answers so concurrent votes never share a nonce.
        let mut next_nonce = self.next_nonce.lock().await;
        let nonce = match *next_nonce {
            Some(nonce) => nonce,
            None => self
                .rpc
                .transaction_count(self.relayer, BlockTag::Pending)
                .await
                .map_err(SendFailure::retryable)?,
        };
        request.nonce = Some(nonce);

        if !journal.reserve(nonce, from_block).await {
            return Err(SendFailure::Fatal(LedgerError::NotJournaled { nonce }));
        }

        match self.rpc.send_transaction(&request).await {
            Ok(hash) => {
                *next_nonce = Some(nonce + 1);
                Ok(SentTransaction {
                    hash,
                    nonce,
                    from_block,
                    gas_limit,
                })
            }
            Err(err) if err.is_unsent() || err.is_nonce_conflict() => {
                *next_nonce = None;
                Err(SendFailure::retryable(err))
            }
            Err(RpcError::Node { message, .. }) => {
                *next_nonce = None;
                Err(SendFailure::Fatal(LedgerError::Rejected(message)))
            }
            Err(err) => {
                *next_nonce = None;
                Err(SendFailure::Fatal(LedgerError::Unconfirmed {
                    nonce,
                    from_block,
                    message: err.to_string(),
                }))
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exponential = self
            .backoff_base
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let capped = exponential.min(self.backoff_max);
        let jitter_ms = u64::try_from(self.backoff_base.as_millis() / 2).unwrap_or(0);
        if jitter_ms == 0 {
            return capped;
        }
        capped + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Wait for the receipt of `hash`, up to the configured deadline.
    pub async fn await_receipt(&self, hash: TxHash) -> Result<LedgerReceipt, LedgerError> {
        let started = Instant::now();
        match tokio::time::timeout(self.receipt_timeout, self.poll_until_mined(hash)).await {
            Ok(raw) => classify(raw),
            Err(_) => Err(LedgerError::Timeout {
                tx_hash: hash,
                waited: started.elapsed(),
            }),
        }
    }

    async fn poll_until_mined(&self, hash: TxHash) -> RawReceipt {
        loop {
            match self.rpc.transaction_receipt(&hash).await {
                Ok(Some(receipt)) => return receipt,
                Ok(None) => {}
                Err(e) => warn!("Receipt poll for {} failed: {}", hash, e),
            }
            sleep(self.poll_interval).await;
        }
    }

    /// Single receipt lookup. Reverts come back as `success: false`.
    pub async fn check_receipt(&self, hash: &TxHash) -> Result<Option<LedgerReceipt>, RpcError> {
        Ok(self
            .rpc
            .transaction_receipt(hash)
            .await?
            .map(LedgerReceipt::from))
    }

    /// Number of relayer transactions already mined
    pub async fn confirmed_nonce(&self) -> Result<u64, RpcError> {
        self.rpc
            .transaction_count(self.relayer, BlockTag::Latest)
            .await
    }

    /// Find the relayer's mined transaction with `nonce`, scanning forward
    /// from `from_block` for at most the configured number of blocks, and
    /// tell whether it carries `call`.
    pub async fn locate(
        &self,
        call: &VoteCall,
        nonce: u64,
        from_block: u64,
    ) -> Result<NonceStatus, RpcError> {
        let data = abi::encode_cast_vote(call);
        let head = self.rpc.block_number().await?;
        let last = head.min(from_block.saturating_add(self.max_scan_blocks));

        for number in from_block..=last {
            let Some(transactions) = self.rpc.block_transactions(number).await? else {
                break;
            };
            if let Some(tx) = transactions
                .iter()
                .find(|tx| tx.from == self.relayer && tx.nonce == nonce)
            {
                debug!("Located nonce {} in block {}: {}", nonce, number, tx.hash);
                return Ok(if tx.input == data {
                    NonceStatus::Ours(tx.hash)
                } else {
                    NonceStatus::Taken(tx.hash)
                });
            }
        }
        Ok(NonceStatus::Unseen)
    }
}

fn classify(raw: RawReceipt) -> Result<LedgerReceipt, LedgerError> {
    if raw.status {
        Ok(raw.into())
    } else {
        Err(LedgerError::Reverted {
            tx_hash: raw.transaction_hash,
            block_number: raw.block_number,
            gas_used: raw.gas_used,
        })
    }
}
