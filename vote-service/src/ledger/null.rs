//! Nullable ledger: a deterministic in-memory chain.
//!
//! Swap it in for [`JsonRpcClient`](super::rpc::JsonRpcClient) to run the
//! coordinator without a node. Failures are scripted per call, and mining can
//! be automatic (every accepted transaction is mined in its own block) or
//! manual via [`NullLedger::mine_pending`].

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use super::abi::keccak256;
use super::error::RpcError;
use super::rpc::{BlockTransaction, LedgerRpc};
use super::types::{Address, BlockTag, RawReceipt, TxHash, TxRequest};

pub const DEFAULT_GAS_ESTIMATE: u64 = 100_000;
pub const DEFAULT_GAS_USED: u64 = 85_000;

/// A transaction the null chain has accepted
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NullTransaction {
    pub hash: TxHash,
    pub request: TxRequest,
    pub nonce: u64,
    pub block: Option<u64>,
    pub status: bool,
}

#[derive(Default)]
struct NullChain {
    height: u64,
    nonces: HashMap<Address, u64>,
    transactions: Vec<NullTransaction>,
    gas_estimate: u64,
    gas_used: u64,
    manual_mining: bool,
    reverting: bool,
    estimate_failures: VecDeque<RpcError>,
    send_failures: VecDeque<RpcError>,
    receipt_failures: VecDeque<RpcError>,
    lost_send_responses: u32,
    estimate_calls: u64,
    send_calls: u64,
}

impl NullChain {
    fn mine(&mut self, index: usize) {
        self.height += 1;
        self.transactions[index].block = Some(self.height);
    }
}

pub struct NullLedger {
    chain: Mutex<NullChain>,
}

impl NullLedger {
    pub fn new() -> Self {
        Self {
            chain: Mutex::new(NullChain {
                height: 1,
                gas_estimate: DEFAULT_GAS_ESTIMATE,
                gas_used: DEFAULT_GAS_USED,
                ..Default::default()
            }),
        }
    }

    fn with_chain<T>(&self, f: impl FnOnce(&mut NullChain) -> T) -> T {
        // A poisoned lock only means another test thread panicked.
        let mut chain = self
            .chain
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut chain)
    }

    pub fn set_gas_estimate(&self, gas: u64) {
        self.with_chain(|c| c.gas_estimate = gas);
    }

    /// Leave accepted transactions unmined until [`NullLedger::mine_pending`]
    pub fn set_manual_mining(&self, manual: bool) {
        self.with_chain(|c| c.manual_mining = manual);
    }

    /// Transactions mined from now on fail their status check
    pub fn set_reverting(&self, reverting: bool) {
        self.with_chain(|c| c.reverting = reverting);
    }

    pub fn fail_next_estimate(&self, err: RpcError) {
        self.with_chain(|c| c.estimate_failures.push_back(err));
    }

    pub fn fail_next_send(&self, err: RpcError) {
        self.with_chain(|c| c.send_failures.push_back(err));
    }

    pub fn fail_next_receipt(&self, err: RpcError) {
        self.with_chain(|c| c.receipt_failures.push_back(err));
    }

    /// Accept the next transaction but answer the sender with a transport error
    pub fn lose_next_send_response(&self) {
        self.with_chain(|c| c.lost_send_responses += 1);
    }

    /// Mine every pending transaction, one block each. Returns how many were mined.
    pub fn mine_pending(&self) -> usize {
        self.with_chain(|c| {
            let pending: Vec<usize> = c
                .transactions
                .iter()
                .enumerate()
                .filter(|(_, tx)| tx.block.is_none())
                .map(|(i, _)| i)
                .collect();
            for &index in &pending {
                c.mine(index);
            }
            pending.len()
        })
    }

    pub fn transactions(&self) -> Vec<NullTransaction> {
        self.with_chain(|c| c.transactions.clone())
    }

    pub fn transaction(&self, hash: &TxHash) -> Option<NullTransaction> {
        self.with_chain(|c| c.transactions.iter().find(|tx| tx.hash == *hash).cloned())
    }

    pub fn estimate_calls(&self) -> u64 {
        self.with_chain(|c| c.estimate_calls)
    }

    /// Calls to `send_transaction`, including failed ones
    pub fn send_calls(&self) -> u64 {
        self.with_chain(|c| c.send_calls)
    }
}

impl Default for NullLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerRpc for NullLedger {
    async fn block_number(&self) -> Result<u64, RpcError> {
        Ok(self.with_chain(|c| c.height))
    }

    async fn transaction_count(&self, address: Address, tag: BlockTag) -> Result<u64, RpcError> {
        Ok(self.with_chain(|c| match tag {
            BlockTag::Pending => c.nonces.get(&address).copied().unwrap_or(0),
            BlockTag::Latest => c
                .transactions
                .iter()
                .filter(|tx| tx.request.from == address && tx.block.is_some())
                .count() as u64,
        }))
    }

    async fn estimate_gas(&self, _request: &TxRequest) -> Result<u64, RpcError> {
        self.with_chain(|c| {
            c.estimate_calls += 1;
            match c.estimate_failures.pop_front() {
                Some(err) => Err(err),
                None => Ok(c.gas_estimate),
            }
        })
    }

    async fn send_transaction(&self, request: &TxRequest) -> Result<TxHash, RpcError> {
        self.with_chain(|c| {
            c.send_calls += 1;
            if let Some(err) = c.send_failures.pop_front() {
                return Err(err);
            }

            let expected = c.nonces.get(&request.from).copied().unwrap_or(0);
            let nonce = request.nonce.unwrap_or(expected);
            if nonce < expected {
                return Err(RpcError::Node {
                    code: -32000,
                    message: "nonce too low".to_string(),
                });
            }
            if nonce > expected {
                return Err(RpcError::Node {
                    code: -32000,
                    message: format!("nonce gap: expected {}, got {}", expected, nonce),
                });
            }
            c.nonces.insert(request.from, nonce + 1);

            let mut preimage = request.from.0.to_vec();
            preimage.extend_from_slice(&nonce.to_be_bytes());
            preimage.extend_from_slice(&request.data);
            let hash = TxHash(keccak256(&preimage));

            c.transactions.push(NullTransaction {
                hash,
                request: request.clone(),
                nonce,
                block: None,
                status: !c.reverting,
            });
            if !c.manual_mining {
                let index = c.transactions.len() - 1;
                c.mine(index);
            }

            if c.lost_send_responses > 0 {
                c.lost_send_responses -= 1;
                return Err(RpcError::Transport("response lost".to_string()));
            }
            Ok(hash)
        })
    }

    async fn transaction_receipt(&self, hash: &TxHash) -> Result<Option<RawReceipt>, RpcError> {
        self.with_chain(|c| {
            if let Some(err) = c.receipt_failures.pop_front() {
                return Err(err);
            }
            let gas_used = c.gas_used;
            Ok(c.transactions
                .iter()
                .find(|tx| tx.hash == *hash)
                .and_then(|tx| {
                    tx.block.map(|block| RawReceipt {
                        transaction_hash: tx.hash,
                        block_number: block,
                        gas_used: tx.request.gas.map_or(gas_used, |limit| limit.min(gas_used)),
                        status: tx.status,
                    })
                }))
        })
    }

    async fn block_transactions(
        &self,
        number: u64,
    ) -> Result<Option<Vec<BlockTransaction>>, RpcError> {
        Ok(self.with_chain(|c| {
            if number > c.height {
                return None;
            }
            Some(
                c.transactions
                    .iter()
                    .filter(|tx| tx.block == Some(number))
                    .map(|tx| BlockTransaction {
                        hash: tx.hash,
                        from: tx.request.from,
                        nonce: tx.nonce,
                        input: tx.request.data.clone(),
                    })
                    .collect(),
            )
        }))
    }
}
