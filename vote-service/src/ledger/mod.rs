//! Ledger side of the coordinator: JSON-RPC transport, calldata encoding and
//! the submission client.

pub mod abi;
pub mod client;
pub mod error;
pub mod null;
pub mod rpc;
pub mod types;

pub use client::{pad_gas, NonceStatus, SendJournal, SubmissionClient, MIN_GAS_MULTIPLIER_PCT};
pub use error::{ErrorClass, LedgerError, RpcError};
pub use null::NullLedger;
pub use rpc::{JsonRpcClient, LedgerRpc};
pub use types::{Address, LedgerReceipt, SentTransaction, TxHash, VoteCall};
