//! Ledger error types and their retry classification

use std::time::Duration;

use thiserror::Error;

use super::types::TxHash;

/// Failure talking to the JSON-RPC node
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The request never reached the node
    #[error("cannot connect to ledger node: {0}")]
    Connect(String),

    /// The request may or may not have reached the node
    #[error("ledger transport error: {0}")]
    Transport(String),

    #[error("ledger node returned HTTP {0}")]
    Http(u16),

    #[error("ledger node error {code}: {message}")]
    Node { code: i64, message: String },

    #[error("malformed ledger response: {0}")]
    Decode(String),
}

impl RpcError {
    /// True when the node certainly did not process the request.
    pub fn is_unsent(&self) -> bool {
        match self {
            RpcError::Connect(_) => true,
            RpcError::Http(status) => matches!(status, 429 | 502 | 503),
            _ => false,
        }
    }

    /// Node-side rejection caused by a stale nonce.
    pub fn is_nonce_conflict(&self) -> bool {
        match self {
            RpcError::Node { message, .. } => {
                let message = message.to_lowercase();
                message.contains("nonce too low")
                    || message.contains("already known")
                    || message.contains("replacement transaction underpriced")
                    || message.contains("nonce has already been used")
            }
            _ => false,
        }
    }
}

/// How the caller may react to a ledger failure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Nothing reached the chain; retry with backoff is safe
    Transient,
    /// Retrying with the same parameters fails again
    Permanent,
    /// The transaction may still land; never resubmit
    Ambiguous,
}

/// Outcome of a failed vote submission
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("gas estimation rejected by the node: {0}")]
    GasEstimation(String),

    #[error("ledger submission failed after {attempts} attempt(s): {message}")]
    Submission { attempts: u32, message: String },

    #[error("ledger node rejected the transaction: {0}")]
    Rejected(String),

    #[error("send result unknown for nonce {nonce}: {message}")]
    Unconfirmed {
        nonce: u64,
        from_block: u64,
        message: String,
    },

    #[error("no receipt for {tx_hash} after {waited:?}")]
    Timeout { tx_hash: TxHash, waited: Duration },

    #[error("nonce {nonce} could not be journaled; transaction not sent")]
    NotJournaled { nonce: u64 },

    #[error("transaction {tx_hash} reverted in block {block_number}")]
    Reverted {
        tx_hash: TxHash,
        block_number: u64,
        gas_used: u64,
    },
}

impl LedgerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LedgerError::Submission { .. } => ErrorClass::Transient,
            LedgerError::GasEstimation(_)
            | LedgerError::Rejected(_)
            | LedgerError::NotJournaled { .. }
            | LedgerError::Reverted { .. } => ErrorClass::Permanent,
            LedgerError::Unconfirmed { .. } | LedgerError::Timeout { .. } => {
                ErrorClass::Ambiguous
            }
        }
    }

    /// Transaction hash, when the node handed one out
    pub fn tx_hash(&self) -> Option<TxHash> {
        match self {
            LedgerError::Timeout { tx_hash, .. } | LedgerError::Reverted { tx_hash, .. } => {
                Some(*tx_hash)
            }
            _ => None,
        }
    }
}
