//! Ledger-facing value types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Parse a `0x`-prefixed (or bare) hex string into a fixed-size array
fn parse_fixed_hex<const N: usize>(s: &str) -> Result<[u8; N], String> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s).map_err(|e| format!("Invalid hex: {}", e))?;
    if bytes.len() != N {
        return Err(format!("Expected {} bytes, got {}", N, bytes.len()));
    }
    let mut array = [0u8; N];
    array.copy_from_slice(&bytes);
    Ok(array)
}

/// 20-byte account or contract address
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct Address(pub [u8; 20]);

/// 32-byte transaction hash
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct TxHash(pub [u8; 32]);

macro_rules! hex_newtype {
    ($ty:ident, $len:expr) => {
        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_fixed_hex::<$len>(s.trim()).map($ty)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_newtype!(Address, 20);
hex_newtype!(TxHash, 32);

/// The contract call a vote turns into
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoteCall {
    pub election_id: String,
    pub candidate_id: String,
    pub voter: Address,
}

/// Transaction fields sent to the node. `None` fields are left to the node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxRequest {
    pub from: Address,
    pub to: Address,
    pub data: Vec<u8>,
    pub gas: Option<u64>,
    pub gas_price: Option<u128>,
    pub nonce: Option<u64>,
}

/// Receipt as reported by the node, before classification
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawReceipt {
    pub transaction_hash: TxHash,
    pub block_number: u64,
    pub gas_used: u64,
    pub status: bool,
}

/// A transaction the node has accepted into its pool
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SentTransaction {
    pub hash: TxHash,
    pub nonce: u64,
    /// Chain height observed just before sending
    pub from_block: u64,
    pub gas_limit: u64,
}

/// Confirmed outcome of a vote transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerReceipt {
    pub transaction_hash: TxHash,
    pub block_number: u64,
    pub gas_used: u64,
    pub success: bool,
}

impl From<RawReceipt> for LedgerReceipt {
    fn from(raw: RawReceipt) -> Self {
        Self {
            transaction_hash: raw.transaction_hash,
            block_number: raw.block_number,
            gas_used: raw.gas_used,
            success: raw.status,
        }
    }
}

/// Block tag for nonce queries
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockTag {
    Latest,
    Pending,
}

impl BlockTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockTag::Latest => "latest",
            BlockTag::Pending => "pending",
        }
    }
}
