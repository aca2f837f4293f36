//! JSON-RPC transport to an Ethereum-compatible node

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::error::RpcError;
use super::types::{Address, BlockTag, RawReceipt, TxHash, TxRequest};

/// Transaction entry of a block, reduced to what nonce lookups need
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockTransaction {
    pub hash: TxHash,
    pub from: Address,
    pub nonce: u64,
    pub input: Vec<u8>,
}

/// The node operations the submission client relies on
#[async_trait]
pub trait LedgerRpc: Send + Sync {
    async fn block_number(&self) -> Result<u64, RpcError>;

    async fn transaction_count(&self, address: Address, tag: BlockTag) -> Result<u64, RpcError>;

    async fn estimate_gas(&self, request: &TxRequest) -> Result<u64, RpcError>;

    /// Hand the transaction to the node, which signs it with the `from` account
    async fn send_transaction(&self, request: &TxRequest) -> Result<TxHash, RpcError>;

    /// `None` while the transaction is unknown or not yet mined
    async fn transaction_receipt(&self, hash: &TxHash) -> Result<Option<RawReceipt>, RpcError>;

    /// `None` when the block does not exist yet
    async fn block_transactions(
        &self,
        number: u64,
    ) -> Result<Option<Vec<BlockTransaction>>, RpcError>;
}

pub fn quantity(n: u64) -> String {
    format!("{:#x}", n)
}

pub fn parse_quantity(s: &str) -> Result<u64, RpcError> {
    let digits = s
        .strip_prefix("0x")
        .ok_or_else(|| RpcError::Decode(format!("quantity without 0x prefix: {}", s)))?;
    if digits.is_empty() {
        return Err(RpcError::Decode("empty quantity".to_string()));
    }
    u64::from_str_radix(digits, 16).map_err(|e| RpcError::Decode(format!("{}: {}", s, e)))
}

pub fn parse_data(s: &str) -> Result<Vec<u8>, RpcError> {
    let digits = s
        .strip_prefix("0x")
        .ok_or_else(|| RpcError::Decode(format!("data without 0x prefix: {}", s)))?;
    hex::decode(digits).map_err(|e| RpcError::Decode(format!("data: {}", e)))
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptJson {
    transaction_hash: TxHash,
    block_number: Option<String>,
    gas_used: String,
    status: Option<String>,
}

#[derive(Deserialize)]
struct BlockJson {
    transactions: Vec<BlockTransactionJson>,
}

#[derive(Deserialize)]
struct BlockTransactionJson {
    hash: TxHash,
    from: Address,
    nonce: String,
    input: String,
}

fn map_reqwest(e: reqwest::Error) -> RpcError {
    if e.is_connect() || e.is_builder() {
        RpcError::Connect(e.to_string())
    } else if e.is_decode() {
        RpcError::Decode(e.to_string())
    } else {
        RpcError::Transport(e.to_string())
    }
}

fn tx_json(request: &TxRequest) -> Value {
    let mut tx = json!({
        "from": request.from.to_string(),
        "to": request.to.to_string(),
        "data": format!("0x{}", hex::encode(&request.data)),
    });
    if let Some(gas) = request.gas {
        tx["gas"] = json!(quantity(gas));
    }
    if let Some(price) = request.gas_price {
        tx["gasPrice"] = json!(format!("{:#x}", price));
    }
    if let Some(nonce) = request.nonce {
        tx["nonce"] = json!(quantity(nonce));
    }
    tx
}

/// Production [`LedgerRpc`] over HTTP
pub struct JsonRpcClient {
    http: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    /// Every request is bounded by `timeout`.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, RpcError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Connect(e.to_string()))?;
        Ok(Self {
            http,
            url: url.to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!("JSON-RPC {} id={}", method, id);

        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            return Err(RpcError::Http(status.as_u16()));
        }

        let envelope: RpcResponse = response.json().await.map_err(map_reqwest)?;
        if let Some(err) = envelope.error {
            return Err(RpcError::Node {
                code: err.code,
                message: err.message,
            });
        }

        serde_json::from_value(envelope.result.unwrap_or(Value::Null))
            .map_err(|e| RpcError::Decode(format!("{}: {}", method, e)))
    }
}

#[async_trait]
impl LedgerRpc for JsonRpcClient {
    async fn block_number(&self) -> Result<u64, RpcError> {
        let n: String = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&n)
    }

    async fn transaction_count(&self, address: Address, tag: BlockTag) -> Result<u64, RpcError> {
        let n: String = self
            .call(
                "eth_getTransactionCount",
                json!([address.to_string(), tag.as_str()]),
            )
            .await?;
        parse_quantity(&n)
    }

    async fn estimate_gas(&self, request: &TxRequest) -> Result<u64, RpcError> {
        let n: String = self.call("eth_estimateGas", json!([tx_json(request)])).await?;
        parse_quantity(&n)
    }

    async fn send_transaction(&self, request: &TxRequest) -> Result<TxHash, RpcError> {
        self.call("eth_sendTransaction", json!([tx_json(request)]))
            .await
    }

    async fn transaction_receipt(&self, hash: &TxHash) -> Result<Option<RawReceipt>, RpcError> {
        let receipt: Option<ReceiptJson> = self
            .call("eth_getTransactionReceipt", json!([hash.to_string()]))
            .await?;

        let Some(receipt) = receipt else {
            return Ok(None);
        };
        // Some nodes return a receipt object for pending transactions
        let Some(block_number) = receipt.block_number else {
            return Ok(None);
        };
        let status = receipt
            .status
            .ok_or_else(|| RpcError::Decode("receipt without status field".to_string()))?;

        Ok(Some(RawReceipt {
            transaction_hash: receipt.transaction_hash,
            block_number: parse_quantity(&block_number)?,
            gas_used: parse_quantity(&receipt.gas_used)?,
            status: parse_quantity(&status)? == 1,
        }))
    }

    async fn block_transactions(
        &self,
        number: u64,
    ) -> Result<Option<Vec<BlockTransaction>>, RpcError> {
        let block: Option<BlockJson> = self
            .call("eth_getBlockByNumber", json!([quantity(number), true]))
            .await?;

        block
            .map(|b| {
                b.transactions
                    .into_iter()
                    .map(|tx| {
                        Ok(BlockTransaction {
                            hash: tx.hash,
                            from: tx.from,
                            nonce: parse_quantity(&tx.nonce)?,
                            input: parse_data(&tx.input)?,
                        })
                    })
                    .collect()
            })
            .transpose()
    }
}
