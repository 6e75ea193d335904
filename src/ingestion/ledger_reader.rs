use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use alloy::primitives::{b256, Address, Bytes, B256};
use chrono::DateTime;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use super::rpc::{RpcError, RpcTransport};
use crate::models::{Block, ChainLog, ChainTransaction};

/// `transactionsRoot` of a block with no transactions.
const EMPTY_TRIE_ROOT: B256 =
    b256!("56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421");

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("all {attempted} endpoints failed for {method}: {last}")]
    NodeUnavailable {
        method: String,
        attempted: usize,
        last: String,
    },

    #[error("block {0} not available yet")]
    BlockNotFound(u64),

    #[error("block {0} returned without full transaction bodies")]
    PartialBlock(u64),

    #[error("receipt for {0} not available")]
    ReceiptNotFound(B256),

    #[error("node error: {0}")]
    Rpc(RpcError),

    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },
}

impl ReaderError {
    pub fn is_node_unavailable(&self) -> bool {
        matches!(self, ReaderError::NodeUnavailable { .. })
    }

    fn malformed(what: &'static str, detail: impl ToString) -> Self {
        ReaderError::Malformed {
            what,
            detail: detail.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcBlock {
    number: String,
    hash: String,
    timestamp: String,
    #[serde(default)]
    transactions_root: Option<String>,
    #[serde(default)]
    transactions: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct RpcTransaction {
    hash: String,
    from: String,
    #[serde(default)]
    to: Option<String>,
    input: String,
}

#[derive(Debug, Deserialize)]
struct RpcReceipt {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    logs: Vec<RpcLog>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: String,
    topics: Vec<String>,
    data: String,
    log_index: String,
    transaction_hash: String,
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Reads blocks and receipts from an ordered list of nodes with failover.
///
/// A request starts at the endpoint that last answered successfully. On a
/// connectivity failure or timeout the same request is tried once on each of
/// the remaining endpoints before `NodeUnavailable` is returned.
pub struct LedgerReader {
    endpoints: Vec<Arc<dyn RpcTransport>>,
    current: AtomicUsize,
}

impl LedgerReader {
    pub fn new(endpoints: Vec<Arc<dyn RpcTransport>>) -> Self {
        Self {
            endpoints,
            current: AtomicUsize::new(0),
        }
    }

    /// Endpoint currently preferred for new requests.
    pub fn active_endpoint(&self) -> Option<&str> {
        let idx = self.current.load(Ordering::Relaxed);
        self.endpoints.get(idx).map(|e| e.endpoint())
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, ReaderError> {
        self.request_from(method, params, false).await
    }

    /// Like `request`, but a null result from one node moves on to the next.
    /// Null is returned only when no node had the value.
    async fn request_present(&self, method: &str, params: Value) -> Result<Value, ReaderError> {
        self.request_from(method, params, true).await
    }

    async fn request_from(
        &self,
        method: &str,
        params: Value,
        skip_null: bool,
    ) -> Result<Value, ReaderError> {
        let count = self.endpoints.len();
        let start = self.current.load(Ordering::Relaxed);
        let mut last = String::from("no endpoints configured");
        let mut answered_null = false;

        for offset in 0..count {
            let idx = (start + offset) % count;
            let endpoint = &self.endpoints[idx];

            match endpoint.call(method, params.clone()).await {
                Ok(value) if skip_null && value.is_null() => {
                    tracing::debug!(
                        endpoint = endpoint.endpoint(),
                        method,
                        "RPC endpoint returned null, trying next"
                    );
                    answered_null = true;
                }
                Ok(value) => {
                    if idx != start {
                        tracing::info!(
                            endpoint = endpoint.endpoint(),
                            "Failed over to RPC endpoint"
                        );
                        self.current.store(idx, Ordering::Relaxed);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_endpoint_failure() => {
                    tracing::warn!(
                        endpoint = endpoint.endpoint(),
                        method,
                        error = %e,
                        "RPC endpoint failed, trying next"
                    );
                    last = e.to_string();
                }
                Err(e) => return Err(ReaderError::Rpc(e)),
            }
        }

        if answered_null {
            return Ok(Value::Null);
        }

        Err(ReaderError::NodeUnavailable {
            method: method.to_string(),
            attempted: count,
            last,
        })
    }

    /// Latest block number known to the node.
    pub async fn latest_block(&self) -> Result<u64, ReaderError> {
        let value = self.request("eth_blockNumber", json!([])).await?;
        let hex = value
            .as_str()
            .ok_or_else(|| ReaderError::malformed("block number", &value))?;
        parse_quantity(hex).ok_or_else(|| ReaderError::malformed("block number", hex))
    }

    /// Block `number` with full transaction bodies. A block that comes back
    /// with hashes only, or without its transactions, is an error.
    pub async fn get_block(&self, number: u64) -> Result<Block, ReaderError> {
        let value = self
            .request("eth_getBlockByNumber", json!([format!("0x{number:x}"), true]))
            .await?;

        if value.is_null() {
            return Err(ReaderError::BlockNotFound(number));
        }

        let raw: RpcBlock =
            serde_json::from_value(value).map_err(|e| ReaderError::malformed("block", e))?;
        parse_block(number, raw)
    }

    /// Logs emitted by `tx_hash`. Reverted transactions yield no logs.
    ///
    /// A node that has not indexed the receipt yet answers null; the other
    /// endpoints are asked before `ReceiptNotFound` is returned.
    pub async fn get_receipt_logs(&self, tx_hash: B256) -> Result<Vec<ChainLog>, ReaderError> {
        let value = self
            .request_present("eth_getTransactionReceipt", json!([format!("{tx_hash}")]))
            .await?;

        if value.is_null() {
            return Err(ReaderError::ReceiptNotFound(tx_hash));
        }

        let raw: RpcReceipt =
            serde_json::from_value(value).map_err(|e| ReaderError::malformed("receipt", e))?;

        if raw.status.as_deref() == Some("0x0") {
            return Ok(Vec::new());
        }

        raw.logs.into_iter().map(parse_log).collect()
    }
}

fn parse_block(requested: u64, raw: RpcBlock) -> Result<Block, ReaderError> {
    let number =
        parse_quantity(&raw.number).ok_or_else(|| ReaderError::malformed("block number", &raw.number))?;
    if number != requested {
        return Err(ReaderError::malformed(
            "block",
            format!("asked for {requested}, node returned {number}"),
        ));
    }

    let timestamp = parse_quantity(&raw.timestamp)
        .and_then(|secs| i64::try_from(secs).ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or_else(|| ReaderError::malformed("block timestamp", &raw.timestamp))?;

    let hash = B256::from_str(&raw.hash).map_err(|e| ReaderError::malformed("block hash", e))?;

    let bodies = raw.transactions.ok_or(ReaderError::PartialBlock(number))?;

    if bodies.is_empty() {
        if let Some(root) = raw.transactions_root.as_deref() {
            let root = B256::from_str(root).map_err(|e| ReaderError::malformed("transactions root", e))?;
            if root != EMPTY_TRIE_ROOT {
                return Err(ReaderError::PartialBlock(number));
            }
        }
    }

    let mut transactions = Vec::with_capacity(bodies.len());
    for body in bodies {
        // Hash-only entries mean the node ignored the full-transactions flag.
        if !body.is_object() {
            return Err(ReaderError::PartialBlock(number));
        }
        let tx: RpcTransaction =
            serde_json::from_value(body).map_err(|e| ReaderError::malformed("transaction", e))?;
        transactions.push(parse_transaction(tx)?);
    }

    Ok(Block {
        number,
        hash,
        timestamp,
        transactions,
    })
}

fn parse_transaction(tx: RpcTransaction) -> Result<ChainTransaction, ReaderError> {
    let to = match tx.to.as_deref() {
        Some(to) => Some(Address::from_str(to).map_err(|e| ReaderError::malformed("tx to", e))?),
        None => None,
    };

    Ok(ChainTransaction {
        hash: B256::from_str(&tx.hash).map_err(|e| ReaderError::malformed("tx hash", e))?,
        from: Address::from_str(&tx.from).map_err(|e| ReaderError::malformed("tx from", e))?,
        to,
        input: Bytes::from_str(&tx.input).map_err(|e| ReaderError::malformed("tx input", e))?,
    })
}

fn parse_log(log: RpcLog) -> Result<ChainLog, ReaderError> {
    let topics = log
        .topics
        .iter()
        .map(|t| B256::from_str(t))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ReaderError::malformed("log topic", e))?;

    Ok(ChainLog {
        address: Address::from_str(&log.address).map_err(|e| ReaderError::malformed("log address", e))?,
        topics,
        data: Bytes::from_str(&log.data).map_err(|e| ReaderError::malformed("log data", e))?,
        log_index: parse_quantity(&log.log_index)
            .ok_or_else(|| ReaderError::malformed("log index", &log.log_index))?,
        tx_hash: B256::from_str(&log.transaction_hash)
            .map_err(|e| ReaderError::malformed("log tx hash", e))?,
    })
}

/// Parse a JSON-RPC quantity (`"0x1b4"`).
pub fn parse_quantity(hex: &str) -> Option<u64> {
    let digits = hex.strip_prefix("0x")?;
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}
