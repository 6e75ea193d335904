use std::collections::{BTreeSet, HashMap};

use alloy::primitives::{Address, B256, U256};
use alloy::sol_types::{SolCall, SolEvent};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{Block, ChainLog, ChainTransaction, Side, TradeRecord};

/// CTF Exchange contract on Polygon.
pub const CTF_EXCHANGE: &str = "0x4bfb41d5b3570defd03c39a9a4d8de6bd8b8982e";

/// Prices are kept to the exchange's collateral precision.
const PRICE_DP: u32 = 6;

pub mod abi {
    alloy::sol! {
        struct Order {
            uint256 salt;
            address maker;
            address signer;
            address taker;
            uint256 tokenId;
            uint256 makerAmount;
            uint256 takerAmount;
            uint256 expiration;
            uint256 nonce;
            uint256 feeRateBps;
            uint8 side;
            uint8 signatureType;
            bytes signature;
        }

        function fillOrder(Order order, uint256 fillAmount);
        function fillOrders(Order[] orders, uint256[] fillAmounts);
        function matchOrders(
            Order takerOrder,
            Order[] makerOrders,
            uint256 takerFillAmount,
            uint256[] makerFillAmounts
        );

        event OrderFilled(
            bytes32 indexed orderHash,
            address indexed maker,
            address indexed taker,
            uint256 makerAssetId,
            uint256 takerAssetId,
            uint256 makerAmountFilled,
            uint256 takerAmountFilled,
            uint256 fee
        );
    }
}

/// Why a transaction produced no records even though it targeted the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeSkip {
    #[error("OrderFilled log {log_index} malformed: {reason}")]
    MalformedLog { log_index: u64, reason: String },

    #[error("fill call {selector} undecodable and no fill logs: {reason}")]
    UndecodableInput { selector: String, reason: String },

    #[error("receipt missing")]
    MissingReceipt,
}

/// Output of decoding one block.
#[derive(Debug, Default)]
pub struct DecodedBlock {
    pub records: Vec<TradeRecord>,
    pub skipped: Vec<(B256, DecodeSkip)>,
}

/// Turns exchange transactions and their OrderFilled logs into `TradeRecord`s.
///
/// Logs are the source of truth: a fill call's input only tells us which
/// orders were submitted, while batched and matched calls emit one log per
/// actual fill. The decoded input is used to cross-check the log makers.
#[derive(Debug, Clone)]
pub struct TradeDecoder {
    exchange: Address,
}

impl TradeDecoder {
    pub fn new(exchange: Address) -> Self {
        Self { exchange }
    }

    pub fn exchange(&self) -> Address {
        self.exchange
    }

    /// Whether `tx` was sent to the exchange contract.
    pub fn targets(&self, tx: &ChainTransaction) -> bool {
        tx.to == Some(self.exchange)
    }

    /// Decode every exchange transaction in `block`. Receipt logs are looked up
    /// by transaction hash. A transaction that cannot be decoded is recorded
    /// in `skipped` and the rest of the block is still processed.
    pub fn decode_block(&self, block: &Block, receipts: &HashMap<B256, Vec<ChainLog>>) -> DecodedBlock {
        let mut out = DecodedBlock::default();

        for tx in block.transactions.iter().filter(|tx| self.targets(tx)) {
            let Some(logs) = receipts.get(&tx.hash) else {
                out.skipped.push((tx.hash, DecodeSkip::MissingReceipt));
                continue;
            };

            match self.decode_transaction(block.number, block.timestamp, tx, logs) {
                Ok(records) => out.records.extend(records),
                Err(skip) => {
                    tracing::warn!(
                        block = block.number,
                        tx = %tx.hash,
                        reason = %skip,
                        "Skipped: undecodable"
                    );
                    out.skipped.push((tx.hash, skip));
                }
            }
        }

        out
    }

    /// Decode one transaction against its receipt logs.
    pub fn decode_transaction(
        &self,
        block_number: u64,
        timestamp: DateTime<Utc>,
        tx: &ChainTransaction,
        logs: &[ChainLog],
    ) -> Result<Vec<TradeRecord>, DecodeSkip> {
        let mut records = Vec::new();
        for log in logs {
            if let Some(record) = self.decode_log(log, block_number, timestamp)? {
                records.push(record);
            }
        }

        match decode_call_makers(&tx.input) {
            CallMakers::NotAFill => {}
            CallMakers::Undecodable { selector, reason } => {
                if records.is_empty() {
                    return Err(DecodeSkip::UndecodableInput { selector, reason });
                }
                tracing::debug!(
                    tx = %tx.hash,
                    selector = %selector,
                    "Fill input undecodable, using logs"
                );
            }
            CallMakers::Fill(makers) => {
                let from_logs: BTreeSet<String> =
                    records.iter().map(|r| r.maker_address.clone()).collect();
                let from_call: BTreeSet<String> = makers.iter().map(address_str).collect();
                if !from_logs.is_subset(&from_call) {
                    tracing::debug!(
                        tx = %tx.hash,
                        log_makers = from_logs.len(),
                        call_makers = from_call.len(),
                        "Fill input disagrees with logs, logs are authoritative"
                    );
                }
            }
        }

        Ok(records)
    }

    /// Decode a single log. Returns `Ok(None)` for logs that are not
    /// OrderFilled events emitted by the exchange.
    pub fn decode_log(
        &self,
        log: &ChainLog,
        block_number: u64,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<TradeRecord>, DecodeSkip> {
        if log.address != self.exchange
            || log.topics.first() != Some(&abi::OrderFilled::SIGNATURE_HASH)
        {
            return Ok(None);
        }

        let malformed = |reason: String| DecodeSkip::MalformedLog {
            log_index: log.log_index,
            reason,
        };

        let event = abi::OrderFilled::decode_raw_log(log.topics.iter().copied(), &log.data)
            .map_err(|e| malformed(e.to_string()))?;

        // One leg of every fill is collateral, identified by asset id 0.
        let (side, token_id, shares, collateral) =
            match (event.makerAssetId.is_zero(), event.takerAssetId.is_zero()) {
                (true, false) => (
                    Side::Buy,
                    event.takerAssetId,
                    event.takerAmountFilled,
                    event.makerAmountFilled,
                ),
                (false, true) => (
                    Side::Sell,
                    event.makerAssetId,
                    event.makerAmountFilled,
                    event.takerAmountFilled,
                ),
                _ => return Err(malformed("neither or both legs are collateral".into())),
            };

        let shares = to_u64(shares).ok_or_else(|| malformed("share amount overflows".into()))?;
        let collateral =
            to_u64(collateral).ok_or_else(|| malformed("collateral amount overflows".into()))?;
        if shares == 0 {
            return Err(malformed("zero share fill".into()));
        }

        let price = (Decimal::from(collateral) / Decimal::from(shares)).round_dp(PRICE_DP);

        Ok(Some(TradeRecord {
            block_number,
            tx_hash: format!("{}", log.tx_hash),
            log_index: log.log_index,
            maker_address: address_str(&event.maker),
            taker_address: address_str(&event.taker),
            market_id: token_id.to_string(),
            outcome_index: None,
            shares,
            price,
            side,
            timestamp,
        }))
    }
}

enum CallMakers {
    NotAFill,
    Undecodable { selector: String, reason: String },
    Fill(Vec<Address>),
}

fn decode_call_makers(input: &[u8]) -> CallMakers {
    let Some(selector) = input.get(..4) else {
        return CallMakers::NotAFill;
    };

    let decoded = if selector == abi::fillOrderCall::SELECTOR {
        abi::fillOrderCall::abi_decode(input).map(|c| vec![c.order.maker])
    } else if selector == abi::fillOrdersCall::SELECTOR {
        abi::fillOrdersCall::abi_decode(input)
            .map(|c| c.orders.iter().map(|o| o.maker).collect())
    } else if selector == abi::matchOrdersCall::SELECTOR {
        abi::matchOrdersCall::abi_decode(input).map(|c| {
            std::iter::once(c.takerOrder.maker)
                .chain(c.makerOrders.iter().map(|o| o.maker))
                .collect()
        })
    } else {
        return CallMakers::NotAFill;
    };

    match decoded {
        Ok(makers) => CallMakers::Fill(makers),
        Err(e) => CallMakers::Undecodable {
            selector: format!("0x{}", alloy::primitives::hex::encode(selector)),
            reason: e.to_string(),
        },
    }
}

fn address_str(address: &Address) -> String {
    address.to_string().to_lowercase()
}

fn to_u64(value: U256) -> Option<u64> {
    if value > U256::from(u64::MAX) {
        return None;
    }
    Some(value.as_limbs()[0])
}
