use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{short, Side, SHARE_DECIMALS};

/// Unique identity of a decoded trade: the emitting log inside its transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TradeRef {
    pub tx_hash: String,
    pub log_index: u64,
}

impl fmt::Display for TradeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tx_hash, self.log_index)
    }
}

/// A single fill against the exchange contract, as seen from the maker's side.
///
/// `market_id` is the ERC-1155 outcome token id in decimal form. `outcome_index`
/// is only known once the token has been resolved against market metadata, so
/// the decoder always leaves it empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub block_number: u64,
    pub tx_hash: String,
    pub log_index: u64,
    pub maker_address: String,
    pub taker_address: String,
    pub market_id: String,
    pub outcome_index: Option<u32>,
    /// Outcome tokens filled, in base units (6 decimals).
    pub shares: u64,
    /// USDC per outcome token, between 0 and 1.
    pub price: Decimal,
    /// Direction of the maker.
    pub side: Side,
    pub timestamp: DateTime<Utc>,
}

impl TradeRecord {
    pub fn trade_ref(&self) -> TradeRef {
        TradeRef {
            tx_hash: self.tx_hash.clone(),
            log_index: self.log_index,
        }
    }

    /// Shares expressed in whole outcome tokens.
    pub fn share_amount(&self) -> Decimal {
        Decimal::from(self.shares) / Decimal::from(10u64.pow(SHARE_DECIMALS))
    }

    /// USDC value of the fill.
    pub fn notional(&self) -> Decimal {
        self.share_amount() * self.price
    }

    /// Direction of `address` in this trade, if it is one of the counterparties.
    pub fn side_for(&self, address: &str) -> Option<Side> {
        if self.maker_address.eq_ignore_ascii_case(address) {
            Some(self.side)
        } else if self.taker_address.eq_ignore_ascii_case(address) {
            Some(self.side.opposite())
        } else {
            None
        }
    }
}

impl fmt::Display for TradeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Trade: block={} tx={} maker={} taker={} side={} shares={} price={}",
            self.block_number,
            short(&self.tx_hash),
            short(&self.maker_address),
            short(&self.taker_address),
            self.side,
            self.share_amount(),
            self.price,
        )
    }
}
