pub mod block;
pub mod order;
pub mod trade;
pub mod tracked;
pub mod trader;

pub use block::{Block, ChainLog, ChainTransaction};
pub use order::{ReplicationOrder, SubmissionResult};
pub use trade::{TradeRecord, TradeRef};
pub use tracked::TrackedAddress;
pub use trader::{RankBy, TraderStats};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome-token amounts and USDC amounts on the exchange both carry 6 decimals.
pub const SHARE_DECIMALS: u32 = 6;

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn from_api_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" | "0" => Some(Side::Buy),
            "SELL" | "1" => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

// ---------------------------------------------------------------------------
// Cursor — last block fully processed by the pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub last_processed_block: u64,
}

impl Cursor {
    pub fn new(last_processed_block: u64) -> Self {
        Self { last_processed_block }
    }

    pub fn next_block(&self) -> u64 {
        self.last_processed_block + 1
    }
}

// ---------------------------------------------------------------------------
// Addresses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid address: {0}")]
pub struct InvalidAddress(pub String);

/// Normalize an address to lower-case `0x`-prefixed 40-hex form.
pub fn normalize_address(raw: &str) -> Result<String, InvalidAddress> {
    let trimmed = raw.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(InvalidAddress(raw.to_string()));
    }

    Ok(format!("0x{}", hex.to_lowercase()))
}

/// Shorten an address or hash for log lines: `0xabcdef12…`.
pub fn short(s: &str) -> &str {
    &s[..10.min(s.len())]
}
