use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::{Side, TradeRef, SHARE_DECIMALS};

/// An order derived from a tracked address's trade.
///
/// Built once by the copy engine and never changed afterwards; each submission
/// attempt is a separate unsigned payload derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationOrder {
    pub id: Uuid,
    pub source_trade_ref: TradeRef,
    /// The tracked address being copied.
    pub source_address: String,
    pub market_id: String,
    pub outcome_index: u32,
    pub side: Side,
    /// Share base units.
    pub size: u64,
    pub limit_price: Decimal,
    pub dry_run: bool,
    pub created_at: DateTime<Utc>,
}

impl ReplicationOrder {
    /// USDC value of the order at its limit price.
    pub fn notional(&self) -> Decimal {
        Decimal::from(self.size) / Decimal::from(10u64.pow(SHARE_DECIMALS)) * self.limit_price
    }
}

/// Outcome of handing an order to the execution gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SubmissionResult {
    Accepted {
        tx_hash: Option<String>,
        attempts: u32,
    },
    Rejected {
        reason: String,
        attempts: u32,
    },
    Error {
        reason: String,
        attempts: u32,
    },
}

impl SubmissionResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmissionResult::Accepted { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            SubmissionResult::Accepted { attempts, .. }
            | SubmissionResult::Rejected { attempts, .. }
            | SubmissionResult::Error { attempts, .. } => *attempts,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SubmissionResult::Accepted { .. } => "accepted",
            SubmissionResult::Rejected { .. } => "rejected",
            SubmissionResult::Error { .. } => "error",
        }
    }
}

impl fmt::Display for SubmissionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmissionResult::Accepted { tx_hash: Some(h), .. } => write!(f, "accepted ({h})"),
            SubmissionResult::Accepted { tx_hash: None, .. } => write!(f, "accepted (simulated)"),
            SubmissionResult::Rejected { reason, .. } => write!(f, "rejected: {reason}"),
            SubmissionResult::Error { reason, .. } => write!(f, "error: {reason}"),
        }
    }
}
