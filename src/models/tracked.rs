use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// An address whose trades are replicated. Managed by the operator only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedAddress {
    pub address: String,
    pub added_at: DateTime<Utc>,
    /// Upper bound for a single replicated order, in share base units.
    pub max_position_size: u64,
    /// Fraction of the source trade's shares to replicate.
    pub copy_ratio: Decimal,
}
