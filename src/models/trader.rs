use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Rolling-window statistics for one address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraderStats {
    pub address: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// USDC notional traded inside the window.
    pub total_volume: Decimal,
    pub trade_count: u64,
    pub wins: u64,
    pub losses: u64,
}

impl TraderStats {
    /// Wins over closed trades; zero when nothing has been closed.
    pub fn win_rate(&self) -> Decimal {
        let closed = self.wins + self.losses;
        if closed == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.wins) / Decimal::from(closed)
    }
}

/// Ranking metric for `TraderLedger::top`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RankBy {
    Volume,
    Count,
    WinRate,
}

impl FromStr for RankBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "volume" => Ok(RankBy::Volume),
            "count" => Ok(RankBy::Count),
            "win_rate" | "winrate" => Ok(RankBy::WinRate),
            other => Err(format!("unknown ranking metric: {other}")),
        }
    }
}

impl fmt::Display for RankBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RankBy::Volume => write!(f, "volume"),
            RankBy::Count => write!(f, "count"),
            RankBy::WinRate => write!(f, "win_rate"),
        }
    }
}
