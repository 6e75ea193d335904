use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MarketDataError {
    /// The source answered but knows nothing about this token.
    #[error("market not found for token {0}")]
    NotFound(String),

    #[error("market data unavailable: {0}")]
    Unavailable(String),
}

/// Metadata and the current quote for one outcome token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketSnapshot {
    pub market_id: String,
    pub condition_id: String,
    pub question: String,
    pub outcomes: Vec<String>,
    /// Position of `market_id` among the market's outcome tokens.
    pub outcome_index: Option<u32>,
    pub current_price: Decimal,
}

/// Read-only market lookups used when deciding whether to copy a trade.
#[async_trait]
pub trait MarketData: Send + Sync {
    async fn snapshot(&self, market_id: &str) -> Result<MarketSnapshot, MarketDataError>;
}
