use std::collections::HashMap;
use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::Mutex;

use super::market_data::{MarketData, MarketDataError, MarketSnapshot};

pub const GAMMA_API_BASE: &str = "https://gamma-api.polymarket.com";

/// Quotes move; metadata does not. Cached snapshots are reused for this long.
const CACHE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize)]
pub struct GammaMarket {
    #[serde(alias = "conditionId")]
    pub condition_id: String,
    #[serde(default)]
    pub question: String,
    /// JSON array string of outcome labels, e.g. `["Yes","No"]`.
    #[serde(default)]
    pub outcomes: Option<String>,
    /// JSON array string of prices aligned with `outcomes`.
    #[serde(default, alias = "outcomePrices")]
    pub outcome_prices: Option<String>,
    /// JSON array string of ERC-1155 token ids aligned with `outcomes`.
    #[serde(default, alias = "clobTokenIds")]
    pub clob_token_ids: Option<String>,
}

fn parse_string_array(raw: Option<&str>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
        .unwrap_or_default()
}

impl GammaMarket {
    pub fn parse_token_ids(&self) -> Vec<String> {
        parse_string_array(self.clob_token_ids.as_deref())
    }

    pub fn parse_outcomes(&self) -> Vec<String> {
        parse_string_array(self.outcomes.as_deref())
    }

    pub fn parse_prices(&self) -> Vec<Decimal> {
        parse_string_array(self.outcome_prices.as_deref())
            .iter()
            .filter_map(|p| Decimal::from_str(p).ok())
            .collect()
    }

    /// Build the snapshot for one of this market's tokens.
    pub fn snapshot_for(&self, token_id: &str) -> Result<MarketSnapshot, MarketDataError> {
        let index = self
            .parse_token_ids()
            .iter()
            .position(|t| t == token_id)
            .ok_or_else(|| MarketDataError::NotFound(token_id.to_string()))?;

        let current_price = self.parse_prices().get(index).copied().ok_or_else(|| {
            MarketDataError::Unavailable(format!("no price for outcome {index} of {token_id}"))
        })?;

        Ok(MarketSnapshot {
            market_id: token_id.to_string(),
            condition_id: self.condition_id.clone(),
            question: self.question.clone(),
            outcomes: self.parse_outcomes(),
            outcome_index: u32::try_from(index).ok(),
            current_price,
        })
    }
}

/// Snapshots keyed by token id. Expired entries are pruned on every insert,
/// so the map never holds more than the tokens seen within one TTL.
#[derive(Debug, Default)]
struct SnapshotCache {
    entries: HashMap<String, (Instant, MarketSnapshot)>,
}

impl SnapshotCache {
    fn get(&self, token_id: &str, now: Instant) -> Option<MarketSnapshot> {
        self.entries
            .get(token_id)
            .filter(|(at, _)| now.saturating_duration_since(*at) < CACHE_TTL)
            .map(|(_, snap)| snap.clone())
    }

    fn insert(&mut self, token_id: &str, snapshot: MarketSnapshot, now: Instant) {
        self.entries
            .retain(|_, (at, _)| now.saturating_duration_since(*at) < CACHE_TTL);
        self.entries.insert(token_id.to_string(), (now, snapshot));
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// `MarketData` backed by the public Gamma API.
#[derive(Debug)]
pub struct GammaMarketData {
    http: Client,
    base_url: String,
    cache: Mutex<SnapshotCache>,
}

impl GammaMarketData {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: Client::builder().timeout(timeout).build()?,
            base_url: base_url.into(),
            cache: Mutex::new(SnapshotCache::default()),
        })
    }

    async fn fetch(&self, token_id: &str) -> Result<Vec<GammaMarket>, reqwest::Error> {
        let url = format!("{}/markets", self.base_url.trim_end_matches('/'));
        self.http
            .get(&url)
            .query(&[("clob_token_ids", token_id)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}

#[async_trait]
impl MarketData for GammaMarketData {
    async fn snapshot(&self, market_id: &str) -> Result<MarketSnapshot, MarketDataError> {
        if let Some(snap) = self.cache.lock().await.get(market_id, Instant::now()) {
            return Ok(snap);
        }

        let markets = self.fetch(market_id).await.map_err(|e| {
            if e.status().is_some_and(|s| s.as_u16() == 404) {
                MarketDataError::NotFound(market_id.to_string())
            } else {
                MarketDataError::Unavailable(e.to_string())
            }
        })?;

        let snapshot = markets
            .iter()
            .find_map(|m| m.snapshot_for(market_id).ok())
            .ok_or_else(|| MarketDataError::NotFound(market_id.to_string()))?;

        tracing::debug!(
            market_id,
            outcome_index = ?snapshot.outcome_index,
            price = %snapshot.current_price,
            "Fetched market snapshot"
        );

        let mut cache = self.cache.lock().await;
        cache.insert(market_id, snapshot.clone(), Instant::now());
        tracing::trace!(cached = cache.len(), "Market snapshot cached");

        Ok(snapshot)
    }
}
