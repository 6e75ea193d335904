use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::{Store, StoreError};
use crate::models::{short, ReplicationOrder, TrackedAddress, TradeRecord};
use crate::polymarket::{MarketData, MarketDataError};
use crate::registry::TrackedRegistry;

use super::position_sizer;
use super::risk_manager::{
    self, ExposureBook, ExposureLimits, ExposureViolation, PriceLimits, PriceViolation, Reservation,
};

/// Configuration for the copy engine.
#[derive(Debug, Clone)]
pub struct CopyEngineConfig {
    pub price_limits: PriceLimits,
    pub exposure_limits: ExposureLimits,
    pub dry_run: bool,
}

impl Default for CopyEngineConfig {
    fn default() -> Self {
        Self {
            price_limits: PriceLimits::default(),
            exposure_limits: ExposureLimits::default(),
            dry_run: true,
        }
    }
}

/// Why a trade by a tracked address was not copied.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("proposed size rounds to zero")]
    ZeroSize,

    #[error("stale signal: current price {current} outside [{low}, {high}]")]
    StaleSignal {
        current: Decimal,
        low: Decimal,
        high: Decimal,
    },

    #[error("unknown market {0}")]
    UnknownMarket(String),

    #[error("market data unavailable: {0}")]
    MarketDataUnavailable(String),

    #[error("price {0} outside the tradable range")]
    PriceOutOfRange(Decimal),

    #[error("daily order limit of {0} reached")]
    DailyOrderLimit(u32),

    #[error("daily volume limit of {0} USDC reached")]
    DailyVolumeLimit(Decimal),

    #[error("total exposure limit of {0} USDC reached")]
    ExposureLimit(Decimal),

    /// An order for this trade and address was already journaled and has a
    /// recorded submission outcome.
    #[error("order already emitted for this trade")]
    Duplicate,
}

impl From<ExposureViolation> for Rejection {
    fn from(v: ExposureViolation) -> Self {
        match v {
            ExposureViolation::DailyOrders { max, .. } => Rejection::DailyOrderLimit(max),
            ExposureViolation::DailyVolume { max, .. } => Rejection::DailyVolumeLimit(max),
            ExposureViolation::TotalExposure { max, .. } => Rejection::ExposureLimit(max),
        }
    }
}

impl Rejection {
    pub fn is_portfolio_limit(&self) -> bool {
        matches!(
            self,
            Rejection::DailyOrderLimit(_) | Rejection::DailyVolumeLimit(_) | Rejection::ExposureLimit(_)
        )
    }

    /// Stable label for metrics and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::ZeroSize => "zero_size",
            Rejection::StaleSignal { .. } => "stale_signal",
            Rejection::UnknownMarket(_) => "unknown_market",
            Rejection::MarketDataUnavailable(_) => "market_data_unavailable",
            Rejection::PriceOutOfRange(_) => "price_out_of_range",
            Rejection::DailyOrderLimit(_) => "daily_order_limit",
            Rejection::DailyVolumeLimit(_) => "daily_volume_limit",
            Rejection::ExposureLimit(_) => "exposure_limit",
            Rejection::Duplicate => "duplicate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyOutcome {
    /// Neither party is tracked.
    NotTracked,
    Rejected {
        source_address: String,
        rejection: Rejection,
    },
    Emit(ReplicationOrder),
}

impl fmt::Display for CopyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopyOutcome::NotTracked => write!(f, "not tracked"),
            CopyOutcome::Rejected { rejection, .. } => write!(f, "rejected: {rejection}"),
            CopyOutcome::Emit(order) => write!(f, "emit {} {}", order.side, order.size),
        }
    }
}

/// Decides whether and how to replicate each decoded trade.
pub struct CopyEngine {
    config: CopyEngineConfig,
    market_data: Arc<dyn MarketData>,
    store: Arc<dyn Store>,
    book: Mutex<ExposureBook>,
}

impl CopyEngine {
    pub fn new(
        config: CopyEngineConfig,
        market_data: Arc<dyn MarketData>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            config,
            market_data,
            store,
            book: Mutex::new(ExposureBook::default()),
        }
    }

    pub fn dry_run(&self) -> bool {
        self.config.dry_run
    }

    /// Totals of emitted orders against the exposure limits.
    pub async fn exposure(&self) -> ExposureBook {
        self.book.lock().await.clone()
    }

    /// Evaluate one trade against the registry. Only a failed journal read or
    /// write is an error; every other outcome is a decision.
    ///
    /// A trade whose order is already journaled but has no recorded
    /// submission outcome yields that journaled order again, so a cycle that
    /// failed between journaling and submission is completed on replay.
    pub async fn evaluate(
        &self,
        record: &TradeRecord,
        registry: &TrackedRegistry,
    ) -> Result<CopyOutcome, StoreError> {
        // Maker wins when both sides are tracked.
        let Some(tracked) = registry
            .get(&record.maker_address)
            .or_else(|| registry.get(&record.taker_address))
        else {
            return Ok(CopyOutcome::NotTracked);
        };

        let outcome = match self.decide(record, tracked).await {
            Ok((order, reservation)) => match self.store.journal_order(&order).await {
                Ok(true) => CopyOutcome::Emit(order),
                Ok(false) => {
                    self.book.lock().await.release(reservation);
                    self.resume_or_duplicate(record, &order).await?
                }
                Err(e) => {
                    self.book.lock().await.release(reservation);
                    return Err(e);
                }
            },
            // A limit must not hold back an order journaled before the limit was hit.
            Err(rejection) if rejection.is_portfolio_limit() => {
                match self.pending(record, &tracked.address).await? {
                    Some(resumed) => resumed,
                    None => CopyOutcome::Rejected {
                        source_address: tracked.address.clone(),
                        rejection,
                    },
                }
            }
            Err(rejection) => CopyOutcome::Rejected {
                source_address: tracked.address.clone(),
                rejection,
            },
        };

        match &outcome {
            CopyOutcome::Emit(order) => {
                counter!("orders_emitted_total").increment(1);
                tracing::info!(
                    trade = %record.trade_ref(),
                    source = short(&order.source_address),
                    market = %order.market_id,
                    side = %order.side,
                    size = order.size,
                    limit_price = %order.limit_price,
                    dry_run = order.dry_run,
                    "Replication order emitted"
                );
            }
            CopyOutcome::Rejected {
                source_address,
                rejection,
            } => {
                counter!("copy_rejections_total", "reason" => rejection.reason()).increment(1);
                match rejection {
                    Rejection::UnknownMarket(_) | Rejection::MarketDataUnavailable(_) => {
                        tracing::warn!(
                            trade = %record.trade_ref(),
                            source = short(source_address),
                            reason = rejection.reason(),
                            "Copy rejected: {rejection}"
                        );
                    }
                    _ => {
                        tracing::info!(
                            trade = %record.trade_ref(),
                            source = short(source_address),
                            reason = rejection.reason(),
                            "Copy rejected: {rejection}"
                        );
                    }
                }
            }
            CopyOutcome::NotTracked => {}
        }

        Ok(outcome)
    }

    async fn resume_or_duplicate(
        &self,
        record: &TradeRecord,
        order: &ReplicationOrder,
    ) -> Result<CopyOutcome, StoreError> {
        Ok(match self.pending(record, &order.source_address).await? {
            Some(resumed) => resumed,
            None => CopyOutcome::Rejected {
                source_address: order.source_address.clone(),
                rejection: Rejection::Duplicate,
            },
        })
    }

    /// The journaled order for this trade if it never got a submission outcome.
    async fn pending(
        &self,
        record: &TradeRecord,
        source_address: &str,
    ) -> Result<Option<CopyOutcome>, StoreError> {
        let pending = self
            .store
            .pending_order(&record.trade_ref(), source_address)
            .await?;

        Ok(pending.map(|journaled| {
            tracing::info!(
                trade = %record.trade_ref(),
                source = short(&journaled.source_address),
                order_id = %journaled.id,
                "Resuming journaled order without a submission outcome"
            );
            CopyOutcome::Emit(journaled)
        }))
    }

    async fn decide(
        &self,
        record: &TradeRecord,
        tracked: &TrackedAddress,
    ) -> Result<(ReplicationOrder, Reservation), Rejection> {
        let limits = &self.config.price_limits;

        risk_manager::check_price_range(record.price, limits)
            .map_err(|_| Rejection::PriceOutOfRange(record.price))?;

        // 1. Size
        let size =
            position_sizer::proportional_size(record.shares, tracked.copy_ratio, tracked.max_position_size);
        if size == 0 {
            return Err(Rejection::ZeroSize);
        }

        // 2. Market lookup
        let snapshot = self
            .market_data
            .snapshot(&record.market_id)
            .await
            .map_err(|e| match e {
                MarketDataError::NotFound(id) => Rejection::UnknownMarket(id),
                MarketDataError::Unavailable(msg) => Rejection::MarketDataUnavailable(msg),
            })?;

        let outcome_index = record
            .outcome_index
            .or(snapshot.outcome_index)
            .ok_or_else(|| Rejection::UnknownMarket(record.market_id.clone()))?;

        // 3. Stale-signal check and limit price
        let side = record
            .side_for(&tracked.address)
            .ok_or_else(|| Rejection::UnknownMarket(record.market_id.clone()))?;

        let limit_price =
            risk_manager::check_slippage(record.price, snapshot.current_price, side, limits)
                .map_err(|v| match v {
                    PriceViolation::OutsideBand { current, low, high } => {
                        Rejection::StaleSignal { current, low, high }
                    }
                    PriceViolation::OutOfRange { price, .. } => Rejection::PriceOutOfRange(price),
                })?;

        let order_time = Utc::now();
        let order = ReplicationOrder {
            id: Uuid::new_v4(),
            source_trade_ref: record.trade_ref(),
            source_address: tracked.address.clone(),
            market_id: record.market_id.clone(),
            outcome_index,
            side,
            size,
            limit_price,
            dry_run: self.config.dry_run,
            created_at: order_time,
        };

        // 4. Portfolio limits
        let reservation = self.book.lock().await.reserve(
            order.notional(),
            side,
            order_time.date_naive(),
            &self.config.exposure_limits,
        )?;

        Ok((order, reservation))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
