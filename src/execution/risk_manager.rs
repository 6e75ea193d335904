use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Side;

/// Price limits applied to every copy decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceLimits {
    /// Accepted relative distance between the observed fill price and the
    /// current market price (default 5%).
    pub slippage_tolerance: Decimal,
    /// Prices outside `[min_price, max_price]` are too close to resolution to copy.
    pub min_price: Decimal,
    pub max_price: Decimal,
}

impl Default for PriceLimits {
    fn default() -> Self {
        Self {
            slippage_tolerance: Decimal::new(5, 2), // 0.05
            min_price: Decimal::new(1, 2),          // 0.01
            max_price: Decimal::new(99, 2),         // 0.99
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PriceViolation {
    #[error("price {price} outside [{min}, {max}]")]
    OutOfRange {
        price: Decimal,
        min: Decimal,
        max: Decimal,
    },

    #[error("current price {current} outside [{low}, {high}]")]
    OutsideBand {
        current: Decimal,
        low: Decimal,
        high: Decimal,
    },
}

/// Inclusive band around an observed price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlippageBand {
    pub low: Decimal,
    pub high: Decimal,
}

impl SlippageBand {
    pub fn around(price: Decimal, tolerance: Decimal) -> Self {
        Self {
            low: price * (Decimal::ONE - tolerance),
            high: price * (Decimal::ONE + tolerance),
        }
    }

    pub fn contains(&self, price: Decimal) -> bool {
        price >= self.low && price <= self.high
    }

    /// Worst price we accept: the top of the band when buying, the bottom when selling.
    pub fn limit_for(&self, side: Side) -> Decimal {
        match side {
            Side::Buy => self.high,
            Side::Sell => self.low,
        }
    }
}

/// Reject observed prices too close to 0 or 1.
pub fn check_price_range(price: Decimal, limits: &PriceLimits) -> Result<(), PriceViolation> {
    if price < limits.min_price || price > limits.max_price {
        return Err(PriceViolation::OutOfRange {
            price,
            min: limits.min_price,
            max: limits.max_price,
        });
    }
    Ok(())
}

/// Check the current price against the band around the observed price and
/// return the limit price for the copy, clamped into the allowed range.
pub fn check_slippage(
    observed_price: Decimal,
    current_price: Decimal,
    side: Side,
    limits: &PriceLimits,
) -> Result<Decimal, PriceViolation> {
    let band = SlippageBand::around(observed_price, limits.slippage_tolerance);

    if !band.contains(current_price) {
        return Err(PriceViolation::OutsideBand {
            current: current_price,
            low: band.low,
            high: band.high,
        });
    }

    let limit = band
        .limit_for(side)
        .clamp(limits.min_price, limits.max_price)
        .round_dp(6);

    Ok(limit)
}

// ---------------------------------------------------------------------------
// Portfolio limits
// ---------------------------------------------------------------------------

/// Limits across all emitted orders. `None` disables a limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureLimits {
    /// Net USDC committed: copied buys minus copied sells.
    pub max_total_exposure: Option<Decimal>,
    /// Orders emitted per UTC day (default 50).
    pub max_daily_orders: Option<u32>,
    /// USDC notional emitted per UTC day.
    pub max_daily_volume: Option<Decimal>,
}

impl Default for ExposureLimits {
    fn default() -> Self {
        Self {
            max_total_exposure: None,
            max_daily_orders: Some(50),
            max_daily_volume: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExposureViolation {
    #[error("daily order limit reached: {count}/{max}")]
    DailyOrders { count: u32, max: u32 },

    #[error("daily volume {volume} + {notional} exceeds {max}")]
    DailyVolume {
        volume: Decimal,
        notional: Decimal,
        max: Decimal,
    },

    #[error("exposure {exposure} + {notional} exceeds {max}")]
    TotalExposure {
        exposure: Decimal,
        notional: Decimal,
        max: Decimal,
    },
}

/// Capacity taken by one order, handed back with `ExposureBook::release`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    day: NaiveDate,
    notional: Decimal,
    exposure_delta: Decimal,
}

/// Running totals checked against `ExposureLimits`. Daily counters reset when
/// the UTC date changes; exposure carries over.
#[derive(Debug, Clone, Default)]
pub struct ExposureBook {
    day: Option<NaiveDate>,
    orders: u32,
    volume: Decimal,
    exposure: Decimal,
}

impl ExposureBook {
    pub fn daily_orders(&self) -> u32 {
        self.orders
    }

    pub fn daily_volume(&self) -> Decimal {
        self.volume
    }

    pub fn exposure(&self) -> Decimal {
        self.exposure
    }

    fn roll(&mut self, today: NaiveDate) {
        if self.day != Some(today) {
            self.day = Some(today);
            self.orders = 0;
            self.volume = Decimal::ZERO;
        }
    }

    /// Take room for an order of `notional` USDC, or report the first limit
    /// it would break. Sells lower exposure and are never held back by it.
    pub fn reserve(
        &mut self,
        notional: Decimal,
        side: Side,
        today: NaiveDate,
        limits: &ExposureLimits,
    ) -> Result<Reservation, ExposureViolation> {
        self.roll(today);

        if let Some(max) = limits.max_daily_orders {
            if self.orders >= max {
                return Err(ExposureViolation::DailyOrders {
                    count: self.orders,
                    max,
                });
            }
        }

        if let Some(max) = limits.max_daily_volume {
            if self.volume + notional > max {
                return Err(ExposureViolation::DailyVolume {
                    volume: self.volume,
                    notional,
                    max,
                });
            }
        }

        let next_exposure = match side {
            Side::Buy => self.exposure + notional,
            Side::Sell => (self.exposure - notional).max(Decimal::ZERO),
        };
        if let (Side::Buy, Some(max)) = (side, limits.max_total_exposure) {
            if next_exposure > max {
                return Err(ExposureViolation::TotalExposure {
                    exposure: self.exposure,
                    notional,
                    max,
                });
            }
        }

        let reservation = Reservation {
            day: today,
            notional,
            exposure_delta: next_exposure - self.exposure,
        };
        self.orders += 1;
        self.volume += notional;
        self.exposure = next_exposure;
        Ok(reservation)
    }

    /// Undo a reservation for an order that was never emitted.
    pub fn release(&mut self, reservation: Reservation) {
        if self.day == Some(reservation.day) {
            self.orders = self.orders.saturating_sub(1);
            self.volume = (self.volume - reservation.notional).max(Decimal::ZERO);
        }
        self.exposure = (self.exposure - reservation.exposure_delta).max(Decimal::ZERO);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_band_around_forty_cents() {
        let band = SlippageBand::around(dec("0.40"), dec("0.05"));
        assert_eq!(band.low, dec("0.38"));
        assert_eq!(band.high, dec("0.42"));
        assert!(band.contains(dec("0.38")));
        assert!(band.contains(dec("0.42")));
        assert!(!band.contains(dec("0.43")));
    }

    #[test]
    fn test_slippage_within_band() {
        let limits = PriceLimits::default();
        let limit = check_slippage(dec("0.40"), dec("0.41"), Side::Buy, &limits).unwrap();
        assert_eq!(limit, dec("0.42"));

        let limit = check_slippage(dec("0.40"), dec("0.39"), Side::Sell, &limits).unwrap();
        assert_eq!(limit, dec("0.38"));
    }

    #[test]
    fn test_stale_price_rejected() {
        let limits = PriceLimits::default();
        let err = check_slippage(dec("0.40"), dec("0.55"), Side::Buy, &limits).unwrap_err();
        assert!(matches!(err, PriceViolation::OutsideBand { .. }));
    }

    #[test]
    fn test_limit_clamped_to_max_price() {
        let limits = PriceLimits::default();
        // Band top 0.98 × 1.05 = 1.029 → clamped
        let limit = check_slippage(dec("0.98"), dec("0.98"), Side::Buy, &limits).unwrap();
        assert_eq!(limit, dec("0.99"));
    }

    #[test]
    fn test_price_range() {
        let limits = PriceLimits::default();
        assert!(check_price_range(dec("0.5"), &limits).is_ok());
        assert!(check_price_range(dec("0.01"), &limits).is_ok());
        assert!(check_price_range(dec("0.995"), &limits).is_err());
        assert!(check_price_range(dec("0.001"), &limits).is_err());
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    #[test]
    fn test_daily_order_limit_resets_next_day() {
        let limits = ExposureLimits {
            max_daily_orders: Some(2),
            ..ExposureLimits::default()
        };
        let mut book = ExposureBook::default();

        book.reserve(dec("4"), Side::Buy, day(1), &limits).unwrap();
        book.reserve(dec("4"), Side::Buy, day(1), &limits).unwrap();
        let err = book.reserve(dec("4"), Side::Buy, day(1), &limits).unwrap_err();
        assert_eq!(err, ExposureViolation::DailyOrders { count: 2, max: 2 });

        book.reserve(dec("4"), Side::Buy, day(2), &limits).unwrap();
        assert_eq!(book.daily_orders(), 1);
        assert_eq!(book.daily_volume(), dec("4"));
        assert_eq!(book.exposure(), dec("12"));
    }

    #[test]
    fn test_daily_volume_limit() {
        let limits = ExposureLimits {
            max_daily_volume: Some(dec("10")),
            ..ExposureLimits::default()
        };
        let mut book = ExposureBook::default();

        book.reserve(dec("6"), Side::Sell, day(1), &limits).unwrap();
        let err = book.reserve(dec("5"), Side::Buy, day(1), &limits).unwrap_err();
        assert!(matches!(err, ExposureViolation::DailyVolume { .. }));
        book.reserve(dec("4"), Side::Buy, day(1), &limits).unwrap();
    }

    #[test]
    fn test_exposure_limit_only_holds_back_buys() {
        let limits = ExposureLimits {
            max_total_exposure: Some(dec("10")),
            max_daily_orders: None,
            max_daily_volume: None,
        };
        let mut book = ExposureBook::default();

        book.reserve(dec("8"), Side::Buy, day(1), &limits).unwrap();
        let err = book.reserve(dec("3"), Side::Buy, day(1), &limits).unwrap_err();
        assert!(matches!(err, ExposureViolation::TotalExposure { .. }));

        book.reserve(dec("5"), Side::Sell, day(1), &limits).unwrap();
        assert_eq!(book.exposure(), dec("3"));
        book.reserve(dec("3"), Side::Buy, day(1), &limits).unwrap();
        assert_eq!(book.exposure(), dec("6"));
    }

    #[test]
    fn test_release_returns_capacity() {
        let limits = ExposureLimits {
            max_total_exposure: Some(dec("10")),
            max_daily_orders: Some(1),
            max_daily_volume: None,
        };
        let mut book = ExposureBook::default();

        let held = book.reserve(dec("10"), Side::Buy, day(1), &limits).unwrap();
        book.release(held);
        assert_eq!(book.daily_orders(), 0);
        assert_eq!(book.exposure(), Decimal::ZERO);
        book.reserve(dec("10"), Side::Buy, day(1), &limits).unwrap();
    }
}
