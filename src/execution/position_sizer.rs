use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Proportional sizing: copy `copy_ratio` of the source fill, capped at the
/// tracked address's `max_position_size`. Amounts are share base units;
/// fractions of a base unit are dropped.
pub fn proportional_size(source_shares: u64, copy_ratio: Decimal, max_position_size: u64) -> u64 {
    if copy_ratio <= Decimal::ZERO {
        return 0;
    }

    let scaled = (Decimal::from(source_shares) * copy_ratio).floor();
    // Products too large for u64 are by construction above any cap.
    let raw = scaled.to_u64().unwrap_or(u64::MAX);

    raw.min(max_position_size)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
