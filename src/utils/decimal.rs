//! Decimal arithmetic utilities for financial calculations.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Round to tick size (e.g., 0.01 for most prices).
pub fn round_to_tick(value: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size <= Decimal::ZERO {
        return value;
    }
    ((value / tick_size).round() * tick_size).normalize()
}

/// Round down to lot size (quantity precision).
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size <= Decimal::ZERO {
        return value;
    }
    ((value / lot_size).floor() * lot_size).normalize()
}

/// Clamp a quantity into `[min, max]`, ignoring a non-positive max.
pub fn clamp_qty(value: Decimal, min: Decimal, max: Decimal) -> Decimal {
    let value = value.max(min);
    if max > Decimal::ZERO {
        value.min(max)
    } else {
        value
    }
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Convert a percentage (0.04 = 0.04%) into a rate (0.0004).
pub fn from_percent(pct: Decimal) -> Decimal {
    pct / dec!(100)
}
