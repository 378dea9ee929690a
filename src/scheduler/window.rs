//! Candle-aligned trading windows.

use chrono::{DateTime, Timelike, Utc};

/// True when `now` falls inside the post-close window of a candle.
///
/// Candles close on UTC hours divisible by `candle_hours`; the window lasts
/// `tolerance_minutes` after the close.
pub fn is_within_trading_window(now: DateTime<Utc>, candle_hours: u32, tolerance_minutes: u32) -> bool {
    if candle_hours == 0 {
        return false;
    }
    now.hour() % candle_hours == 0 && now.minute() < tolerance_minutes
}

/// First candle close strictly after `now`.
pub fn next_candle_close(now: DateTime<Utc>, candle_hours: u32) -> DateTime<Utc> {
    let period = i64::from(candle_hours.max(1)) * 3600;
    let next = (now.timestamp().div_euclid(period) + 1) * period;
    DateTime::from_timestamp(next, 0).unwrap_or(now)
}
