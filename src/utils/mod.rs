//! Shared utilities.

pub mod decimal;

pub use decimal::{clamp_qty, from_percent, round_down_to_lot, round_to_tick, safe_div};
