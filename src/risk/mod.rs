//! Position protection between trading cycles.
//!
//! Provides:
//! - Breakeven stop trailing after partial take-profits
//! - Orphaned order cleanup
//! - Ledger reconciliation against the exchange

mod monitor;

pub use monitor::{breakeven_stop, MonitorReport, ReconciliationMonitor, TrailOutcome};
