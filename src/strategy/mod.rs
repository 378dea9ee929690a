//! Trading strategy implementation.
//!
//! Contains the core logic for:
//! - Banding model edges into trade decisions
//! - Selecting and sizing the portfolio
//! - Bracket construction around entries
//! - Order execution and position management

pub mod banding;
pub mod bracket;
mod executor;
pub mod selector;

pub use banding::{DecisionReason, EdgeSignal, Side, SignalAggregator, TpRung, TradeDecision};
pub use bracket::{BracketPlan, TakeProfitLeg};
pub use executor::{BracketOutcome, EntryFill, EntryRoute, ExecutionEngine, ExecutionResult};
pub use selector::{ExecutionPlan, OpenAction, PlannedAction, PortfolioSelector};
