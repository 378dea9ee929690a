//! # Bracket Trader
//!
//! Portfolio reconciliation and bracket-order execution for Binance
//! USDⓈ-M futures, driven by an external edge model.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: Binance REST client, gateway trait and scripted mock exchange
//! - `signal`: Edge signal providers (HTTP model service, static file)
//! - `strategy`: Banding, portfolio selection, brackets and order execution
//! - `risk`: Breakeven trailing, orphan cleanup and ledger reconciliation
//! - `scheduler`: Candle-aligned cycle loop and worker pools
//! - `persistence`: SQLite order ledger
//! - `utils`: Shared utilities and decimal arithmetic

pub mod config;
pub mod exchange;
pub mod persistence;
pub mod risk;
pub mod scheduler;
pub mod signal;
pub mod strategy;
pub mod utils;

pub use config::Config;
