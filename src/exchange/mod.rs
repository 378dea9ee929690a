//! Exchange integration for Binance USDⓈ-M futures.
//!
//! The engine talks to the venue only through [`ExchangeGateway`]:
//! - `BinanceClient`: signed REST client with error-code classification
//! - `MockExchange`: scripted in-memory venue used by tests

mod client;
pub mod mock;
mod traits;
mod types;

pub use client::BinanceClient;
pub use mock::{LimitFill, MockExchange};
pub use traits::{ExchangeGateway, GatewayError, GatewayResult};
pub use types::*;
