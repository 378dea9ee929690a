//! Venue-agnostic gateway trait and its error classification.
//!
//! Every network call the engine makes goes through [`ExchangeGateway`].
//! Failures are reported as [`GatewayError`] so callers can decide between
//! retrying, treating the call as already done, or abandoning the step.

use super::types::*;
use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

/// Classified gateway failure.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Network error, rate limit, server error or clock skew; safe to retry.
    #[error("transient gateway error: {0}")]
    Transient(String),

    /// The exchange already is in the requested state (margin type set,
    /// duplicate client order id, ...). Callers treat this as success.
    #[error("already in requested state: {0}")]
    AlreadyInState(String),

    /// Unknown order, typically a cancel racing a trigger or fill.
    #[error("order not found: {0}")]
    NotFound(String),

    /// The exchange refused the request.
    #[error("rejected by exchange ({code}): {msg}")]
    Rejected { code: i64, msg: String },

    /// Missing or malformed static metadata (symbol filters).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Response body could not be decoded.
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Binance error code for a post-only order that would cross the book.
    pub const POST_ONLY_WOULD_CROSS: i64 = -5022;

    /// Map a Binance error code to a classified error.
    pub fn from_api_code(code: i64, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        match code {
            // Unknown/timeout, too many requests, timestamp outside recvWindow
            -1001 | -1003 | -1007 | -1021 => GatewayError::Transient(format!("{code}: {msg}")),
            // No need to change margin type / position side, duplicate client order id
            -4046 | -4059 | -4116 => GatewayError::AlreadyInState(format!("{code}: {msg}")),
            // Unknown order sent / order does not exist
            -2011 | -2013 => GatewayError::NotFound(format!("{code}: {msg}")),
            _ => GatewayError::Rejected { code, msg },
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }

    pub fn is_already_in_state(&self) -> bool {
        matches!(self, GatewayError::AlreadyInState(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound(_))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GatewayError::Decode(err.to_string())
        } else {
            GatewayError::Transient(err.to_string())
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Decode(err.to_string())
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Network operations against a futures venue.
///
/// Positions and orders are always fetched fresh; implementations may cache
/// static metadata such as symbol filters.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// All positions (flat ones may be included).
    async fn get_positions(&self) -> GatewayResult<Vec<Position>>;

    /// Open orders for one symbol, or account-wide when `symbol` is `None`.
    async fn get_open_orders(&self, symbol: Option<&str>) -> GatewayResult<Vec<Order>>;

    async fn place_order(&self, order: &NewOrder) -> GatewayResult<Order>;

    async fn get_order(&self, symbol: &str, order_id: i64) -> GatewayResult<Order>;

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> GatewayResult<()>;

    /// Cancel every open order for `symbol`.
    async fn cancel_all(&self, symbol: &str) -> GatewayResult<()>;

    async fn get_symbol_filters(&self, symbol: &str) -> GatewayResult<SymbolFilters>;

    async fn get_mark_price(&self, symbol: &str) -> GatewayResult<Decimal>;

    /// Most recent funding rate as a raw rate (0.0001 = 0.01%).
    async fn get_funding_rate(&self, symbol: &str) -> GatewayResult<Decimal>;

    async fn get_book_ticker(&self, symbol: &str) -> GatewayResult<BookTicker>;

    async fn set_leverage(&self, symbol: &str, leverage: u8) -> GatewayResult<()>;

    async fn set_margin_mode(&self, symbol: &str, margin_type: MarginType) -> GatewayResult<()>;

    async fn get_balances(&self) -> GatewayResult<Vec<AccountBalance>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_code_classification() {
        assert!(GatewayError::from_api_code(-1003, "Too many requests").is_transient());
        assert!(GatewayError::from_api_code(-1021, "Timestamp outside recvWindow").is_transient());
        assert!(GatewayError::from_api_code(-4046, "No need to change margin type.")
            .is_already_in_state());
        assert!(GatewayError::from_api_code(-4116, "ClientOrderId is duplicated.")
            .is_already_in_state());
        assert!(GatewayError::from_api_code(-2011, "Unknown order sent.").is_not_found());
    }

    #[test]
    fn test_post_only_cross_is_rejection() {
        let err = GatewayError::from_api_code(
            GatewayError::POST_ONLY_WOULD_CROSS,
            "Order would immediately match and take.",
        );
        match err {
            GatewayError::Rejected { code, .. } => assert_eq!(code, -5022),
            other => panic!("unexpected classification: {other:?}"),
        }
    }
}
