//! Type definitions for Binance USDⓈ-M Futures API requests and responses.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The side that reduces a position opened with `self`.
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// Side of a signed position amount (`None` when flat).
    pub fn from_position_amt(amount: Decimal) -> Option<Self> {
        if amount > Decimal::ZERO {
            Some(OrderSide::Buy)
        } else if amount < Decimal::ZERO {
            Some(OrderSide::Sell)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
    Stop,
    StopMarket,
    TakeProfit,
    TakeProfitMarket,
    TrailingStopMarket,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::Market => "MARKET",
            OrderType::Stop => "STOP",
            OrderType::StopMarket => "STOP_MARKET",
            OrderType::TakeProfit => "TAKE_PROFIT",
            OrderType::TakeProfitMarket => "TAKE_PROFIT_MARKET",
            OrderType::TrailingStopMarket => "TRAILING_STOP_MARKET",
        }
    }
}

/// Time in force for limit orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    Gtc, // Good Till Cancel
    Ioc, // Immediate or Cancel
    Fok, // Fill or Kill
    Gtx, // Post Only (Good Till Crossing)
    Gtd, // Good Till Date
    /// Reported on close-position stops; never sent.
    #[serde(rename = "GTE_GTC")]
    GteGtc,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Gtc => "GTC",
            TimeInForce::Ioc => "IOC",
            TimeInForce::Fok => "FOK",
            TimeInForce::Gtx => "GTX",
            TimeInForce::Gtd => "GTD",
            TimeInForce::GteGtc => "GTE_GTC",
        }
    }
}

/// Price used to evaluate stop triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkingType {
    MarkPrice,
    ContractPrice,
}

impl WorkingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkingType::MarkPrice => "MARK_PRICE",
            WorkingType::ContractPrice => "CONTRACT_PRICE",
        }
    }
}

/// Order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
    ExpiredInMatch,
}

impl OrderStatus {
    /// Whether the order can no longer change.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::New | OrderStatus::PartiallyFilled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Expired => "EXPIRED",
            OrderStatus::ExpiredInMatch => "EXPIRED_IN_MATCH",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(OrderStatus::New),
            "PARTIALLY_FILLED" => Ok(OrderStatus::PartiallyFilled),
            "FILLED" => Ok(OrderStatus::Filled),
            "CANCELED" => Ok(OrderStatus::Canceled),
            "REJECTED" => Ok(OrderStatus::Rejected),
            "EXPIRED" => Ok(OrderStatus::Expired),
            "EXPIRED_IN_MATCH" => Ok(OrderStatus::ExpiredInMatch),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

/// Margin type for positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginType {
    Isolated,
    Cross,
}

impl MarginType {
    /// Value expected by the `marginType` endpoint.
    pub fn as_api_str(&self) -> &'static str {
        match self {
            MarginType::Isolated => "ISOLATED",
            MarginType::Cross => "CROSSED",
        }
    }
}

/// New order request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub symbol: String,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub quantity: Option<Decimal>,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub time_in_force: Option<TimeInForce>,
    pub reduce_only: Option<bool>,
    pub close_position: Option<bool>,
    pub working_type: Option<WorkingType>,
    pub new_client_order_id: Option<String>,
}

impl NewOrder {
    fn base(symbol: &str, side: OrderSide, order_type: OrderType) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type,
            quantity: None,
            price: None,
            stop_price: None,
            time_in_force: None,
            reduce_only: None,
            close_position: None,
            working_type: None,
            new_client_order_id: None,
        }
    }

    /// Plain market order.
    pub fn market(symbol: &str, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            quantity: Some(quantity),
            ..Self::base(symbol, side, OrderType::Market)
        }
    }

    /// Reduce-only market order used to flatten a position.
    pub fn reduce_only_market(symbol: &str, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            reduce_only: Some(true),
            ..Self::market(symbol, side, quantity)
        }
    }

    /// Post-only (GTX) limit order; rejected instead of crossing the book.
    pub fn post_only_limit(symbol: &str, side: OrderSide, quantity: Decimal, price: Decimal) -> Self {
        Self {
            quantity: Some(quantity),
            price: Some(price),
            time_in_force: Some(TimeInForce::Gtx),
            ..Self::base(symbol, side, OrderType::Limit)
        }
    }

    /// Reduce-only GTC limit order (take-profit leg resting in the book).
    pub fn reduce_only_limit(symbol: &str, side: OrderSide, quantity: Decimal, price: Decimal) -> Self {
        Self {
            quantity: Some(quantity),
            price: Some(price),
            time_in_force: Some(TimeInForce::Gtc),
            reduce_only: Some(true),
            ..Self::base(symbol, side, OrderType::Limit)
        }
    }

    /// Stop-market order that closes the whole position when mark price crosses `stop_price`.
    pub fn close_position_stop(symbol: &str, side: OrderSide, stop_price: Decimal) -> Self {
        Self {
            stop_price: Some(stop_price),
            close_position: Some(true),
            working_type: Some(WorkingType::MarkPrice),
            ..Self::base(symbol, side, OrderType::StopMarket)
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.new_client_order_id = Some(client_id.into());
        self
    }
}

/// Order as reported by the exchange (placement response, query, open orders).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: i64,
    pub symbol: String,
    pub status: OrderStatus,
    #[serde(default)]
    pub client_order_id: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(default, with = "rust_decimal::serde::str")]
    pub avg_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub orig_qty: Decimal,
    #[serde(default, with = "rust_decimal::serde::str")]
    pub executed_qty: Decimal,
    #[serde(default, with = "rust_decimal::serde::str")]
    pub stop_price: Decimal,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub close_position: bool,
    #[serde(default)]
    pub time_in_force: Option<TimeInForce>,
    #[serde(default)]
    pub update_time: i64,
}

impl Order {
    /// Whether this is a take-profit leg of a bracket.
    pub fn is_take_profit_leg(&self) -> bool {
        self.reduce_only && self.order_type == OrderType::Limit
    }

    /// Whether this is the protective stop of a bracket.
    pub fn is_stop_loss(&self) -> bool {
        self.order_type == OrderType::StopMarket
    }
}

/// Futures position information.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub position_amt: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub entry_price: Decimal,
    #[serde(default, with = "rust_decimal::serde::str")]
    pub mark_price: Decimal,
    #[serde(rename = "unRealizedProfit", default, with = "rust_decimal::serde::str")]
    pub unrealized_profit: Decimal,
}

impl Position {
    pub fn side(&self) -> Option<OrderSide> {
        OrderSide::from_position_amt(self.position_amt)
    }

    pub fn is_flat(&self) -> bool {
        self.position_amt == Decimal::ZERO
    }
}

/// Immutable snapshot of the non-flat positions, taken once per cycle.
#[derive(Debug, Clone, Default)]
pub struct PositionBook {
    positions: HashMap<String, Position>,
}

impl PositionBook {
    pub fn from_positions(positions: Vec<Position>) -> Self {
        Self {
            positions: positions
                .into_iter()
                .filter(|p| !p.is_flat())
                .map(|p| (p.symbol.clone(), p))
                .collect(),
        }
    }

    /// Signed position amount (zero when flat or unknown).
    pub fn amount(&self, symbol: &str) -> Decimal {
        self.positions
            .get(symbol)
            .map(|p| p.position_amt)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn side(&self, symbol: &str) -> Option<OrderSide> {
        OrderSide::from_position_amt(self.amount(symbol))
    }

    pub fn get(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.positions.contains_key(symbol)
    }

    /// Held symbols in sorted order (deterministic plans and logs).
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.positions.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn iter(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Best bid/ask prices and quantities.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookTicker {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub bid_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub bid_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub ask_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub ask_qty: Decimal,
}

impl BookTicker {
    pub fn mid(&self) -> Decimal {
        (self.bid_price + self.ask_price) / Decimal::TWO
    }
}

/// Futures account balance for one asset.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountBalance {
    pub asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub balance: Decimal,
    #[serde(default, with = "rust_decimal::serde::str")]
    pub cross_un_pnl: Decimal,
    #[serde(default, with = "rust_decimal::serde::str")]
    pub available_balance: Decimal,
}

/// Mark price and current funding information.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PremiumIndex {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub mark_price: Decimal,
    #[serde(default, with = "rust_decimal::serde::str")]
    pub last_funding_rate: Decimal,
}

/// Settled funding rate history entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingRateEntry {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub funding_rate: Decimal,
    pub funding_time: i64,
}

/// Precision and size limits for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolFilters {
    pub qty_step: Decimal,
    pub price_tick: Decimal,
    pub min_qty: Decimal,
    /// Tighter of the LOT_SIZE and MARKET_LOT_SIZE maxima.
    pub max_qty: Decimal,
}

/// Exchange information for futures.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuturesExchangeInfo {
    pub symbols: Vec<FuturesSymbolInfo>,
}

/// Symbol information for futures.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FuturesSymbolInfo {
    pub symbol: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub filters: Vec<SymbolFilter>,
}

/// The subset of exchange filters the engine cares about.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "filterType")]
pub enum SymbolFilter {
    #[serde(rename = "LOT_SIZE", rename_all = "camelCase")]
    LotSize {
        #[serde(with = "rust_decimal::serde::str")]
        step_size: Decimal,
        #[serde(with = "rust_decimal::serde::str")]
        min_qty: Decimal,
        #[serde(with = "rust_decimal::serde::str")]
        max_qty: Decimal,
    },
    #[serde(rename = "MARKET_LOT_SIZE", rename_all = "camelCase")]
    MarketLotSize {
        #[serde(with = "rust_decimal::serde::str")]
        max_qty: Decimal,
    },
    #[serde(rename = "PRICE_FILTER", rename_all = "camelCase")]
    PriceFilter {
        #[serde(with = "rust_decimal::serde::str")]
        tick_size: Decimal,
    },
    #[serde(other)]
    Other,
}

impl FuturesSymbolInfo {
    /// Extract step/tick/min/max; `None` when LOT_SIZE or PRICE_FILTER is missing.
    pub fn filters(&self) -> Option<SymbolFilters> {
        let mut lot = None;
        let mut market_max = None;
        let mut tick = None;

        for filter in &self.filters {
            match filter {
                SymbolFilter::LotSize {
                    step_size,
                    min_qty,
                    max_qty,
                } => lot = Some((*step_size, *min_qty, *max_qty)),
                SymbolFilter::MarketLotSize { max_qty } => market_max = Some(*max_qty),
                SymbolFilter::PriceFilter { tick_size } => tick = Some(*tick_size),
                SymbolFilter::Other => {}
            }
        }

        let (qty_step, min_qty, lot_max) = lot?;
        let price_tick = tick?;
        let max_qty = match market_max {
            Some(m) if m > Decimal::ZERO && m < lot_max => m,
            _ => lot_max,
        };

        Some(SymbolFilters {
            qty_step,
            price_tick,
            min_qty,
            max_qty,
        })
    }
}

/// Error body returned by Binance on failed requests.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    pub msg: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_symbol_filters_use_tighter_market_max() {
        let raw = r#"{
            "symbol": "BTCUSDT",
            "status": "TRADING",
            "filters": [
                {"filterType": "PRICE_FILTER", "tickSize": "0.10", "minPrice": "556.80", "maxPrice": "4529764"},
                {"filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001", "maxQty": "1000"},
                {"filterType": "MARKET_LOT_SIZE", "stepSize": "0.001", "minQty": "0.001", "maxQty": "120"},
                {"filterType": "MIN_NOTIONAL", "notional": "100"}
            ]
        }"#;
        let info: FuturesSymbolInfo = serde_json::from_str(raw).unwrap();
        let filters = info.filters().unwrap();

        assert_eq!(filters.qty_step, dec!(0.001));
        assert_eq!(filters.price_tick, dec!(0.10));
        assert_eq!(filters.min_qty, dec!(0.001));
        assert_eq!(filters.max_qty, dec!(120));
    }

    #[test]
    fn test_symbol_filters_missing_price_filter() {
        let raw = r#"{
            "symbol": "AXLUSDT",
            "filters": [
                {"filterType": "LOT_SIZE", "stepSize": "1", "minQty": "1", "maxQty": "100000"}
            ]
        }"#;
        let info: FuturesSymbolInfo = serde_json::from_str(raw).unwrap();
        assert!(info.filters().is_none());
    }

    #[test]
    fn test_order_deserialize_open_stop() {
        let raw = r#"{
            "orderId": 283194212,
            "symbol": "ETHUSDT",
            "status": "NEW",
            "clientOrderId": "btr-ETHUSDT-sl-1700000000000",
            "price": "0",
            "avgPrice": "0.00000",
            "origQty": "0",
            "executedQty": "0",
            "stopPrice": "2950.50",
            "side": "SELL",
            "type": "STOP_MARKET",
            "reduceOnly": true,
            "closePosition": true,
            "timeInForce": "GTE_GTC",
            "updateTime": 1700000000000
        }"#;
        let order: Order = serde_json::from_str(raw).unwrap();
        assert_eq!(order.time_in_force, Some(TimeInForce::GteGtc));
        assert!(order.is_stop_loss());
        assert!(!order.is_take_profit_leg());
        assert_eq!(order.stop_price, dec!(2950.50));
    }

    #[test]
    fn test_position_book_filters_flat() {
        let book = PositionBook::from_positions(vec![
            Position {
                symbol: "BTCUSDT".into(),
                position_amt: dec!(0.01),
                entry_price: dec!(60000),
                mark_price: dec!(60100),
                unrealized_profit: dec!(1),
            },
            Position {
                symbol: "ETHUSDT".into(),
                position_amt: Decimal::ZERO,
                entry_price: Decimal::ZERO,
                mark_price: dec!(3000),
                unrealized_profit: Decimal::ZERO,
            },
        ]);

        assert_eq!(book.len(), 1);
        assert_eq!(book.side("BTCUSDT"), Some(OrderSide::Buy));
        assert_eq!(book.side("ETHUSDT"), None);
        assert_eq!(book.amount("SOLUSDT"), Decimal::ZERO);
    }

    #[test]
    fn test_order_status_round_trips_through_str() {
        for status in [OrderStatus::New, OrderStatus::PartiallyFilled, OrderStatus::Canceled] {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
        assert!(OrderStatus::Filled.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }
}
