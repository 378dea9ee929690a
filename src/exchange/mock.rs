//! Scripted in-memory exchange for tests.
//!
//! Keeps positions, orders and market data in memory and lets callers script
//! how limit orders fill, which calls fail transiently, and when cancels race
//! a trigger.

use super::traits::{ExchangeGateway, GatewayError, GatewayResult};
use super::types::*;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// How passive (GTX) entry orders behave after placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitFill {
    /// Filled on placement.
    Immediate,
    /// Filled after the order has been queried `n` times.
    AfterPolls(u32),
    /// Fills this fraction of the quantity on placement, never the rest.
    Partial(Decimal),
    /// Rests in the book until canceled.
    Never,
}

#[derive(Debug)]
struct MockState {
    positions: HashMap<String, Position>,
    orders: Vec<Order>,
    polls_remaining: HashMap<i64, u32>,
    filters: HashMap<String, SymbolFilters>,
    books: HashMap<String, BookTicker>,
    marks: HashMap<String, Decimal>,
    funding: HashMap<String, Decimal>,
    balances: Vec<AccountBalance>,
    leverage: HashMap<String, u8>,
    margin: HashMap<String, MarginType>,
    limit_fill: LimitFill,
    reject_post_only: bool,
    report_market_avg_price: bool,
    cancel_not_found: bool,
    lost_place_responses: u32,
    transient_failures: HashMap<&'static str, u32>,
    calls: Vec<String>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            positions: HashMap::new(),
            orders: Vec::new(),
            polls_remaining: HashMap::new(),
            filters: HashMap::new(),
            books: HashMap::new(),
            marks: HashMap::new(),
            funding: HashMap::new(),
            balances: Vec::new(),
            leverage: HashMap::new(),
            margin: HashMap::new(),
            limit_fill: LimitFill::Immediate,
            reject_post_only: false,
            report_market_avg_price: true,
            cancel_not_found: false,
            lost_place_responses: 0,
            transient_failures: HashMap::new(),
            calls: Vec::new(),
        }
    }
}

impl MockState {
    /// Consume one scripted transient failure for `op`, if any remain.
    fn take_failure(&mut self, op: &'static str) -> GatewayResult<()> {
        if let Some(remaining) = self.transient_failures.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(GatewayError::Transient(format!("scripted {op} failure")));
            }
        }
        Ok(())
    }

    fn mark(&self, symbol: &str) -> Decimal {
        self.marks
            .get(symbol)
            .copied()
            .or_else(|| self.books.get(symbol).map(BookTicker::mid))
            .unwrap_or(Decimal::ZERO)
    }

    /// Apply a fill of `qty` on `side` at `price` to the position book.
    fn apply_fill(&mut self, symbol: &str, side: OrderSide, qty: Decimal, price: Decimal) {
        let signed = match side {
            OrderSide::Buy => qty,
            OrderSide::Sell => -qty,
        };
        let mark = self.mark(symbol);
        let position = self
            .positions
            .entry(symbol.to_string())
            .or_insert_with(|| Position {
                symbol: symbol.to_string(),
                position_amt: Decimal::ZERO,
                entry_price: Decimal::ZERO,
                mark_price: mark,
                unrealized_profit: Decimal::ZERO,
            });

        let old = position.position_amt;
        let new = old + signed;
        if old == Decimal::ZERO || old.is_sign_positive() == signed.is_sign_positive() {
            let notional = old.abs() * position.entry_price + qty * price;
            position.entry_price = notional / new.abs();
        } else if new != Decimal::ZERO && new.is_sign_positive() != old.is_sign_positive() {
            position.entry_price = price;
        }
        position.position_amt = new;

        if new == Decimal::ZERO {
            self.positions.remove(symbol);
        }
    }

    fn fill_order(&mut self, idx: usize, qty: Decimal, price: Decimal) {
        if qty <= Decimal::ZERO {
            return;
        }
        let (symbol, side) = {
            let order = &mut self.orders[idx];
            order.executed_qty += qty;
            let prior = order.avg_price * (order.executed_qty - qty);
            order.avg_price = (prior + qty * price) / order.executed_qty;
            order.status = if order.executed_qty >= order.orig_qty {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };
            (order.symbol.clone(), order.side)
        };
        self.apply_fill(&symbol, side, qty, price);
    }

    fn position_amt(&self, symbol: &str) -> Decimal {
        self.positions
            .get(symbol)
            .map(|p| p.position_amt)
            .unwrap_or(Decimal::ZERO)
    }
}

/// In-memory exchange implementing [`ExchangeGateway`].
pub struct MockExchange {
    state: Arc<RwLock<MockState>>,
    order_id_counter: AtomicI64,
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MockState::default())),
            order_id_counter: AtomicI64::new(1),
        }
    }

    // ==================== Scripting ====================

    pub async fn set_position(&self, symbol: &str, amount: Decimal, entry_price: Decimal) {
        let mut state = self.state.write().await;
        if amount == Decimal::ZERO {
            state.positions.remove(symbol);
            return;
        }
        let mark = state.mark(symbol);
        state.positions.insert(
            symbol.to_string(),
            Position {
                symbol: symbol.to_string(),
                position_amt: amount,
                entry_price,
                mark_price: mark,
                unrealized_profit: Decimal::ZERO,
            },
        );
    }

    pub async fn set_filters(&self, symbol: &str, filters: SymbolFilters) {
        self.state
            .write()
            .await
            .filters
            .insert(symbol.to_string(), filters);
    }

    pub async fn set_book(&self, symbol: &str, bid: Decimal, ask: Decimal) {
        self.state.write().await.books.insert(
            symbol.to_string(),
            BookTicker {
                symbol: symbol.to_string(),
                bid_price: bid,
                bid_qty: Decimal::ONE,
                ask_price: ask,
                ask_qty: Decimal::ONE,
            },
        );
    }

    pub async fn set_mark_price(&self, symbol: &str, price: Decimal) {
        self.state
            .write()
            .await
            .marks
            .insert(symbol.to_string(), price);
    }

    pub async fn set_funding_rate(&self, symbol: &str, rate: Decimal) {
        self.state
            .write()
            .await
            .funding
            .insert(symbol.to_string(), rate);
    }

    pub async fn set_balance(&self, asset: &str, balance: Decimal) {
        let mut state = self.state.write().await;
        state.balances.retain(|b| b.asset != asset);
        state.balances.push(AccountBalance {
            asset: asset.to_string(),
            balance,
            cross_un_pnl: Decimal::ZERO,
            available_balance: balance,
        });
    }

    pub async fn set_limit_fill(&self, behavior: LimitFill) {
        self.state.write().await.limit_fill = behavior;
    }

    /// Reject post-only orders as if they would cross the book.
    pub async fn set_reject_post_only(&self, reject: bool) {
        self.state.write().await.reject_post_only = reject;
    }

    /// Report market fills without an average price.
    pub async fn set_report_market_avg_price(&self, report: bool) {
        self.state.write().await.report_market_avg_price = report;
    }

    /// Make every single-order cancel fail with `NotFound`.
    pub async fn set_cancel_not_found(&self, not_found: bool) {
        self.state.write().await.cancel_not_found = not_found;
    }

    /// Accept the next `times` orders but answer each with a transient error.
    pub async fn lose_place_responses(&self, times: u32) {
        self.state.write().await.lost_place_responses = times;
    }

    /// Fail the next `times` calls of `op` (e.g. "set_leverage") with a transient error.
    pub async fn fail_times(&self, op: &'static str, times: u32) {
        self.state
            .write()
            .await
            .transient_failures
            .insert(op, times);
    }

    /// Insert a resting order directly (e.g. a bracket left from a previous run).
    pub async fn add_open_order(&self, order: NewOrder) -> i64 {
        let order_id = self.order_id_counter.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.write().await;
        let resting = Self::resting_order(order_id, &order);
        state.orders.push(resting);
        order_id
    }

    /// Fill a resting order completely at its limit (or stop) price.
    pub async fn trigger_order(&self, order_id: i64) {
        let mut state = self.state.write().await;
        if let Some(idx) = state.orders.iter().position(|o| o.order_id == order_id) {
            let order = state.orders[idx].clone();
            let price = if order.price > Decimal::ZERO {
                order.price
            } else {
                order.stop_price
            };
            let qty = if order.close_position {
                state.position_amt(&order.symbol).abs()
            } else {
                order.orig_qty - order.executed_qty
            };
            if order.close_position {
                state.orders[idx].orig_qty = qty;
            }
            state.fill_order(idx, qty, price);
        }
    }

    // ==================== Inspection ====================

    pub async fn calls(&self) -> Vec<String> {
        self.state.read().await.calls.clone()
    }

    /// Number of recorded calls whose description starts with `prefix`.
    pub async fn call_count(&self, prefix: &str) -> usize {
        self.state
            .read()
            .await
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Every order ever placed for `symbol`, in placement order.
    pub async fn orders_for(&self, symbol: &str) -> Vec<Order> {
        self.state
            .read()
            .await
            .orders
            .iter()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect()
    }

    pub async fn position_amt(&self, symbol: &str) -> Decimal {
        self.state.read().await.position_amt(symbol)
    }

    pub async fn leverage_of(&self, symbol: &str) -> Option<u8> {
        self.state.read().await.leverage.get(symbol).copied()
    }

    pub async fn margin_of(&self, symbol: &str) -> Option<MarginType> {
        self.state.read().await.margin.get(symbol).copied()
    }

    fn resting_order(order_id: i64, order: &NewOrder) -> Order {
        Order {
            order_id,
            symbol: order.symbol.clone(),
            status: OrderStatus::New,
            client_order_id: order
                .new_client_order_id
                .clone()
                .unwrap_or_else(|| format!("mock-{order_id}")),
            price: order.price.unwrap_or(Decimal::ZERO),
            avg_price: Decimal::ZERO,
            orig_qty: order.quantity.unwrap_or(Decimal::ZERO),
            executed_qty: Decimal::ZERO,
            stop_price: order.stop_price.unwrap_or(Decimal::ZERO),
            side: order.side,
            order_type: order.order_type,
            reduce_only: order.reduce_only.unwrap_or(false) || order.close_position == Some(true),
            close_position: order.close_position.unwrap_or(false),
            time_in_force: order.time_in_force,
            update_time: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Apply a new order to the book, as the venue would on acceptance.
    fn accept_order(&self, state: &mut MockState, order: &NewOrder) -> GatewayResult<Order> {
        if let Some(client_id) = &order.new_client_order_id {
            if state.orders.iter().any(|o| &o.client_order_id == client_id) {
                return Err(GatewayError::from_api_code(-4116, "ClientOrderId is duplicated."));
            }
        }

        let order_id = self.order_id_counter.fetch_add(1, Ordering::SeqCst);
        let mut placed = Self::resting_order(order_id, order);

        match (order.order_type, order.time_in_force) {
            (OrderType::Market, _) => {
                let mut qty = placed.orig_qty;
                if order.reduce_only == Some(true) {
                    qty = qty.min(state.position_amt(&order.symbol).abs());
                    if qty == Decimal::ZERO {
                        return Err(GatewayError::from_api_code(
                            -2022,
                            "ReduceOnly Order is rejected.",
                        ));
                    }
                }
                let price = state.mark(&order.symbol);
                placed.orig_qty = qty;
                state.orders.push(placed);
                let idx = state.orders.len() - 1;
                state.fill_order(idx, qty, price);
                if !state.report_market_avg_price {
                    state.orders[idx].avg_price = Decimal::ZERO;
                }
                debug!(symbol = %order.symbol, %qty, %price, "Mock market fill");
                return Ok(state.orders[idx].clone());
            }
            (OrderType::Limit, Some(TimeInForce::Gtx)) => {
                if state.reject_post_only {
                    return Err(GatewayError::from_api_code(
                        GatewayError::POST_ONLY_WOULD_CROSS,
                        "Post Only order will be rejected.",
                    ));
                }
                let price = placed.price;
                let qty = placed.orig_qty;
                match state.limit_fill {
                    LimitFill::Immediate => {
                        state.orders.push(placed);
                        let idx = state.orders.len() - 1;
                        state.fill_order(idx, qty, price);
                        return Ok(state.orders[idx].clone());
                    }
                    LimitFill::Partial(fraction) => {
                        state.orders.push(placed);
                        let idx = state.orders.len() - 1;
                        state.fill_order(idx, qty * fraction, price);
                        return Ok(state.orders[idx].clone());
                    }
                    LimitFill::AfterPolls(n) => {
                        state.polls_remaining.insert(order_id, n);
                    }
                    LimitFill::Never => {}
                }
            }
            _ => {}
        }

        placed.update_time = chrono::Utc::now().timestamp_millis();
        state.orders.push(placed.clone());
        Ok(placed)
    }
}

#[async_trait]
impl ExchangeGateway for MockExchange {
    async fn get_positions(&self) -> GatewayResult<Vec<Position>> {
        let mut state = self.state.write().await;
        state.take_failure("get_positions")?;
        Ok(state.positions.values().cloned().collect())
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> GatewayResult<Vec<Order>> {
        let mut state = self.state.write().await;
        state.take_failure("get_open_orders")?;
        Ok(state
            .orders
            .iter()
            .filter(|o| !o.status.is_terminal())
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .cloned()
            .collect())
    }

    async fn place_order(&self, order: &NewOrder) -> GatewayResult<Order> {
        let mut state = self.state.write().await;
        state.calls.push(format!(
            "place_order {} {} {}",
            order.symbol,
            order.order_type.as_str(),
            order.side
        ));
        state.take_failure("place_order")?;

        let placed = self.accept_order(&mut state, order)?;
        if state.lost_place_responses > 0 {
            state.lost_place_responses -= 1;
            return Err(GatewayError::Transient("scripted lost response".to_string()));
        }
        Ok(placed)
    }

    async fn get_order(&self, symbol: &str, order_id: i64) -> GatewayResult<Order> {
        let mut state = self.state.write().await;
        state.take_failure("get_order")?;

        let idx = state
            .orders
            .iter()
            .position(|o| o.order_id == order_id && o.symbol == symbol)
            .ok_or_else(|| GatewayError::from_api_code(-2013, "Order does not exist."))?;

        let fill_now = match state.polls_remaining.get_mut(&order_id) {
            Some(remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => false,
        };
        if fill_now {
            state.polls_remaining.remove(&order_id);
            if !state.orders[idx].status.is_terminal() {
                let qty = state.orders[idx].orig_qty - state.orders[idx].executed_qty;
                let price = state.orders[idx].price;
                state.fill_order(idx, qty, price);
            }
        }

        Ok(state.orders[idx].clone())
    }

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> GatewayResult<()> {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        state
            .calls
            .push(format!("cancel_order {symbol} {order_id}"));
        state.take_failure("cancel_order")?;

        if state.cancel_not_found {
            return Err(GatewayError::from_api_code(-2011, "Unknown order sent."));
        }

        match state
            .orders
            .iter_mut()
            .find(|o| o.order_id == order_id && o.symbol == symbol && !o.status.is_terminal())
        {
            Some(order) => {
                order.status = OrderStatus::Canceled;
                state.polls_remaining.remove(&order_id);
                Ok(())
            }
            None => Err(GatewayError::from_api_code(-2011, "Unknown order sent.")),
        }
    }

    async fn cancel_all(&self, symbol: &str) -> GatewayResult<()> {
        let mut state = self.state.write().await;
        state.calls.push(format!("cancel_all {symbol}"));
        state.take_failure("cancel_all")?;

        for order in state
            .orders
            .iter_mut()
            .filter(|o| o.symbol == symbol && !o.status.is_terminal())
        {
            order.status = OrderStatus::Canceled;
        }
        Ok(())
    }

    async fn get_symbol_filters(&self, symbol: &str) -> GatewayResult<SymbolFilters> {
        self.state
            .read()
            .await
            .filters
            .get(symbol)
            .copied()
            .ok_or_else(|| GatewayError::Configuration(format!("no usable filters for {symbol}")))
    }

    async fn get_mark_price(&self, symbol: &str) -> GatewayResult<Decimal> {
        let state = self.state.read().await;
        match state.mark(symbol) {
            price if price > Decimal::ZERO => Ok(price),
            _ => Err(GatewayError::Transient(format!("no mark price for {symbol}"))),
        }
    }

    async fn get_funding_rate(&self, symbol: &str) -> GatewayResult<Decimal> {
        let mut state = self.state.write().await;
        state.take_failure("get_funding_rate")?;
        Ok(state.funding.get(symbol).copied().unwrap_or(Decimal::ZERO))
    }

    async fn get_book_ticker(&self, symbol: &str) -> GatewayResult<BookTicker> {
        self.state
            .read()
            .await
            .books
            .get(symbol)
            .cloned()
            .ok_or_else(|| GatewayError::Transient(format!("no book for {symbol}")))
    }

    async fn set_leverage(&self, symbol: &str, leverage: u8) -> GatewayResult<()> {
        let mut state = self.state.write().await;
        state.calls.push(format!("set_leverage {symbol} {leverage}"));
        state.take_failure("set_leverage")?;
        state.leverage.insert(symbol.to_string(), leverage);
        Ok(())
    }

    async fn set_margin_mode(&self, symbol: &str, margin_type: MarginType) -> GatewayResult<()> {
        let mut state = self.state.write().await;
        state
            .calls
            .push(format!("set_margin_mode {symbol} {}", margin_type.as_api_str()));
        state.take_failure("set_margin_mode")?;
        if state.margin.get(symbol) == Some(&margin_type) {
            return Err(GatewayError::from_api_code(-4046, "No need to change margin type."));
        }
        state.margin.insert(symbol.to_string(), margin_type);
        Ok(())
    }

    async fn get_balances(&self) -> GatewayResult<Vec<AccountBalance>> {
        let mut state = self.state.write().await;
        state.take_failure("get_balances")?;
        Ok(state.balances.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_market_order_opens_and_reduce_only_closes() {
        let exchange = MockExchange::new();
        exchange.set_mark_price("BTCUSDT", dec!(60000)).await;

        let order = exchange
            .place_order(&NewOrder::market("BTCUSDT", OrderSide::Buy, dec!(0.01)))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.avg_price, dec!(60000));
        assert_eq!(exchange.position_amt("BTCUSDT").await, dec!(0.01));

        exchange
            .place_order(&NewOrder::reduce_only_market("BTCUSDT", OrderSide::Sell, dec!(1)))
            .await
            .unwrap();
        assert_eq!(exchange.position_amt("BTCUSDT").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_limit_fills_after_polls() {
        let exchange = MockExchange::new();
        exchange.set_limit_fill(LimitFill::AfterPolls(2)).await;

        let order = exchange
            .place_order(&NewOrder::post_only_limit("ETHUSDT", OrderSide::Sell, dec!(1), dec!(3000)))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::New);

        let first = exchange.get_order("ETHUSDT", order.order_id).await.unwrap();
        assert_eq!(first.status, OrderStatus::New);
        let second = exchange.get_order("ETHUSDT", order.order_id).await.unwrap();
        assert_eq!(second.status, OrderStatus::Filled);
        assert_eq!(exchange.position_amt("ETHUSDT").await, dec!(-1));
    }

    #[tokio::test]
    async fn test_duplicate_client_id_is_already_in_state() {
        let exchange = MockExchange::new();
        let order = NewOrder::close_position_stop("BTCUSDT", OrderSide::Sell, dec!(59000))
            .with_client_id("btr-BTCUSDT-sl-1");

        exchange.place_order(&order).await.unwrap();
        let err = exchange.place_order(&order).await.unwrap_err();
        assert!(err.is_already_in_state());
    }

    #[tokio::test]
    async fn test_lost_response_still_applies_order() {
        let exchange = MockExchange::new();
        exchange.set_mark_price("BTCUSDT", dec!(100)).await;
        exchange.lose_place_responses(1).await;
        let order = NewOrder::market("BTCUSDT", OrderSide::Buy, dec!(1))
            .with_client_id("btr-BTCUSDT-mkt-1");

        let err = exchange.place_order(&order).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(exchange.position_amt("BTCUSDT").await, dec!(1));

        let retry = exchange.place_order(&order).await.unwrap_err();
        assert!(retry.is_already_in_state());
    }

    #[tokio::test]
    async fn test_scripted_transient_failures_run_out() {
        let exchange = MockExchange::new();
        exchange.fail_times("set_leverage", 2).await;

        assert!(exchange.set_leverage("BTCUSDT", 5).await.is_err());
        assert!(exchange.set_leverage("BTCUSDT", 5).await.is_err());
        assert!(exchange.set_leverage("BTCUSDT", 5).await.is_ok());
        assert_eq!(exchange.leverage_of("BTCUSDT").await, Some(5));
    }

    #[tokio::test]
    async fn test_trigger_take_profit_reduces_position() {
        let exchange = MockExchange::new();
        exchange.set_position("BTCUSDT", dec!(1), dec!(100)).await;
        let tp = exchange
            .add_open_order(NewOrder::reduce_only_limit(
                "BTCUSDT",
                OrderSide::Sell,
                dec!(0.3),
                dec!(101),
            ))
            .await;

        exchange.trigger_order(tp).await;

        assert_eq!(exchange.position_amt("BTCUSDT").await, dec!(0.7));
        assert!(exchange.get_open_orders(Some("BTCUSDT")).await.unwrap().is_empty());
    }
}
