//! Order execution: closes, entries and brackets.
//!
//! One call to [`ExecutionEngine::execute`] handles one planned action. All
//! exchange-mutating steps for a symbol run strictly in sequence:
//! cancel → margin → leverage → entry → stop → take-profits.

use super::bracket::{client_order_id, entry_quantity, passive_entry_price, BracketPlan};
use super::selector::{OpenAction, PlannedAction};
use crate::config::ExecutionConfig;
use crate::exchange::{
    ExchangeGateway, GatewayError, GatewayResult, NewOrder, Order, OrderSide, OrderStatus,
    PositionBook,
};
use crate::persistence::{BracketRecord, LedgerStore};
use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How the entry was filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryRoute {
    /// Passive limit filled completely.
    Limit,
    /// Passive limit partially filled before timeout; remainder canceled.
    PartialLimit,
    /// Market order after the passive limit failed or timed out.
    Market,
}

/// The order that produced the position.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryFill {
    pub order_id: i64,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub route: EntryRoute,
}

/// Why an entry produced no position to bracket.
#[derive(Debug, Error)]
enum EntryError {
    #[error("entry failed: {0}")]
    Gateway(#[from] GatewayError),
    /// The passive order may still be working; a market order could double the entry.
    #[error("entry cancel unconfirmed: order {order_id} {detail}")]
    CancelUnconfirmed { order_id: i64, detail: String },
}

/// Where a passive entry ended up after polling.
enum PassiveOutcome {
    Filled(EntryFill),
    /// Confirmed terminal with nothing executed.
    Unfilled,
    Unconfirmed(String),
}

/// What was actually placed around an entry.
#[derive(Debug, Clone, PartialEq)]
pub struct BracketOutcome {
    pub plan: BracketPlan,
    pub stop_placed: bool,
    pub take_profits_placed: usize,
}

/// Outcome of one planned action.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    /// Existing position already matches the decision.
    Held,
    /// Close requested but nothing was open.
    AlreadyFlat,
    Closed { quantity: Decimal },
    Opened { entry: EntryFill, bracket: BracketOutcome },
    Skipped { reason: String },
    Failed { reason: String },
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionResult::Held => write!(f, "held"),
            ExecutionResult::AlreadyFlat => write!(f, "already flat"),
            ExecutionResult::Closed { quantity } => write!(f, "closed {quantity}"),
            ExecutionResult::Opened { entry, bracket } => write!(
                f,
                "opened {} {} @ {} via {:?} (sl: {}, tp: {}/{})",
                entry.side,
                entry.quantity,
                entry.price,
                entry.route,
                bracket.stop_placed,
                bracket.take_profits_placed,
                bracket.plan.take_profits.len()
            ),
            ExecutionResult::Skipped { reason } => write!(f, "skipped: {reason}"),
            ExecutionResult::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Drives positions toward planned actions through the gateway.
pub struct ExecutionEngine {
    gateway: Arc<dyn ExchangeGateway>,
    ledger: Arc<dyn LedgerStore>,
    config: ExecutionConfig,
    sl_atr_multiplier: Decimal,
}

impl ExecutionEngine {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        ledger: Arc<dyn LedgerStore>,
        config: ExecutionConfig,
        sl_atr_multiplier: Decimal,
    ) -> Self {
        Self {
            gateway,
            ledger,
            config,
            sl_atr_multiplier,
        }
    }

    /// Execute one action against the cycle's position snapshot.
    pub async fn execute(&self, action: &PlannedAction, positions: &PositionBook) -> ExecutionResult {
        match action {
            PlannedAction::Close { symbol, reason } => {
                info!(%symbol, %reason, "Closing position");
                match self.close_position(symbol).await {
                    Ok(Some(quantity)) => ExecutionResult::Closed { quantity },
                    Ok(None) => ExecutionResult::AlreadyFlat,
                    Err(e) => {
                        error!(%symbol, error = %e, "Close failed");
                        ExecutionResult::Failed {
                            reason: format!("close failed: {e}"),
                        }
                    }
                }
            }
            PlannedAction::Open(open) => self.open_position(open, positions).await,
        }
    }

    /// Cancel the symbol's orders and flatten it with a reduce-only market order.
    ///
    /// Returns the closed quantity, or `None` when the position was already flat.
    pub async fn close_position(&self, symbol: &str) -> GatewayResult<Option<Decimal>> {
        if let Err(e) = self.gateway.cancel_all(symbol).await {
            warn!(%symbol, error = %e, "Failed to cancel open orders before close");
        }

        let amount = self
            .gateway
            .get_positions()
            .await?
            .into_iter()
            .find(|p| p.symbol == symbol)
            .map(|p| p.position_amt)
            .unwrap_or(Decimal::ZERO);

        let Some(side) = OrderSide::from_position_amt(amount) else {
            debug!(%symbol, "Nothing to close");
            return Ok(None);
        };

        let quantity = amount.abs();
        let stamp = Utc::now().timestamp_millis();
        let order = NewOrder::reduce_only_market(symbol, side.opposite(), quantity)
            .with_client_id(client_order_id(symbol, "close", stamp));

        match self
            .with_retry(symbol, "close", || self.gateway.place_order(&order))
            .await
        {
            Ok(placed) => {
                self.record(&placed, 0);
                info!(%symbol, %quantity, side = %side.opposite(), order_id = placed.order_id, "Position closed");
            }
            // Same client id: an earlier attempt reached the venue.
            Err(e) if e.is_already_in_state() => {
                info!(%symbol, %quantity, side = %side.opposite(), "Close already accepted");
            }
            Err(e) => return Err(e),
        }
        Ok(Some(quantity))
    }

    async fn open_position(&self, open: &OpenAction, positions: &PositionBook) -> ExecutionResult {
        let symbol = open.symbol.as_str();

        match positions.side(symbol) {
            Some(held) if held == open.side => {
                info!(%symbol, side = %held, "Holding existing position");
                return ExecutionResult::Held;
            }
            Some(held) => {
                info!(%symbol, from = %held, to = %open.side, "Flipping position");
                if let Err(e) = self.close_position(symbol).await {
                    error!(%symbol, error = %e, "Flip close failed, not opening");
                    return ExecutionResult::Failed {
                        reason: format!("flip close failed: {e}"),
                    };
                }
            }
            None => {}
        }

        if open.leverage == 0 {
            return ExecutionResult::Skipped {
                reason: "no band for a fresh entry".to_string(),
            };
        }

        if let Err(e) = self.gateway.cancel_all(symbol).await {
            warn!(%symbol, error = %e, "Failed to cancel stray orders");
        }

        if let Err(e) = self.prepare_symbol(symbol, open.leverage).await {
            error!(%symbol, error = %e, "Margin/leverage setup failed");
            return ExecutionResult::Failed {
                reason: format!("setup failed: {e}"),
            };
        }

        let filters = match self.gateway.get_symbol_filters(symbol).await {
            Ok(filters) => filters,
            Err(e) => {
                warn!(%symbol, error = %e, "Symbol filters unavailable, skipping");
                return ExecutionResult::Skipped {
                    reason: format!("filters unavailable: {e}"),
                };
            }
        };

        let limit_price = match self.gateway.get_book_ticker(symbol).await {
            Ok(book) => Some(passive_entry_price(
                open.side,
                &book,
                open.atr,
                self.config.entry_offset_atr,
                filters.price_tick,
            )),
            Err(e) => {
                warn!(%symbol, error = %e, "No book ticker, entering at market");
                None
            }
        };

        let reference_price = match limit_price {
            Some(price) => price,
            None => match self.gateway.get_mark_price(symbol).await {
                Ok(price) => price,
                Err(e) => {
                    return ExecutionResult::Failed {
                        reason: format!("no price available: {e}"),
                    }
                }
            },
        };

        let quantity = entry_quantity(open.notional, reference_price, &filters);
        if quantity <= Decimal::ZERO {
            warn!(%symbol, notional = %open.notional, %reference_price, "Quantity rounds to zero");
            return ExecutionResult::Skipped {
                reason: "quantity rounds to zero".to_string(),
            };
        }

        info!(
            %symbol,
            side = %open.side,
            %quantity,
            notional = %open.notional,
            leverage = open.leverage,
            limit_price = ?limit_price,
            "Opening position"
        );

        let stamp = Utc::now().timestamp_millis();
        let entry = match self
            .enter(open, quantity, limit_price, reference_price, stamp)
            .await
        {
            Ok(entry) => entry,
            Err(e) => {
                error!(%symbol, error = %e, "Entry failed");
                return ExecutionResult::Failed {
                    reason: e.to_string(),
                };
            }
        };

        let plan = BracketPlan::build(
            symbol,
            open.side,
            entry.price,
            entry.quantity,
            open.atr,
            &open.tp_plan,
            self.sl_atr_multiplier,
            &filters,
        );
        let bracket = self.place_bracket(&plan, open.leverage, stamp).await;

        let record = BracketRecord {
            symbol: symbol.to_string(),
            entry_order_id: entry.order_id,
            side: open.side,
            entry_price: entry.price,
            atr: open.atr,
            planned_tp_legs: bracket.take_profits_placed as u32,
            created_at: Utc::now(),
        };
        if let Err(e) = self.ledger.record_bracket(&record) {
            warn!(%symbol, error = %e, "Failed to record bracket");
        }

        ExecutionResult::Opened { entry, bracket }
    }

    /// Set margin mode then leverage, tolerating "already set".
    async fn prepare_symbol(&self, symbol: &str, leverage: u8) -> GatewayResult<()> {
        let margin_type = self.config.margin_type;
        match self
            .with_retry(symbol, "margin", || {
                self.gateway.set_margin_mode(symbol, margin_type)
            })
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_already_in_state() => debug!(%symbol, "Margin type already set"),
            Err(e) => return Err(e),
        }

        match self
            .with_retry(symbol, "leverage", || self.gateway.set_leverage(symbol, leverage))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_in_state() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Passive limit first; market when it is rejected, or confirmed terminal
    /// with nothing filled.
    async fn enter(
        &self,
        open: &OpenAction,
        quantity: Decimal,
        limit_price: Option<Decimal>,
        reference_price: Decimal,
        stamp: i64,
    ) -> Result<EntryFill, EntryError> {
        let symbol = open.symbol.as_str();

        if let Some(price) = limit_price {
            let order = NewOrder::post_only_limit(symbol, open.side, quantity, price)
                .with_client_id(client_order_id(symbol, "entry", stamp));

            match self.gateway.place_order(&order).await {
                Ok(placed) => {
                    let order_id = placed.order_id;
                    match self.track_limit(placed, open.leverage).await {
                        PassiveOutcome::Filled(fill) => return Ok(fill),
                        PassiveOutcome::Unfilled => {}
                        PassiveOutcome::Unconfirmed(detail) => {
                            return Err(EntryError::CancelUnconfirmed { order_id, detail });
                        }
                    }
                }
                Err(GatewayError::Rejected { code, msg }) => {
                    info!(%symbol, code, %msg, "Passive entry rejected, falling back to market");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(self.market_entry(open, quantity, reference_price, stamp).await?)
    }

    /// Poll a resting entry until filled or timed out, then cancel it.
    ///
    /// `Unfilled` only when the order is confirmed terminal with nothing
    /// executed; any doubt about its state is `Unconfirmed`.
    async fn track_limit(&self, placed: Order, leverage: u8) -> PassiveOutcome {
        let symbol = placed.symbol.clone();
        let order_id = placed.order_id;
        let deadline = Instant::now() + self.config.fill_timeout();
        let mut last = placed;

        loop {
            match last.status {
                OrderStatus::Filled => {
                    info!(%symbol, order_id, avg_price = %last.avg_price, "Passive entry filled");
                    return PassiveOutcome::Filled(self.limit_fill(&last, leverage, EntryRoute::Limit));
                }
                status if status.is_terminal() => {
                    info!(%symbol, order_id, %status, "Passive entry ended without full fill");
                    return self.settle_unfilled(&last, leverage);
                }
                _ => {}
            }

            if Instant::now() >= deadline {
                break;
            }

            tokio::time::sleep(self.config.fill_poll_interval()).await;

            match self.gateway.get_order(&symbol, order_id).await {
                Ok(order) => last = order,
                Err(e) => warn!(%symbol, order_id, error = %e, "Failed to poll entry order"),
            }
        }

        info!(%symbol, order_id, executed = %last.executed_qty, "Passive entry timed out, canceling");
        match self
            .with_retry(&symbol, "cancel entry", || self.gateway.cancel_order(&symbol, order_id))
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(%symbol, order_id, "Entry already gone at cancel"),
            Err(e) => {
                error!(%symbol, order_id, error = %e, "Failed to cancel entry order");
                return PassiveOutcome::Unconfirmed(format!("cancel failed: {e}"));
            }
        }

        // A fill can land between the last poll and the cancel.
        let order = match self
            .with_retry(&symbol, "query entry", || self.gateway.get_order(&symbol, order_id))
            .await
        {
            Ok(order) => order,
            Err(e) => {
                error!(%symbol, order_id, error = %e, "Entry status unknown after cancel");
                return PassiveOutcome::Unconfirmed(format!("status unknown: {e}"));
            }
        };

        match order.status {
            OrderStatus::Filled => {
                PassiveOutcome::Filled(self.limit_fill(&order, leverage, EntryRoute::Limit))
            }
            status if status.is_terminal() => self.settle_unfilled(&order, leverage),
            status => {
                error!(%symbol, order_id, %status, "Entry still working after cancel");
                PassiveOutcome::Unconfirmed(format!("still {status} after cancel"))
            }
        }
    }

    /// Keep a partial fill, or signal market fallback when nothing executed.
    fn settle_unfilled(&self, order: &Order, leverage: u8) -> PassiveOutcome {
        if order.executed_qty > Decimal::ZERO {
            info!(
                symbol = %order.symbol,
                order_id = order.order_id,
                executed = %order.executed_qty,
                "Keeping partial passive fill"
            );
            PassiveOutcome::Filled(self.limit_fill(order, leverage, EntryRoute::PartialLimit))
        } else {
            PassiveOutcome::Unfilled
        }
    }

    fn limit_fill(&self, order: &Order, leverage: u8, route: EntryRoute) -> EntryFill {
        self.record(order, leverage);
        let price = if order.avg_price > Decimal::ZERO {
            order.avg_price
        } else {
            order.price
        };
        EntryFill {
            order_id: order.order_id,
            side: order.side,
            quantity: order.executed_qty,
            price,
            route,
        }
    }

    async fn market_entry(
        &self,
        open: &OpenAction,
        quantity: Decimal,
        reference_price: Decimal,
        stamp: i64,
    ) -> GatewayResult<EntryFill> {
        let symbol = open.symbol.as_str();
        let order = NewOrder::market(symbol, open.side, quantity)
            .with_client_id(client_order_id(symbol, "mkt", stamp));

        let mut placed = self.gateway.place_order(&order).await?;

        if placed.avg_price <= Decimal::ZERO {
            if let Ok(queried) = self.gateway.get_order(symbol, placed.order_id).await {
                placed = queried;
            }
        }

        let price = if placed.avg_price > Decimal::ZERO {
            placed.avg_price
        } else {
            match self.gateway.get_mark_price(symbol).await {
                Ok(mark) => mark,
                Err(e) => {
                    warn!(%symbol, error = %e, "No fill or mark price, using reference price");
                    reference_price
                }
            }
        };
        let filled = if placed.executed_qty > Decimal::ZERO {
            placed.executed_qty
        } else {
            quantity
        };

        self.record(&placed, open.leverage);
        info!(%symbol, order_id = placed.order_id, %filled, %price, "Market entry filled");

        Ok(EntryFill {
            order_id: placed.order_id,
            side: open.side,
            quantity: filled,
            price,
            route: EntryRoute::Market,
        })
    }

    /// Place the stop and each take-profit independently.
    async fn place_bracket(&self, plan: &BracketPlan, leverage: u8, stamp: i64) -> BracketOutcome {
        let symbol = plan.symbol.as_str();

        let stop = plan.stop_order(stamp);
        let stop_placed = self.place_leg(symbol, "stop", &stop, leverage).await;

        let mut take_profits_placed = 0;
        for (i, order) in plan.take_profit_orders(stamp).iter().enumerate() {
            if self.place_leg(symbol, "take-profit", order, leverage).await {
                take_profits_placed += 1;
            } else {
                warn!(%symbol, leg = i + 1, "Take-profit leg abandoned");
            }
        }

        info!(
            %symbol,
            stop_loss = %plan.stop_loss,
            stop_placed,
            take_profits = take_profits_placed,
            planned = plan.take_profits.len(),
            "Bracket placed"
        );

        BracketOutcome {
            plan: plan.clone(),
            stop_placed,
            take_profits_placed,
        }
    }

    async fn place_leg(&self, symbol: &str, leg: &str, order: &NewOrder, leverage: u8) -> bool {
        match self
            .with_retry(symbol, leg, || self.gateway.place_order(order))
            .await
        {
            Ok(placed) => {
                self.record(&placed, leverage);
                true
            }
            Err(e) if e.is_already_in_state() => {
                debug!(%symbol, leg, "Leg already placed");
                true
            }
            Err(e) => {
                error!(%symbol, leg, error = %e, "Bracket leg failed");
                false
            }
        }
    }

    fn record(&self, order: &Order, leverage: u8) {
        if let Err(e) = self.ledger.log_order(order, leverage) {
            warn!(symbol = %order.symbol, order_id = order.order_id, error = %e, "Failed to log order");
        }
    }

    fn backoff(&self) -> Duration {
        let ms = rand::thread_rng()
            .gen_range(self.config.retry_backoff_min_ms..=self.config.retry_backoff_max_ms);
        Duration::from_millis(ms)
    }

    /// Retry transient failures with randomized backoff; other errors return at once.
    async fn with_retry<T, F, Fut>(&self, symbol: &str, op: &str, mut call: F) -> GatewayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let max_retries = self.config.retry_attempts.max(1);
        let mut attempt = 1;

        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_retries => {
                    warn!(%symbol, op, attempt, max_retries, error = %e, "Call failed, retrying");
                    tokio::time::sleep(self.backoff()).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
