//! Reconciliation between the exchange, the ledger and the brackets we placed.
//!
//! Runs between cycles:
//! - Breakeven trailing once a take-profit leg has filled
//! - Orphan order cleanup for flat symbols
//! - Ledger status and balance sync

use crate::config::MonitorConfig;
use crate::exchange::{ExchangeGateway, NewOrder, Order, OrderSide, Position, PositionBook};
use crate::persistence::{BracketRecord, LedgerStore};
use crate::strategy::bracket::client_order_id;
use crate::utils::round_to_tick;
use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result of checking one position's stop.
#[derive(Debug, Clone, PartialEq)]
pub enum TrailOutcome {
    /// Stop moved to the new price.
    Tightened { from: Decimal, to: Decimal },
    /// All planned take-profit legs are still resting.
    LegsIntact,
    /// Existing stop is already at or beyond breakeven.
    AlreadyTight,
    /// Price has not moved past the breakeven level yet.
    NotInProfit,
    /// No bracket record for this position.
    NoBracket,
    NoStop,
    /// Old stop vanished while canceling (likely triggered).
    CancelRaced,
    Failed(String),
}

/// Summary of one monitor pass.
#[derive(Debug, Clone, Default)]
pub struct MonitorReport {
    pub positions_checked: usize,
    pub tightened: Vec<String>,
    pub failures: Vec<String>,
}

/// Keeps live brackets, open orders and the ledger consistent.
pub struct ReconciliationMonitor {
    gateway: Arc<dyn ExchangeGateway>,
    ledger: Arc<dyn LedgerStore>,
    config: MonitorConfig,
}

impl ReconciliationMonitor {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        ledger: Arc<dyn LedgerStore>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            gateway,
            ledger,
            config,
        }
    }

    /// Check every open position for breakeven trailing.
    pub async fn run_pass(&self) -> Result<MonitorReport> {
        let positions = self
            .gateway
            .get_positions()
            .await
            .context("Failed to fetch positions for monitor")?;
        let book = PositionBook::from_positions(positions);

        let orders = self
            .gateway
            .get_open_orders(None)
            .await
            .context("Failed to fetch open orders for monitor")?;
        let mut by_symbol: BTreeMap<&str, Vec<&Order>> = BTreeMap::new();
        for order in &orders {
            by_symbol.entry(order.symbol.as_str()).or_default().push(order);
        }

        let mut report = MonitorReport::default();
        for position in book.iter() {
            report.positions_checked += 1;
            let symbol_orders = by_symbol.remove(position.symbol.as_str()).unwrap_or_default();

            match self.trail_breakeven(position, &symbol_orders).await {
                TrailOutcome::Tightened { .. } => report.tightened.push(position.symbol.clone()),
                TrailOutcome::Failed(reason) => {
                    report.failures.push(format!("{}: {reason}", position.symbol))
                }
                _ => {}
            }
        }

        debug!(
            checked = report.positions_checked,
            tightened = report.tightened.len(),
            failures = report.failures.len(),
            "Monitor pass complete"
        );
        Ok(report)
    }

    /// Move the stop to breakeven plus buffer once a take-profit leg is gone.
    ///
    /// `orders` are the symbol's open orders. The stop is only ever tightened.
    pub async fn trail_breakeven(&self, position: &Position, orders: &[&Order]) -> TrailOutcome {
        let symbol = position.symbol.as_str();
        let Some(side) = position.side() else {
            return TrailOutcome::LegsIntact;
        };

        let record = match self.ledger.get_bracket(symbol) {
            Ok(Some(record)) if record.side == side => record,
            Ok(Some(record)) => {
                debug!(%symbol, recorded = %record.side, live = %side, "Bracket record is for the other side");
                return TrailOutcome::NoBracket;
            }
            Ok(None) => {
                debug!(%symbol, "No bracket record, leaving position alone");
                return TrailOutcome::NoBracket;
            }
            Err(e) => return TrailOutcome::Failed(format!("ledger: {e}")),
        };

        let remaining = orders.iter().filter(|o| o.is_take_profit_leg()).count();
        if remaining as u32 >= record.planned_tp_legs {
            return TrailOutcome::LegsIntact;
        }

        let Some(stop) = orders.iter().find(|o| o.is_stop_loss()) else {
            warn!(%symbol, remaining, planned = record.planned_tp_legs, "Take-profit filled but no stop found");
            return TrailOutcome::NoStop;
        };

        let filters = match self.gateway.get_symbol_filters(symbol).await {
            Ok(filters) => filters,
            Err(e) => return TrailOutcome::Failed(format!("filters: {e}")),
        };
        let target = breakeven_stop(&record, self.config.breakeven_buffer_atr, filters.price_tick);

        let tightens = match side {
            OrderSide::Buy => target > stop.stop_price,
            OrderSide::Sell => target < stop.stop_price,
        };
        if !tightens {
            return TrailOutcome::AlreadyTight;
        }

        // A stop on the wrong side of the mark would trigger on placement.
        let mark = match self.gateway.get_mark_price(symbol).await {
            Ok(mark) => mark,
            Err(e) => return TrailOutcome::Failed(format!("mark price: {e}")),
        };
        let in_profit = match side {
            OrderSide::Buy => mark > target,
            OrderSide::Sell => mark < target,
        };
        if !in_profit {
            debug!(%symbol, %mark, %target, "Mark not past breakeven yet");
            return TrailOutcome::NotInProfit;
        }

        match self.gateway.cancel_order(symbol, stop.order_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                info!(%symbol, order_id = stop.order_id, "Stop gone before cancel, skipping replacement");
                return TrailOutcome::CancelRaced;
            }
            Err(e) => return TrailOutcome::Failed(format!("cancel stop: {e}")),
        }

        let stamp = Utc::now().timestamp_millis();
        let replacement = NewOrder::close_position_stop(symbol, side.opposite(), target)
            .with_client_id(client_order_id(symbol, "be", stamp));

        match self.gateway.place_order(&replacement).await {
            Ok(order) => {
                if let Err(e) = self.ledger.log_order(&order, 0) {
                    warn!(%symbol, error = %e, "Failed to log breakeven stop");
                }
                info!(%symbol, from = %stop.stop_price, to = %target, remaining, "Stop moved to breakeven");
                TrailOutcome::Tightened {
                    from: stop.stop_price,
                    to: target,
                }
            }
            Err(e) => {
                error!(%symbol, error = %e, "Breakeven stop rejected, restoring previous stop");
                let restore = NewOrder::close_position_stop(symbol, side.opposite(), stop.stop_price)
                    .with_client_id(client_order_id(symbol, "sl-r", stamp));
                if let Err(restore_err) = self.gateway.place_order(&restore).await {
                    error!(%symbol, error = %restore_err, "Failed to restore stop; position unprotected");
                }
                TrailOutcome::Failed(format!("place stop: {e}"))
            }
        }
    }

    /// Cancel all orders on symbols that have open orders but no position.
    pub async fn cleanup_orphans(&self) -> Result<HashSet<String>> {
        let positions = self
            .gateway
            .get_positions()
            .await
            .context("Failed to fetch positions for orphan cleanup")?;
        let book = PositionBook::from_positions(positions);

        let orders = self
            .gateway
            .get_open_orders(None)
            .await
            .context("Failed to fetch open orders for orphan cleanup")?;

        let orphaned: HashSet<String> = orders
            .iter()
            .filter(|o| !book.contains(&o.symbol))
            .map(|o| o.symbol.clone())
            .collect();

        let mut cleaned = HashSet::new();
        for symbol in orphaned {
            match self.gateway.cancel_all(&symbol).await {
                Ok(()) => {
                    info!(%symbol, "Canceled orphaned orders");
                    cleaned.insert(symbol);
                }
                Err(e) => warn!(%symbol, error = %e, "Failed to cancel orphaned orders"),
            }
        }

        Ok(cleaned)
    }

    /// Refresh locally-open ledger orders and log wallet balances.
    ///
    /// Returns the number of orders whose status was refreshed.
    pub async fn sync_ledger(&self) -> Result<usize> {
        let open = self
            .ledger
            .get_locally_open()
            .context("Failed to read locally open orders")?;

        let mut updated = 0;
        for (order_id, symbol) in open {
            match self.gateway.get_order(&symbol, order_id).await {
                Ok(order) => {
                    self.ledger
                        .update_status(order_id, order.status)
                        .context("Failed to update order status")?;
                    updated += 1;
                }
                Err(e) => warn!(%symbol, order_id, error = %e, "Failed to refresh order status"),
            }
        }

        match self.gateway.get_balances().await {
            Ok(balances) => {
                for balance in balances.iter().filter(|b| b.balance != Decimal::ZERO) {
                    self.ledger
                        .log_balance(&balance.asset, balance.balance, balance.cross_un_pnl)
                        .context("Failed to log balance")?;
                }
            }
            Err(e) => warn!(error = %e, "Failed to fetch balances for ledger"),
        }

        debug!(updated, "Ledger synced");
        Ok(updated)
    }
}

/// Breakeven-plus-buffer stop price for a bracket, in the profit direction.
pub fn breakeven_stop(record: &BracketRecord, buffer_atr: Decimal, tick: Decimal) -> Decimal {
    let buffer = buffer_atr * record.atr;
    let raw = match record.side {
        OrderSide::Buy => record.entry_price + buffer,
        OrderSide::Sell => record.entry_price - buffer,
    };
    round_to_tick(raw, tick)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{MockExchange, OrderStatus, SymbolFilters};
    use crate::persistence::SqliteLedger;
    use rust_decimal_macros::dec;

    const SYMBOL: &str = "ETHUSDT";

    async fn setup() -> (Arc<MockExchange>, Arc<SqliteLedger>, ReconciliationMonitor) {
        let exchange = Arc::new(MockExchange::new());
        exchange
            .set_filters(
                SYMBOL,
                SymbolFilters {
                    qty_step: dec!(0.001),
                    price_tick: dec!(0.01),
                    min_qty: dec!(0.001),
                    max_qty: dec!(1000),
                },
            )
            .await;
        exchange.set_mark_price(SYMBOL, dec!(103)).await;

        let ledger = Arc::new(SqliteLedger::new(":memory:").unwrap());
        let monitor =
            ReconciliationMonitor::new(exchange.clone(), ledger.clone(), MonitorConfig::default());
        (exchange, ledger, monitor)
    }

    fn record(side: OrderSide, planned: u32) -> BracketRecord {
        BracketRecord {
            symbol: SYMBOL.to_string(),
            entry_order_id: 1,
            side,
            entry_price: dec!(100),
            atr: dec!(2),
            planned_tp_legs: planned,
            created_at: Utc::now(),
        }
    }

    /// Long 1.0 with a stop at 99 and `tp_left` resting take-profit legs.
    async fn long_bracket(exchange: &MockExchange, tp_left: usize) -> i64 {
        exchange.set_position(SYMBOL, dec!(1), dec!(100)).await;
        let stop_id = exchange
            .add_open_order(NewOrder::close_position_stop(SYMBOL, OrderSide::Sell, dec!(99)))
            .await;
        for i in 0..tp_left {
            exchange
                .add_open_order(NewOrder::reduce_only_limit(
                    SYMBOL,
                    OrderSide::Sell,
                    dec!(0.3),
                    dec!(102) + Decimal::from(i),
                ))
                .await;
        }
        stop_id
    }

    fn stops(orders: &[Order]) -> Vec<Decimal> {
        orders
            .iter()
            .filter(|o| o.is_stop_loss() && !o.status.is_terminal())
            .map(|o| o.stop_price)
            .collect()
    }

    #[test]
    fn test_breakeven_stop_direction() {
        assert_eq!(
            breakeven_stop(&record(OrderSide::Buy, 3), dec!(0.1), dec!(0.01)),
            dec!(100.2)
        );
        assert_eq!(
            breakeven_stop(&record(OrderSide::Sell, 3), dec!(0.1), dec!(0.01)),
            dec!(99.8)
        );
    }

    #[tokio::test]
    async fn test_moves_stop_after_take_profit_fills() {
        let (exchange, ledger, monitor) = setup().await;
        ledger.record_bracket(&record(OrderSide::Buy, 3)).unwrap();
        let old_stop = long_bracket(&exchange, 2).await;

        let report = monitor.run_pass().await.unwrap();

        assert_eq!(report.tightened, vec![SYMBOL.to_string()]);
        let orders = exchange.orders_for(SYMBOL).await;
        assert_eq!(stops(&orders), vec![dec!(100.2)]);
        assert!(orders
            .iter()
            .any(|o| o.order_id == old_stop && o.status == OrderStatus::Canceled));
    }

    #[tokio::test]
    async fn test_all_legs_resting_leaves_stop() {
        let (exchange, ledger, monitor) = setup().await;
        ledger.record_bracket(&record(OrderSide::Buy, 3)).unwrap();
        long_bracket(&exchange, 3).await;

        let report = monitor.run_pass().await.unwrap();

        assert!(report.tightened.is_empty());
        assert_eq!(exchange.call_count("cancel_order").await, 0);
    }

    #[tokio::test]
    async fn test_never_loosens_existing_stop() {
        let (exchange, ledger, monitor) = setup().await;
        ledger.record_bracket(&record(OrderSide::Buy, 3)).unwrap();
        exchange.set_position(SYMBOL, dec!(1), dec!(100)).await;
        exchange
            .add_open_order(NewOrder::close_position_stop(SYMBOL, OrderSide::Sell, dec!(101.5)))
            .await;

        let positions = exchange.get_positions().await.unwrap();
        let orders = exchange.get_open_orders(Some(SYMBOL)).await.unwrap();
        let refs: Vec<&Order> = orders.iter().collect();

        let outcome = monitor.trail_breakeven(&positions[0], &refs).await;

        assert_eq!(outcome, TrailOutcome::AlreadyTight);
        assert_eq!(exchange.call_count("cancel_order").await, 0);
        assert_eq!(exchange.call_count("place_order").await, 0);
    }

    #[tokio::test]
    async fn test_short_trails_downward() {
        let (exchange, ledger, monitor) = setup().await;
        exchange.set_mark_price(SYMBOL, dec!(97)).await;
        ledger.record_bracket(&record(OrderSide::Sell, 1)).unwrap();
        exchange.set_position(SYMBOL, dec!(-1), dec!(100)).await;
        exchange
            .add_open_order(NewOrder::close_position_stop(SYMBOL, OrderSide::Buy, dec!(101)))
            .await;

        let report = monitor.run_pass().await.unwrap();

        assert_eq!(report.tightened.len(), 1);
        assert_eq!(stops(&exchange.orders_for(SYMBOL).await), vec![dec!(99.8)]);
    }

    #[tokio::test]
    async fn test_cancel_race_skips_placement() {
        let (exchange, ledger, monitor) = setup().await;
        ledger.record_bracket(&record(OrderSide::Buy, 3)).unwrap();
        long_bracket(&exchange, 1).await;
        exchange.set_cancel_not_found(true).await;

        let positions = exchange.get_positions().await.unwrap();
        let orders = exchange.get_open_orders(Some(SYMBOL)).await.unwrap();
        let refs: Vec<&Order> = orders.iter().collect();

        let outcome = monitor.trail_breakeven(&positions[0], &refs).await;

        assert_eq!(outcome, TrailOutcome::CancelRaced);
        assert_eq!(exchange.call_count("place_order").await, 0);
    }

    #[tokio::test]
    async fn test_not_in_profit_keeps_stop() {
        let (exchange, ledger, monitor) = setup().await;
        exchange.set_mark_price(SYMBOL, dec!(100.1)).await;
        ledger.record_bracket(&record(OrderSide::Buy, 3)).unwrap();
        long_bracket(&exchange, 2).await;

        let report = monitor.run_pass().await.unwrap();

        assert!(report.tightened.is_empty());
        assert_eq!(stops(&exchange.orders_for(SYMBOL).await), vec![dec!(99)]);
    }

    #[tokio::test]
    async fn test_untracked_position_untouched() {
        let (exchange, _ledger, monitor) = setup().await;
        long_bracket(&exchange, 0).await;

        let report = monitor.run_pass().await.unwrap();

        assert_eq!(report.positions_checked, 1);
        assert!(report.tightened.is_empty());
        assert_eq!(exchange.call_count("cancel_order").await, 0);
    }

    #[tokio::test]
    async fn test_orphan_cleanup_is_exact() {
        let (exchange, _ledger, monitor) = setup().await;
        exchange.set_position("BTCUSDT", dec!(0.1), dec!(60000)).await;
        exchange
            .add_open_order(NewOrder::close_position_stop("BTCUSDT", OrderSide::Sell, dec!(59000)))
            .await;
        exchange
            .add_open_order(NewOrder::close_position_stop(SYMBOL, OrderSide::Sell, dec!(99)))
            .await;
        exchange
            .add_open_order(NewOrder::reduce_only_limit("SOLUSDT", OrderSide::Buy, dec!(1), dec!(90)))
            .await;

        let cleaned = monitor.cleanup_orphans().await.unwrap();

        let expected: HashSet<String> = ["ETHUSDT", "SOLUSDT"].iter().map(|s| s.to_string()).collect();
        assert_eq!(cleaned, expected);
        assert_eq!(exchange.call_count("cancel_all").await, 2);
        assert_eq!(exchange.get_open_orders(Some("BTCUSDT")).await.unwrap().len(), 1);
        assert!(exchange.get_open_orders(Some(SYMBOL)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_orphan_cleanup_fails_without_positions() {
        let (exchange, _ledger, monitor) = setup().await;
        exchange.fail_times("get_positions", 1).await;
        assert!(monitor.cleanup_orphans().await.is_err());
        assert_eq!(exchange.call_count("cancel_all").await, 0);
    }

    #[tokio::test]
    async fn test_sync_ledger_refreshes_status_and_balances() {
        let (exchange, ledger, monitor) = setup().await;
        let id = exchange
            .add_open_order(NewOrder::reduce_only_limit(SYMBOL, OrderSide::Sell, dec!(1), dec!(105)))
            .await;
        let resting = exchange.get_order(SYMBOL, id).await.unwrap();
        ledger.log_order(&resting, 5).unwrap();
        exchange.set_position(SYMBOL, dec!(1), dec!(100)).await;
        exchange.trigger_order(id).await;
        exchange.set_balance("USDT", dec!(1000)).await;
        exchange.set_balance("BNB", Decimal::ZERO).await;

        let updated = monitor.sync_ledger().await.unwrap();

        assert_eq!(updated, 1);
        assert!(ledger.get_locally_open().unwrap().is_empty());
        let balances = ledger.recent_balances(10).unwrap();
        assert_eq!(balances.len(), 1);
        assert_eq!(balances[0].asset, "USDT");
    }
}
