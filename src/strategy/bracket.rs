//! Entry pricing and bracket construction.
//!
//! All prices are rounded to the symbol tick and all quantities are rounded
//! down to the lot step before anything is sent to the exchange.

use super::banding::TpRung;
use crate::exchange::{BookTicker, NewOrder, OrderSide, SymbolFilters};
use crate::utils::{clamp_qty, round_down_to_lot, round_to_tick, safe_div};
use rust_decimal::Decimal;

const CLIENT_ID_PREFIX: &str = "btr";
const CLIENT_ID_MAX_LEN: usize = 36;

/// Client order id that stays the same across retries of one placement.
pub fn client_order_id(symbol: &str, tag: &str, stamp_ms: i64) -> String {
    let suffix = format!("-{tag}-{stamp_ms}");
    let budget = CLIENT_ID_MAX_LEN - CLIENT_ID_PREFIX.len() - 1 - suffix.len();
    let symbol: String = symbol.chars().take(budget).collect();
    format!("{CLIENT_ID_PREFIX}-{symbol}{suffix}")
}

/// Passive limit price: offset from mid by `offset_atr × ATR`, never through the touch.
pub fn passive_entry_price(
    side: OrderSide,
    book: &BookTicker,
    atr: Decimal,
    offset_atr: Decimal,
    tick: Decimal,
) -> Decimal {
    let offset = offset_atr * atr;
    let mid = book.mid();
    let raw = match side {
        OrderSide::Buy => (mid - offset).min(book.bid_price),
        OrderSide::Sell => (mid + offset).max(book.ask_price),
    };
    round_to_tick(raw, tick)
}

/// Order quantity for a notional at `price`, clamped to filters and rounded down to step.
pub fn entry_quantity(notional: Decimal, price: Decimal, filters: &SymbolFilters) -> Decimal {
    let raw = safe_div(notional, price);
    if raw <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let clamped = clamp_qty(raw, filters.min_qty, filters.max_qty);
    round_down_to_lot(clamped, filters.qty_step)
}

/// One take-profit leg, already rounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TakeProfitLeg {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Protective orders for a filled entry.
#[derive(Debug, Clone, PartialEq)]
pub struct BracketPlan {
    pub symbol: String,
    pub entry_side: OrderSide,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub stop_loss: Decimal,
    pub take_profits: Vec<TakeProfitLeg>,
}

impl BracketPlan {
    /// Build the bracket around the achieved entry.
    ///
    /// Legs whose rounded quantity is zero are dropped; the unladdered
    /// remainder stays open as a runner protected only by the stop.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        symbol: &str,
        entry_side: OrderSide,
        entry_price: Decimal,
        quantity: Decimal,
        atr: Decimal,
        tp_plan: &[TpRung],
        sl_atr_multiplier: Decimal,
        filters: &SymbolFilters,
    ) -> Self {
        let direction = match entry_side {
            OrderSide::Buy => Decimal::ONE,
            OrderSide::Sell => -Decimal::ONE,
        };

        let stop_loss = round_to_tick(
            entry_price - direction * sl_atr_multiplier * atr,
            filters.price_tick,
        );

        let take_profits = tp_plan
            .iter()
            .map(|rung| TakeProfitLeg {
                price: round_to_tick(
                    entry_price + direction * rung.atr_multiple * atr,
                    filters.price_tick,
                ),
                quantity: round_down_to_lot(quantity * rung.qty_fraction, filters.qty_step),
            })
            .filter(|leg| leg.quantity > Decimal::ZERO)
            .collect();

        Self {
            symbol: symbol.to_string(),
            entry_side,
            entry_price,
            quantity,
            stop_loss,
            take_profits,
        }
    }

    pub fn exit_side(&self) -> OrderSide {
        self.entry_side.opposite()
    }

    /// Stop-market order closing the whole position.
    pub fn stop_order(&self, stamp_ms: i64) -> NewOrder {
        NewOrder::close_position_stop(&self.symbol, self.exit_side(), self.stop_loss)
            .with_client_id(client_order_id(&self.symbol, "sl", stamp_ms))
    }

    /// Reduce-only limit orders, one per leg.
    pub fn take_profit_orders(&self, stamp_ms: i64) -> Vec<NewOrder> {
        self.take_profits
            .iter()
            .enumerate()
            .map(|(i, leg)| {
                NewOrder::reduce_only_limit(&self.symbol, self.exit_side(), leg.quantity, leg.price)
                    .with_client_id(client_order_id(&self.symbol, &format!("tp{}", i + 1), stamp_ms))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::OrderType;
    use rust_decimal_macros::dec;

    fn filters() -> SymbolFilters {
        SymbolFilters {
            qty_step: dec!(0.001),
            price_tick: dec!(0.01),
            min_qty: dec!(0.001),
            max_qty: dec!(1000),
        }
    }

    fn book(bid: Decimal, ask: Decimal) -> BookTicker {
        BookTicker {
            symbol: "BTCUSDT".to_string(),
            bid_price: bid,
            bid_qty: dec!(1),
            ask_price: ask,
            ask_qty: dec!(1),
        }
    }

    fn ladder() -> Vec<TpRung> {
        vec![
            TpRung { atr_multiple: dec!(0.6), qty_fraction: dec!(0.3) },
            TpRung { atr_multiple: dec!(1.2), qty_fraction: dec!(0.3) },
            TpRung { atr_multiple: dec!(2.4), qty_fraction: dec!(0.2) },
        ]
    }

    #[test]
    fn test_band2_single_target_bracket() {
        let plan = BracketPlan::build(
            "BTCUSDT",
            OrderSide::Buy,
            dec!(100),
            dec!(0.5),
            dec!(2),
            &[TpRung { atr_multiple: dec!(0.5), qty_fraction: dec!(1) }],
            dec!(0.5),
            &filters(),
        );

        assert_eq!(plan.stop_loss, dec!(99.00));
        assert_eq!(
            plan.take_profits,
            vec![TakeProfitLeg { price: dec!(101.00), quantity: dec!(0.5) }]
        );
    }

    #[test]
    fn test_short_ladder_mirrors_prices() {
        let plan = BracketPlan::build(
            "ETHUSDT",
            OrderSide::Sell,
            dec!(3000),
            dec!(1),
            dec!(20),
            &ladder(),
            dec!(0.5),
            &filters(),
        );

        assert_eq!(plan.stop_loss, dec!(3010));
        let prices: Vec<_> = plan.take_profits.iter().map(|l| l.price).collect();
        let qtys: Vec<_> = plan.take_profits.iter().map(|l| l.quantity).collect();
        assert_eq!(prices, vec![dec!(2988), dec!(2976), dec!(2952)]);
        assert_eq!(qtys, vec![dec!(0.3), dec!(0.3), dec!(0.2)]);

        let bracketed: Decimal = qtys.iter().sum();
        assert!(bracketed <= plan.quantity);
    }

    #[test]
    fn test_zero_quantity_legs_dropped() {
        let plan = BracketPlan::build(
            "BTCUSDT",
            OrderSide::Buy,
            dec!(60000),
            dec!(0.004),
            dec!(500),
            &ladder(),
            dec!(0.5),
            &filters(),
        );

        // 0.004 × 0.2 = 0.0008 rounds down to zero
        assert_eq!(plan.take_profits.len(), 2);
        assert!(plan.take_profits.iter().all(|l| l.quantity == dec!(0.001)));
    }

    #[test]
    fn test_bracket_orders() {
        let plan = BracketPlan::build(
            "BTCUSDT",
            OrderSide::Buy,
            dec!(100),
            dec!(1),
            dec!(2),
            &ladder(),
            dec!(0.5),
            &filters(),
        );

        let stop = plan.stop_order(1_700_000_000_000);
        assert_eq!(stop.order_type, OrderType::StopMarket);
        assert_eq!(stop.side, OrderSide::Sell);
        assert_eq!(stop.close_position, Some(true));
        assert_eq!(stop.stop_price, Some(dec!(99)));

        let tps = plan.take_profit_orders(1_700_000_000_000);
        assert_eq!(tps.len(), 3);
        assert!(tps.iter().all(|o| o.reduce_only == Some(true) && o.order_type == OrderType::Limit));
        assert_eq!(
            tps[2].new_client_order_id.as_deref(),
            Some("btr-BTCUSDT-tp3-1700000000000")
        );
    }

    #[test]
    fn test_passive_entry_price_never_crosses_touch() {
        let tight = book(dec!(99.99), dec!(100.01));
        // mid 100 − 0.1 × 2 = 99.8 (below bid)
        assert_eq!(
            passive_entry_price(OrderSide::Buy, &tight, dec!(2), dec!(0.1), dec!(0.01)),
            dec!(99.8)
        );
        assert_eq!(
            passive_entry_price(OrderSide::Sell, &tight, dec!(2), dec!(0.1), dec!(0.01)),
            dec!(100.2)
        );

        // Offset smaller than half the spread: clamp to the touch
        let wide = book(dec!(99), dec!(101));
        assert_eq!(
            passive_entry_price(OrderSide::Buy, &wide, dec!(2), dec!(0.1), dec!(0.01)),
            dec!(99)
        );
        assert_eq!(
            passive_entry_price(OrderSide::Sell, &wide, dec!(2), dec!(0.1), dec!(0.01)),
            dec!(101)
        );
    }

    #[test]
    fn test_entry_quantity_clamps_and_rounds() {
        let f = filters();
        assert_eq!(entry_quantity(dec!(70), dec!(100), &f), dec!(0.7));
        assert_eq!(entry_quantity(dec!(0.01), dec!(100), &f), dec!(0.001));
        assert_eq!(entry_quantity(dec!(1_000_000), dec!(100), &f), dec!(1000));
        assert_eq!(entry_quantity(dec!(10), Decimal::ZERO, &f), Decimal::ZERO);
        assert_eq!(entry_quantity(dec!(100), dec!(30000), &f), dec!(0.003));
    }

    #[test]
    fn test_client_order_id_fits_limit() {
        let id = client_order_id("1000SHIBUSDT", "entry", 1_700_000_000_000);
        assert!(id.len() <= 36);
        assert_eq!(id, "btr-1000SHIBUSDT-entry-1700000000000");

        let long = client_order_id("AVERYLONGSYMBOLNAMEUSDT", "tp3", 1_700_000_000_000);
        assert!(long.len() <= 36);
        assert!(long.ends_with("-tp3-1700000000000"));
    }
}
