//! Portfolio selection: ranks decisions, caps the book and sizes positions.

use super::banding::{Side, TpRung, TradeDecision};
use crate::config::PortfolioConfig;
use crate::exchange::{OrderSide, PositionBook};
use crate::utils::safe_div;
use rust_decimal::Decimal;
use std::collections::HashSet;
use tracing::{debug, info};

/// Target position for one selected symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenAction {
    pub symbol: String,
    pub side: OrderSide,
    /// 0 for a hysteresis hold (never opens).
    pub leverage: u8,
    pub band: u8,
    /// Position notional in USDT (margin × leverage).
    pub notional: Decimal,
    pub weight: Decimal,
    pub atr: Decimal,
    pub edge: Decimal,
    pub tp_plan: Vec<TpRung>,
}

/// One step of the execution plan.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedAction {
    Close { symbol: String, reason: String },
    Open(OpenAction),
}

impl PlannedAction {
    pub fn symbol(&self) -> &str {
        match self {
            PlannedAction::Close { symbol, .. } => symbol,
            PlannedAction::Open(open) => &open.symbol,
        }
    }
}

/// Ordered actions for one cycle; at most one per symbol.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    pub actions: Vec<PlannedAction>,
    pub deployable_capital: Decimal,
}

impl ExecutionPlan {
    pub fn opens(&self) -> impl Iterator<Item = &OpenAction> {
        self.actions.iter().filter_map(|a| match a {
            PlannedAction::Open(open) => Some(open),
            PlannedAction::Close { .. } => None,
        })
    }

    pub fn closes(&self) -> impl Iterator<Item = &str> {
        self.actions.iter().filter_map(|a| match a {
            PlannedAction::Close { symbol, .. } => Some(symbol.as_str()),
            PlannedAction::Open(_) => None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }
}

/// Selects the top decisions by conviction and weights them by inverse volatility.
pub struct PortfolioSelector {
    config: PortfolioConfig,
}

impl PortfolioSelector {
    pub fn new(config: PortfolioConfig) -> Self {
        Self { config }
    }

    /// Capital available for margin given the quote wallet balance.
    pub fn deployable_capital(&self, wallet_balance: Decimal) -> Decimal {
        wallet_balance * self.config.capital_utilization
    }

    /// Inverse-volatility weights, or equal weights when any volatility is
    /// non-positive, the total inverse volatility is at most one, or the total
    /// does not fit in a `Decimal`.
    pub fn weights(volatilities: &[Decimal]) -> Vec<Decimal> {
        if volatilities.is_empty() {
            return Vec::new();
        }

        let equal = Decimal::ONE / Decimal::from(volatilities.len());
        if volatilities.iter().any(|v| *v <= Decimal::ZERO) {
            return vec![equal; volatilities.len()];
        }

        let inverse: Option<Vec<Decimal>> = volatilities
            .iter()
            .map(|v| Decimal::ONE.checked_div(*v))
            .collect();
        let total = inverse.as_ref().and_then(|inv| {
            inv.iter()
                .try_fold(Decimal::ZERO, |acc, x| acc.checked_add(*x))
        });
        let (Some(inverse), Some(total)) = (inverse, total) else {
            debug!(count = volatilities.len(), "Inverse volatility overflowed, using equal weights");
            return vec![equal; volatilities.len()];
        };
        if total <= Decimal::ONE {
            return vec![equal; volatilities.len()];
        }

        inverse.iter().map(|inv| safe_div(*inv, total)).collect()
    }

    /// Build the plan from this cycle's decisions and the live position snapshot.
    ///
    /// `capital` is deployable capital (see [`Self::deployable_capital`]).
    pub fn select(
        &self,
        decisions: &[TradeDecision],
        positions: &PositionBook,
        capital: Decimal,
    ) -> ExecutionPlan {
        let mut eligible: Vec<&TradeDecision> = decisions
            .iter()
            .filter(|d| d.side != Side::Neutral)
            .collect();
        // Stable: equal |edge| keeps input order
        eligible.sort_by(|a, b| b.edge.abs().cmp(&a.edge.abs()));

        let selected: Vec<&TradeDecision> = eligible
            .iter()
            .take(self.config.max_positions)
            .copied()
            .collect();
        let selected_symbols: HashSet<&str> =
            selected.iter().map(|d| d.symbol.as_str()).collect();

        info!(
            eligible = eligible.len(),
            selected = selected.len(),
            limit = self.config.max_positions,
            "Portfolio selected"
        );

        let mut actions = Vec::new();

        for symbol in positions.symbols() {
            if selected_symbols.contains(symbol.as_str()) {
                continue;
            }
            let reason = match decisions.iter().find(|d| d.symbol == symbol) {
                None => "no signal this cycle",
                Some(d) if d.side == Side::Neutral => "no edge",
                Some(_) => "outranked",
            };
            debug!(%symbol, reason, "Scheduling close");
            actions.push(PlannedAction::Close {
                symbol,
                reason: reason.to_string(),
            });
        }

        let volatilities: Vec<Decimal> = selected.iter().map(|d| d.volatility).collect();
        let weights = Self::weights(&volatilities);

        for (decision, weight) in selected.iter().zip(weights) {
            let Some(side) = decision.side.order_side() else {
                continue;
            };
            let notional = (capital * weight * Decimal::from(decision.leverage))
                .max(self.config.min_notional);

            debug!(
                symbol = %decision.symbol,
                %side,
                edge = %decision.edge,
                %weight,
                leverage = decision.leverage,
                %notional,
                "Scheduling open"
            );

            actions.push(PlannedAction::Open(OpenAction {
                symbol: decision.symbol.clone(),
                side,
                leverage: decision.leverage,
                band: decision.band,
                notional,
                weight,
                atr: decision.atr,
                edge: decision.edge,
                tp_plan: decision.tp_plan.clone(),
            }));
        }

        ExecutionPlan {
            actions,
            deployable_capital: capital,
        }
    }
}
