//! Edge banding: turns a raw model edge into a discrete trade decision.

use crate::config::{BandSpec, BandingConfig};
use crate::exchange::OrderSide;
use rust_decimal::Decimal;
use std::fmt;
use tracing::debug;

/// Desired direction for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
    Neutral,
}

impl Side {
    pub fn order_side(&self) -> Option<OrderSide> {
        match self {
            Side::Buy => Some(OrderSide::Buy),
            Side::Sell => Some(OrderSide::Sell),
            Side::Neutral => None,
        }
    }
}

impl From<OrderSide> for Side {
    fn from(side: OrderSide) -> Self {
        match side {
            OrderSide::Buy => Side::Buy,
            OrderSide::Sell => Side::Sell,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
            Side::Neutral => write!(f, "NEUTRAL"),
        }
    }
}

/// One take-profit target: distance in ATR and share of the filled quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpRung {
    pub atr_multiple: Decimal,
    pub qty_fraction: Decimal,
}

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    Banded,
    /// Funding too expensive for the banded side.
    FundingVeto,
    /// Edge decayed below entry but still favors the held position.
    HysteresisHold,
    NoEdge,
}

/// Model output for one symbol, enriched with the current funding rate.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeSignal {
    pub symbol: String,
    pub edge: Decimal,
    pub volatility: Decimal,
    pub atr: Decimal,
    pub funding_rate: Decimal,
}

/// Discrete decision for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeDecision {
    pub symbol: String,
    pub side: Side,
    /// 0 when no band applies (neutral or hysteresis hold).
    pub band: u8,
    /// 0 unless `band > 0`.
    pub leverage: u8,
    pub tp_plan: Vec<TpRung>,
    pub edge: Decimal,
    pub volatility: Decimal,
    pub atr: Decimal,
    pub reason: DecisionReason,
}

/// Maps signals to decisions using the configured bands.
pub struct SignalAggregator {
    config: BandingConfig,
    max_funding_rate: Decimal,
    weak_threshold: Decimal,
}

impl SignalAggregator {
    pub fn new(config: BandingConfig) -> Self {
        let max_funding_rate = config.max_funding_rate();
        let weak_threshold = config.weak_threshold();
        Self {
            config,
            max_funding_rate,
            weak_threshold,
        }
    }

    /// Band number (1-based) and definition containing `abs_edge`.
    pub fn band_for(&self, abs_edge: Decimal) -> Option<(u8, &BandSpec)> {
        self.config
            .bands
            .iter()
            .enumerate()
            .find(|(_, band)| {
                abs_edge >= band.lower && band.upper.map_or(true, |upper| abs_edge < upper)
            })
            .map(|(idx, band)| ((idx + 1) as u8, band))
    }

    fn tp_plan(&self, band: &BandSpec) -> Vec<TpRung> {
        if band.tp_atr.len() == 1 {
            return vec![TpRung {
                atr_multiple: band.tp_atr[0],
                qty_fraction: Decimal::ONE,
            }];
        }

        band.tp_atr
            .iter()
            .zip(&self.config.ladder_fractions)
            .map(|(multiple, fraction)| TpRung {
                atr_multiple: *multiple,
                qty_fraction: *fraction,
            })
            .collect()
    }

    /// Decide for one symbol given the signed size currently held.
    pub fn decide(&self, signal: &EdgeSignal, current_position: Decimal) -> TradeDecision {
        let mut decision = TradeDecision {
            symbol: signal.symbol.clone(),
            side: Side::Neutral,
            band: 0,
            leverage: 0,
            tp_plan: Vec::new(),
            edge: signal.edge,
            volatility: signal.volatility,
            atr: signal.atr,
            reason: DecisionReason::NoEdge,
        };

        if let Some((band, band_def)) = self.band_for(signal.edge.abs()) {
            let side = if signal.edge > Decimal::ZERO {
                Side::Buy
            } else {
                Side::Sell
            };

            let vetoed = match side {
                Side::Buy => signal.funding_rate > self.max_funding_rate,
                Side::Sell => signal.funding_rate < -self.max_funding_rate,
                Side::Neutral => false,
            };

            if vetoed {
                decision.reason = DecisionReason::FundingVeto;
            } else {
                decision.side = side;
                decision.band = band;
                decision.leverage = band_def.leverage;
                decision.tp_plan = self.tp_plan(band_def);
                decision.reason = DecisionReason::Banded;
            }
        }

        if decision.side == Side::Neutral {
            let holds_long = current_position > Decimal::ZERO && signal.edge > self.weak_threshold;
            let holds_short =
                current_position < Decimal::ZERO && signal.edge < -self.weak_threshold;

            if holds_long || holds_short {
                decision.side = if holds_long { Side::Buy } else { Side::Sell };
                decision.reason = DecisionReason::HysteresisHold;
                debug!(
                    symbol = %signal.symbol,
                    edge = %signal.edge,
                    weak_threshold = %self.weak_threshold,
                    side = %decision.side,
                    "Hysteresis keeps existing position"
                );
            }
        }

        debug!(
            symbol = %decision.symbol,
            edge = %decision.edge,
            side = %decision.side,
            band = decision.band,
            leverage = decision.leverage,
            reason = ?decision.reason,
            "Trade decision"
        );

        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn aggregator() -> SignalAggregator {
        SignalAggregator::new(BandingConfig::default())
    }

    fn signal(edge: Decimal) -> EdgeSignal {
        EdgeSignal {
            symbol: "BTCUSDT".to_string(),
            edge,
            volatility: dec!(0.02),
            atr: dec!(2),
            funding_rate: Decimal::ZERO,
        }
    }

    // =========================================================================
    // Band partition
    // =========================================================================

    #[test]
    fn test_band_boundaries() {
        let agg = aggregator();
        let cases = [
            (dec!(0), 0),
            (dec!(0.2999), 0),
            (dec!(0.3), 1),
            (dec!(0.3999), 1),
            (dec!(0.4), 2),
            (dec!(0.45), 2),
            (dec!(0.6), 3),
            (dec!(0.9999), 3),
            (dec!(1.0), 4),
            (dec!(250), 4),
        ];

        for (edge, band) in cases {
            assert_eq!(agg.decide(&signal(edge), Decimal::ZERO).band, band, "edge {edge}");
            assert_eq!(agg.decide(&signal(-edge), Decimal::ZERO).band, band, "edge -{edge}");
        }
    }

    #[test]
    fn test_bands_cover_without_gaps() {
        let agg = aggregator();
        let mut edge = dec!(0.3);
        while edge < dec!(2) {
            assert!(agg.band_for(edge).is_some(), "gap at {edge}");
            edge += dec!(0.0125);
        }
    }

    #[test]
    fn test_side_follows_sign_only() {
        let agg = aggregator();
        assert_eq!(agg.decide(&signal(dec!(0.31)), Decimal::ZERO).side, Side::Buy);
        assert_eq!(agg.decide(&signal(dec!(5)), Decimal::ZERO).side, Side::Buy);
        assert_eq!(agg.decide(&signal(dec!(-0.31)), Decimal::ZERO).side, Side::Sell);
        assert_eq!(agg.decide(&signal(dec!(-5)), Decimal::ZERO).side, Side::Sell);

        let neutral = agg.decide(&signal(dec!(0.1)), Decimal::ZERO);
        assert_eq!(neutral.side, Side::Neutral);
        assert_eq!(neutral.reason, DecisionReason::NoEdge);
    }

    #[test]
    fn test_band_leverage_and_plans() {
        let agg = aggregator();

        let band2 = agg.decide(&signal(dec!(0.45)), Decimal::ZERO);
        assert_eq!(band2.leverage, 7);
        assert_eq!(
            band2.tp_plan,
            vec![TpRung {
                atr_multiple: dec!(0.5),
                qty_fraction: dec!(1)
            }]
        );

        let band4 = agg.decide(&signal(dec!(-1.3)), Decimal::ZERO);
        assert_eq!(band4.leverage, 12);
        let multiples: Vec<_> = band4.tp_plan.iter().map(|r| r.atr_multiple).collect();
        let fractions: Vec<_> = band4.tp_plan.iter().map(|r| r.qty_fraction).collect();
        assert_eq!(multiples, vec![dec!(0.8), dec!(1.5), dec!(3.0)]);
        assert_eq!(fractions, vec![dec!(0.30), dec!(0.30), dec!(0.20)]);
    }

    // =========================================================================
    // Funding veto
    // =========================================================================

    #[test]
    fn test_funding_veto_long() {
        let agg = aggregator();
        let mut s = signal(dec!(0.7));
        s.funding_rate = dec!(0.0005);

        let decision = agg.decide(&s, Decimal::ZERO);
        assert_eq!(decision.side, Side::Neutral);
        assert_eq!(decision.band, 0);
        assert_eq!(decision.reason, DecisionReason::FundingVeto);

        // At the cap is still allowed
        s.funding_rate = dec!(0.0004);
        assert_eq!(agg.decide(&s, Decimal::ZERO).side, Side::Buy);
    }

    #[test]
    fn test_funding_veto_short_is_symmetric() {
        let agg = aggregator();
        let mut s = signal(dec!(-0.7));
        s.funding_rate = dec!(-0.0005);
        assert_eq!(agg.decide(&s, Decimal::ZERO).side, Side::Neutral);

        // Positive funding pays shorts; never vetoed
        s.funding_rate = dec!(0.01);
        assert_eq!(agg.decide(&s, Decimal::ZERO).side, Side::Sell);
    }

    // =========================================================================
    // Hysteresis
    // =========================================================================

    #[test]
    fn test_hysteresis_holds_long_on_weak_edge() {
        let agg = aggregator();
        let decision = agg.decide(&signal(dec!(0.2)), dec!(0.5));

        assert_eq!(decision.side, Side::Buy);
        assert_eq!(decision.reason, DecisionReason::HysteresisHold);
        assert_eq!(decision.band, 0);
        assert_eq!(decision.leverage, 0);
    }

    #[test]
    fn test_hysteresis_never_flips_or_opens() {
        let agg = aggregator();

        // Long held, edge negative but weak: no hold, no flip
        let decision = agg.decide(&signal(dec!(-0.2)), dec!(0.5));
        assert_eq!(decision.side, Side::Neutral);

        // Below the weak threshold (0.15): close
        assert_eq!(agg.decide(&signal(dec!(0.14)), dec!(0.5)).side, Side::Neutral);

        // Flat: weak edge never opens
        assert_eq!(agg.decide(&signal(dec!(0.2)), Decimal::ZERO).side, Side::Neutral);
    }

    #[test]
    fn test_hysteresis_holds_short() {
        let agg = aggregator();
        assert_eq!(agg.decide(&signal(dec!(-0.2)), dec!(-1)).side, Side::Sell);
        assert_eq!(agg.decide(&signal(dec!(0.2)), dec!(-1)).side, Side::Neutral);
    }

    #[test]
    fn test_hysteresis_overrides_funding_veto_for_held_position() {
        let agg = aggregator();
        let mut s = signal(dec!(0.5));
        s.funding_rate = dec!(0.001);

        let decision = agg.decide(&s, dec!(2));
        assert_eq!(decision.side, Side::Buy);
        assert_eq!(decision.reason, DecisionReason::HysteresisHold);
        assert_eq!(decision.leverage, 0);
    }
}
