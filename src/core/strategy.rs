//! Strategy Dispatch
//!
//! One shared signal type and a fixed table from regime to a pure shaping
//! function. The engine overwrites the side with the consensus direction and
//! scales the quantity by edge squared, so these functions only supply the
//! base size and the risk distances.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;

use super::regime::Regime;
use super::types::{Direction, MarketSlice};

/// Base quantity every strategy starts from
pub const BASE_QUANTITY: Decimal = dec!(1);

/// Signal lifetime in seconds
pub const VALID_FOR_SECS: u64 = 60;

/// Order shape produced by a strategy
#[derive(Debug, Clone, PartialEq)]
pub struct StrategySignal {
    pub instrument: String,
    pub strategy_id: &'static str,
    pub side: Direction,
    pub quantity: Decimal,
    /// Fractions of price, 0.01 = 1%
    pub stop_loss_pct: Decimal,
    pub take_profit_pct: Decimal,
    pub valid_for_secs: u64,
}

impl StrategySignal {
    /// Apply the consensus side and convex size scaling
    ///
    /// quantity = base × edge², rounded to `dp` places. Zero after rounding
    /// means the order is too small to send.
    pub fn sized(mut self, side: Direction, edge: f64, dp: u32) -> Self {
        let scale = Decimal::from_f64_retain(edge * edge).unwrap_or(Decimal::ZERO);
        self.side = side;
        self.quantity = (self.quantity * scale).round_dp(dp);
        self
    }
}

/// Pure shaping function; the signal carries its own strategy id
pub type Strategy = fn(&MarketSlice) -> StrategySignal;

fn signal(
    slice: &MarketSlice,
    strategy_id: &'static str,
    long: bool,
    stop_loss_pct: Decimal,
    take_profit_pct: Decimal,
) -> StrategySignal {
    StrategySignal {
        instrument: slice.instrument.clone(),
        strategy_id,
        side: if long { Direction::Long } else { Direction::Short },
        quantity: BASE_QUANTITY,
        stop_loss_pct,
        take_profit_pct,
        valid_for_secs: VALID_FOR_SECS,
    }
}

/// Breakout with the trend in fast markets
pub fn momentum_breakout(slice: &MarketSlice) -> StrategySignal {
    let long = slice.feature_or_zero("trend_strength") > 0.0;
    signal(slice, "MOM-ATR-Break", long, dec!(0.010), dec!(0.020))
}

/// Buy dips in a calm trend
pub fn pullback_ema(slice: &MarketSlice) -> StrategySignal {
    let long = slice.feature_or_zero("trend_strength") > 0.0;
    signal(slice, "Pullback-EMA", long, dec!(0.008), dec!(0.015))
}

/// Fade stretched moves back to VWAP
pub fn vwap_mean_reversion(slice: &MarketSlice) -> StrategySignal {
    let long = slice.feature_or_zero("order_flow_bias") > 0.0;
    signal(slice, "VWAP-MeanRev", long, dec!(0.012), dec!(0.025))
}

/// Range grid: lean against the last move
pub fn grid_range(slice: &MarketSlice) -> StrategySignal {
    let long = slice.feature_or_zero("last_move") < 0.0;
    signal(slice, "Grid-Range", long, dec!(0.010), dec!(0.015))
}

/// Regime -> strategy mapping
#[derive(Clone)]
pub struct StrategyTable {
    entries: HashMap<Regime, Strategy>,
}

impl Default for StrategyTable {
    fn default() -> Self {
        Self::standard()
    }
}

impl StrategyTable {
    pub fn standard() -> Self {
        let entries = [
            (Regime::TrendingHighVol, momentum_breakout as Strategy),
            (Regime::TrendingLowVol, pullback_ema as Strategy),
            (Regime::ChoppyHighVol, vwap_mean_reversion as Strategy),
            (Regime::ChoppyLowVol, grid_range as Strategy),
        ];
        Self { entries: entries.into_iter().collect() }
    }

    /// Table with some regimes left unmapped
    pub fn without(mut self, disabled: &[Regime]) -> Self {
        for regime in disabled {
            self.entries.remove(regime);
        }
        self
    }

    pub fn get(&self, regime: Regime) -> Option<Strategy> {
        self.entries.get(&regime).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// None for an unmapped regime
    pub fn dispatch(&self, regime: Regime, slice: &MarketSlice) -> Option<StrategySignal> {
        self.get(regime).map(|build| build(slice))
    }
}
