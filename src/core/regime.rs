//! Market Regime Classification
//!
//! Maps two slice features onto a fixed 2x2 grid:
//! - trend axis: `trend_strength` above threshold => Trending, else Choppy
//! - volatility axis: `volatility_state` above threshold => HighVol, else LowVol
//!
//! Without hysteresis every slice is classified on its own. With a positive
//! hysteresis band, each axis keeps its previous state per instrument until
//! the feature leaves the band around the threshold. That per-instrument
//! memory is part of the persisted state so a restart classifies the same.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::types::MarketSlice;

/// Feature read for the trend axis
pub const TREND_FEATURE: &str = "trend_strength";
/// Feature read for the volatility axis
pub const VOLATILITY_FEATURE: &str = "volatility_state";

/// Market regime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regime {
    TrendingHighVol,
    TrendingLowVol,
    ChoppyHighVol,
    ChoppyLowVol,
}

impl Regime {
    pub fn from_axes(trending: bool, high_vol: bool) -> Self {
        match (trending, high_vol) {
            (true, true) => Regime::TrendingHighVol,
            (true, false) => Regime::TrendingLowVol,
            (false, true) => Regime::ChoppyHighVol,
            (false, false) => Regime::ChoppyLowVol,
        }
    }

    pub fn is_trending(&self) -> bool {
        matches!(self, Regime::TrendingHighVol | Regime::TrendingLowVol)
    }

    pub fn is_high_vol(&self) -> bool {
        matches!(self, Regime::TrendingHighVol | Regime::ChoppyHighVol)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Regime::TrendingHighVol => "Trending-HighVol",
            Regime::TrendingLowVol => "Trending-LowVol",
            Regime::ChoppyHighVol => "Choppy-HighVol",
            Regime::ChoppyLowVol => "Choppy-LowVol",
        }
    }

    pub fn all() -> [Regime; 4] {
        [
            Regime::TrendingHighVol,
            Regime::TrendingLowVol,
            Regime::ChoppyHighVol,
            Regime::ChoppyLowVol,
        ]
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Regime {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match Regime::all().into_iter().find(|r| r.name().eq_ignore_ascii_case(s.trim())) {
            Some(regime) => Ok(regime),
            None => bail!("unknown regime '{}'", s),
        }
    }
}

/// Threshold classifier with optional anti-flicker band
#[derive(Debug, Clone)]
pub struct RegimeClassifier {
    trend_threshold: f64,
    volatility_threshold: f64,
    hysteresis: f64,
    /// Last regime per instrument; only consulted when hysteresis > 0
    last: BTreeMap<String, Regime>,
}

impl Default for RegimeClassifier {
    fn default() -> Self {
        Self::new(0.6, 0.6, 0.0)
    }
}

impl RegimeClassifier {
    pub fn new(trend_threshold: f64, volatility_threshold: f64, hysteresis: f64) -> Self {
        Self {
            trend_threshold,
            volatility_threshold,
            hysteresis: hysteresis.max(0.0),
            last: BTreeMap::new(),
        }
    }

    /// Per-instrument memory behind the hysteresis band
    pub fn memory(&self) -> &BTreeMap<String, Regime> {
        &self.last
    }

    pub fn restore(&mut self, memory: BTreeMap<String, Regime>) {
        self.last = memory;
    }

    /// Memoryless classification
    pub fn classify(&self, slice: &MarketSlice) -> Regime {
        Regime::from_axes(
            slice.feature_or_zero(TREND_FEATURE) > self.trend_threshold,
            slice.feature_or_zero(VOLATILITY_FEATURE) > self.volatility_threshold,
        )
    }

    /// Classification honouring the hysteresis band
    ///
    /// Identical to `classify` when the band is zero.
    pub fn observe(&mut self, slice: &MarketSlice) -> Regime {
        if self.hysteresis <= 0.0 {
            return self.classify(slice);
        }

        let trend = slice.feature_or_zero(TREND_FEATURE);
        let vol = slice.feature_or_zero(VOLATILITY_FEATURE);
        let band = self.hysteresis;

        let regime = match self.last.get(&slice.instrument) {
            None => self.classify(slice),
            Some(prev) => {
                let trending = sticky(prev.is_trending(), trend, self.trend_threshold, band);
                let high_vol = sticky(prev.is_high_vol(), vol, self.volatility_threshold, band);
                Regime::from_axes(trending, high_vol)
            }
        };

        self.last.insert(slice.instrument.clone(), regime);
        regime
    }
}

/// Axis state that only flips once the value clears the band
fn sticky(was_on: bool, value: f64, threshold: f64, band: f64) -> bool {
    if was_on {
        value > threshold - band
    } else {
        value > threshold + band
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn slice(trend: f64, vol: f64) -> MarketSlice {
        MarketSlice::new("BTC", Utc::now())
            .with_feature(TREND_FEATURE, trend)
            .with_feature(VOLATILITY_FEATURE, vol)
    }

    #[test]
    fn test_classify_grid() {
        let c = RegimeClassifier::default();
        assert_eq!(c.classify(&slice(0.9, 0.9)).name(), "Trending-HighVol");
        assert_eq!(c.classify(&slice(0.9, 0.1)), Regime::TrendingLowVol);
        assert_eq!(c.classify(&slice(0.1, 0.9)), Regime::ChoppyHighVol);
        assert_eq!(c.classify(&slice(0.6, 0.6)), Regime::ChoppyLowVol);
    }

    #[test]
    fn test_missing_features_are_choppy_lowvol() {
        let c = RegimeClassifier::default();
        assert_eq!(c.classify(&MarketSlice::new("BTC", Utc::now())), Regime::ChoppyLowVol);
    }

    #[test]
    fn test_no_hysteresis_flickers() {
        let mut c = RegimeClassifier::default();
        assert_eq!(c.observe(&slice(0.61, 0.0)), Regime::TrendingLowVol);
        assert_eq!(c.observe(&slice(0.59, 0.0)), Regime::ChoppyLowVol);
        assert_eq!(c.observe(&slice(0.61, 0.0)), Regime::TrendingLowVol);
    }

    #[test]
    fn test_hysteresis_holds_state() {
        let mut c = RegimeClassifier::new(0.6, 0.6, 0.05);
        assert_eq!(c.observe(&slice(0.7, 0.0)), Regime::TrendingLowVol);
        // Inside the band: stays trending
        assert_eq!(c.observe(&slice(0.57, 0.0)), Regime::TrendingLowVol);
        // Leaves the band: flips
        assert_eq!(c.observe(&slice(0.5, 0.0)), Regime::ChoppyLowVol);
        // Needs to clear threshold + band to flip back
        assert_eq!(c.observe(&slice(0.63, 0.0)), Regime::ChoppyLowVol);
        assert_eq!(c.observe(&slice(0.66, 0.0)), Regime::TrendingLowVol);
    }

    #[test]
    fn test_restored_memory_keeps_band() {
        let mut before = RegimeClassifier::new(0.6, 0.6, 0.05);
        before.observe(&slice(0.7, 0.9));

        let mut after = RegimeClassifier::new(0.6, 0.6, 0.05);
        after.restore(before.memory().clone());
        let mut fresh = RegimeClassifier::new(0.6, 0.6, 0.05);

        assert_eq!(before.observe(&slice(0.57, 0.9)), Regime::TrendingHighVol);
        assert_eq!(after.observe(&slice(0.57, 0.9)), Regime::TrendingHighVol);
        assert_eq!(fresh.observe(&slice(0.57, 0.9)), Regime::ChoppyHighVol);
    }

    #[test]
    fn test_regime_from_str() {
        assert_eq!("choppy-highvol".parse::<Regime>().unwrap(), Regime::ChoppyHighVol);
        assert!("sideways".parse::<Regime>().is_err());
    }
}
