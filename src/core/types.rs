//! Core type definitions for the decision loop
//!
//! These types flow through every stage of a cycle: the market slice that
//! enters it, the calls agents make about it, and the consensus that leaves it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One observation of one instrument, produced by the feature pipeline
///
/// The core never writes to a slice. Features it does not find read as zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSlice {
    /// Observation time
    pub timestamp: DateTime<Utc>,
    /// Instrument symbol (e.g., "BTC-USDT")
    pub instrument: String,
    /// Named numeric features
    #[serde(default)]
    pub features: BTreeMap<String, f64>,
}

impl MarketSlice {
    /// Create an empty slice
    pub fn new(instrument: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            instrument: instrument.into(),
            features: BTreeMap::new(),
        }
    }

    /// Builder-style feature insertion
    pub fn with_feature(mut self, name: &str, value: f64) -> Self {
        self.features.insert(name.to_string(), value);
        self
    }

    /// Look up a feature
    pub fn feature(&self, name: &str) -> Option<f64> {
        self.features.get(name).copied().filter(|v| v.is_finite())
    }

    /// Look up a feature, reading missing values as zero
    pub fn feature_or_zero(&self, name: &str) -> f64 {
        self.feature(name).unwrap_or(0.0)
    }
}

/// Directional call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
    Flat,
}

impl Direction {
    /// All directions in vote-tally order
    pub fn all() -> [Direction; 3] {
        [Direction::Long, Direction::Short, Direction::Flat]
    }

    /// Direction from the sign of a value (zero and NaN are FLAT)
    pub fn from_sign(value: f64) -> Self {
        if value > 0.0 {
            Direction::Long
        } else if value < 0.0 {
            Direction::Short
        } else {
            Direction::Flat
        }
    }

    /// Parse a direction token leniently
    ///
    /// Accepts LONG/SHORT/FLAT and the common synonyms BUY/SELL/HOLD/NEUTRAL.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_uppercase().as_str() {
            "LONG" | "BUY" | "BULLISH" => Some(Direction::Long),
            "SHORT" | "SELL" | "BEARISH" => Some(Direction::Short),
            "FLAT" | "HOLD" | "NEUTRAL" => Some(Direction::Flat),
            _ => None,
        }
    }

    /// Sign applied to a quantity when this direction is filled
    pub fn sign(&self) -> i8 {
        match self {
            Direction::Long => 1,
            Direction::Short => -1,
            Direction::Flat => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
            Direction::Flat => "FLAT",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single agent's opinion about a slice
///
/// Immutable once produced; appended to the producing agent's ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCall {
    pub timestamp: DateTime<Utc>,
    pub instrument: String,
    pub direction: Direction,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Expected reward/risk ratio
    pub expected_rr: f64,
    /// Ordered evidence supporting the call
    pub evidence: Vec<String>,
}

impl AgentCall {
    /// Create a call, clamping confidence into [0, 1]
    pub fn new(
        timestamp: DateTime<Utc>,
        instrument: impl Into<String>,
        direction: Direction,
        confidence: f64,
        expected_rr: f64,
        evidence: Vec<String>,
    ) -> Self {
        Self {
            timestamp,
            instrument: instrument.into(),
            direction,
            confidence: clamp_unit(confidence),
            expected_rr,
            evidence,
        }
    }
}

/// Clamp a value into [0, 1]; NaN becomes 0
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Aggregated decision for one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub timestamp: DateTime<Utc>,
    pub instrument: String,
    pub direction: Direction,
    /// Sharpened confidence, always in (0, 1)
    pub edge: f64,
    pub expected_rr: f64,
    /// Every contributing call's evidence, in call order
    pub evidence: Vec<String>,
    /// Audit note left by the escalation step, if it ran
    #[serde(default)]
    pub debate: Option<String>,
}

/// One agent's part in a round, kept with the trade it led to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentVote {
    pub agent: String,
    pub direction: Direction,
    pub confidence: f64,
    /// Effective weight the round used
    pub weight: f64,
}
