//! Consensus Aggregator
//!
//! Combines one round of agent calls into a single decision:
//! 1. Weighted mean confidence, sharpened by a logistic centred at 0.5
//! 2. Direction by weighted vote; a contested vote (runner-up within
//!    `near_tie_ratio` of the leader) never goes to the plurality winner but
//!    to a pluggable escalation step, which stands down to FLAT by default
//! 3. Weighted mean reward/risk and the full evidence trail
//!
//! Aggregating zero calls is a caller bug and is rejected.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::advisory::{parse_advice, AdvisoryClient};
use super::types::{AgentCall, ConsensusResult, Direction};

/// Logistic steepness
pub const SHARPEN_STEEPNESS: f64 = 10.0;

/// Default contested-vote ratio
pub const DEFAULT_NEAR_TIE_RATIO: f64 = 0.4;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConsensusError {
    #[error("consensus requested over zero agent calls")]
    NoCalls,
    #[error("{calls} agent calls but {weights} weights")]
    WeightMismatch { calls: usize, weights: usize },
    #[error("weights must be finite, non-negative and sum to a positive total")]
    InvalidWeights,
    #[error("agent '{0}' did not complete; no decision from a partial round")]
    AgentAborted(String),
}

/// Logistic sharpening of a raw weighted confidence
///
/// `1 / (1 + e^(-10 (raw - 0.5)))`: stays near 0.5 for near-even averages,
/// strictly inside (0, 1), monotonically increasing.
pub fn sharpen(raw: f64) -> f64 {
    1.0 / (1.0 + (-SHARPEN_STEEPNESS * (raw - 0.5)).exp())
}

/// Weighted mass per direction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoteTally {
    pub long: f64,
    pub short: f64,
    pub flat: f64,
}

impl VoteTally {
    pub fn from_calls(calls: &[AgentCall], weights: &[f64]) -> Self {
        let mut tally = Self { long: 0.0, short: 0.0, flat: 0.0 };
        for (call, w) in calls.iter().zip(weights) {
            match call.direction {
                Direction::Long => tally.long += w,
                Direction::Short => tally.short += w,
                Direction::Flat => tally.flat += w,
            }
        }
        tally
    }

    pub fn mass(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Long => self.long,
            Direction::Short => self.short,
            Direction::Flat => self.flat,
        }
    }

    pub fn total(&self) -> f64 {
        self.long + self.short + self.flat
    }

    /// Directions ordered by mass, heaviest first
    pub fn ranked(&self) -> [(Direction, f64); 3] {
        let mut ranked = Direction::all().map(|d| (d, self.mass(d)));
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked
    }

    /// Leader and runner-up
    pub fn leader(&self) -> (Direction, f64) {
        self.ranked()[0]
    }

    /// Runner-up within `ratio` of the leader's mass
    pub fn is_contested(&self, ratio: f64) -> bool {
        let ranked = self.ranked();
        let (leader, runner_up) = (ranked[0].1, ranked[1].1);
        leader - runner_up <= ratio * leader
    }
}

/// Outcome of the escalation step
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub direction: Direction,
    pub rationale: String,
}

/// Escalation step invoked only on a contested vote
///
/// Must be free of side effects beyond its returned rationale.
#[async_trait]
pub trait DebateResolver: Send + Sync {
    fn name(&self) -> &str;

    async fn resolve(&self, calls: &[AgentCall], weights: &[f64], tally: &VoteTally) -> Resolution;
}

/// Always stands down to FLAT
#[derive(Debug, Clone, Default)]
pub struct StandDown;

#[async_trait]
impl DebateResolver for StandDown {
    fn name(&self) -> &str {
        "stand_down"
    }

    async fn resolve(
        &self,
        _calls: &[AgentCall],
        _weights: &[f64],
        tally: &VoteTally,
    ) -> Resolution {
        Resolution {
            direction: Direction::Flat,
            rationale: format!(
                "contested vote (long={:.3} short={:.3} flat={:.3})",
                tally.long, tally.short, tally.flat
            ),
        }
    }
}

/// Re-derives the decision from confidence-weighted long vs short mass
///
/// FLAT unless the delta exceeds `margin` of the confidence-weighted total.
#[derive(Debug, Clone)]
pub struct WeightDelta {
    pub margin: f64,
}

impl WeightDelta {
    pub fn new(margin: f64) -> Self {
        Self { margin }
    }

    fn decide(&self, calls: &[AgentCall], weights: &[f64]) -> (Direction, f64, f64) {
        let mut long = 0.0;
        let mut short = 0.0;
        let mut total = 0.0;
        for (call, w) in calls.iter().zip(weights) {
            let mass = w * call.confidence;
            total += mass;
            match call.direction {
                Direction::Long => long += mass,
                Direction::Short => short += mass,
                Direction::Flat => {}
            }
        }

        let delta = long - short;
        let direction = if total > 0.0 && delta.abs() > self.margin * total {
            Direction::from_sign(delta)
        } else {
            Direction::Flat
        };
        (direction, delta, total)
    }
}

#[async_trait]
impl DebateResolver for WeightDelta {
    fn name(&self) -> &str {
        "weight_delta"
    }

    async fn resolve(
        &self,
        calls: &[AgentCall],
        weights: &[f64],
        _tally: &VoteTally,
    ) -> Resolution {
        let (direction, delta, total) = self.decide(calls, weights);
        Resolution {
            direction,
            rationale: format!("confidence-weighted delta {:.4} of {:.4}", delta, total),
        }
    }
}

/// Asks the advisory collaborator to settle the vote; FLAT on any failure
pub struct AdvisoryDebate {
    client: Arc<dyn AdvisoryClient>,
}

impl AdvisoryDebate {
    pub fn new(client: Arc<dyn AdvisoryClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DebateResolver for AdvisoryDebate {
    fn name(&self) -> &str {
        "advisory"
    }

    async fn resolve(
        &self,
        calls: &[AgentCall],
        weights: &[f64],
        _tally: &VoteTally,
    ) -> Resolution {
        let positions: Vec<String> = calls
            .iter()
            .zip(weights)
            .map(|(c, w)| {
                format!(
                    "- {} {:.2} (weight {:.2}): {}",
                    c.direction,
                    c.confidence,
                    w,
                    c.evidence.join("; ")
                )
            })
            .collect();
        let prompt = format!(
            "Analysts disagree on {}. Positions:\n{}\nGive the final direction and confidence.",
            calls.first().map(|c| c.instrument.as_str()).unwrap_or("?"),
            positions.join("\n"),
        );

        match self.client.complete(&prompt).await {
            Ok(text) => match parse_advice(&text) {
                Some(advice) => Resolution {
                    direction: advice.direction,
                    rationale: format!(
                        "advisory verdict {} {:.2}",
                        advice.direction, advice.confidence
                    ),
                },
                None => Resolution {
                    direction: Direction::Flat,
                    rationale: "advisory verdict unparseable".to_string(),
                },
            },
            Err(e) => Resolution {
                direction: Direction::Flat,
                rationale: format!("advisory verdict unavailable: {}", e),
            },
        }
    }
}

/// Everything but the final direction
struct Draft {
    tally: VoteTally,
    edge: f64,
    expected_rr: f64,
    instrument: String,
    timestamp: DateTime<Utc>,
    evidence: Vec<String>,
}

impl Draft {
    fn prepare(calls: &[AgentCall], weights: &[f64]) -> Result<Self, ConsensusError> {
        if calls.is_empty() {
            return Err(ConsensusError::NoCalls);
        }
        if calls.len() != weights.len() {
            return Err(ConsensusError::WeightMismatch {
                calls: calls.len(),
                weights: weights.len(),
            });
        }
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(ConsensusError::InvalidWeights);
        }
        let total: f64 = weights.iter().sum();
        if !total.is_finite() || total <= 0.0 {
            return Err(ConsensusError::InvalidWeights);
        }

        let raw = calls
            .iter()
            .zip(weights)
            .map(|(c, w)| c.confidence * w)
            .sum::<f64>()
            / total;
        let expected_rr = calls
            .iter()
            .zip(weights)
            .map(|(c, w)| c.expected_rr * w)
            .sum::<f64>()
            / total;

        // Majority instrument, ties to the lexicographically smallest
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for call in calls {
            *counts.entry(call.instrument.as_str()).or_insert(0) += 1;
        }
        let mut instrument = "";
        let mut best = 0;
        for (name, count) in counts {
            if count > best {
                best = count;
                instrument = name;
            }
        }
        let timestamp = calls
            .iter()
            .filter(|c| c.instrument == instrument)
            .map(|c| c.timestamp)
            .max()
            .unwrap_or(calls[0].timestamp);

        Ok(Self {
            tally: VoteTally::from_calls(calls, weights),
            edge: sharpen(raw.clamp(0.0, 1.0)),
            expected_rr,
            instrument: instrument.to_string(),
            timestamp,
            evidence: calls.iter().flat_map(|c| c.evidence.iter().cloned()).collect(),
        })
    }

    fn finish(self, direction: Direction, debate: Option<String>) -> ConsensusResult {
        ConsensusResult {
            timestamp: self.timestamp,
            instrument: self.instrument,
            direction,
            edge: self.edge,
            expected_rr: self.expected_rr,
            evidence: self.evidence,
            debate,
        }
    }
}

/// Weighted consensus with the default contested-vote rule (FLAT)
pub fn weighted_consensus(
    calls: &[AgentCall],
    weights: &[f64],
) -> Result<ConsensusResult, ConsensusError> {
    let draft = Draft::prepare(calls, weights)?;
    let direction = if draft.tally.is_contested(DEFAULT_NEAR_TIE_RATIO) {
        Direction::Flat
    } else {
        draft.tally.leader().0
    };
    Ok(draft.finish(direction, None))
}

/// Aggregator with a configurable contested-vote ratio and escalation step
pub struct ConsensusAggregator {
    near_tie_ratio: f64,
    resolver: Arc<dyn DebateResolver>,
}

impl Default for ConsensusAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_NEAR_TIE_RATIO, Arc::new(StandDown))
    }
}

impl ConsensusAggregator {
    pub fn new(near_tie_ratio: f64, resolver: Arc<dyn DebateResolver>) -> Self {
        Self { near_tie_ratio, resolver }
    }

    pub async fn aggregate(
        &self,
        calls: &[AgentCall],
        weights: &[f64],
    ) -> Result<ConsensusResult, ConsensusError> {
        let draft = Draft::prepare(calls, weights)?;

        if !draft.tally.is_contested(self.near_tie_ratio) {
            let (direction, mass) = draft.tally.leader();
            debug!(%direction, mass, edge = draft.edge, "uncontested consensus");
            return Ok(draft.finish(direction, None));
        }

        let resolution = self.resolver.resolve(calls, weights, &draft.tally).await;
        debug!(
            resolver = self.resolver.name(),
            direction = %resolution.direction,
            rationale = %resolution.rationale,
            "contested vote escalated"
        );
        let note = format!("{}: {}", self.resolver.name(), resolution.rationale);
        Ok(draft.finish(resolution.direction, Some(note)))
    }
}
