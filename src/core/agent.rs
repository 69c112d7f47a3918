//! Advisory Agents
//!
//! Each agent is an independent source of a directional opinion:
//! - Heuristic agents read one or two slice features and never fail
//! - Advised agents ask the advisory collaborator first and fall back to
//!   their heuristic on any failure or unparseable reply
//!
//! Agents never raise to the coordinator. Whatever happens inside, `analyze`
//! resolves to a call with confidence in [0, 1].

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::advisory::{parse_advice, AdvisoryClient};
use super::memory::{RecallIndex, RecallNote};
use super::types::{AgentCall, Direction, MarketSlice};
use crate::config::AgentConfig;

/// Volatility level the macro heuristic treats as neutral
const MACRO_NEUTRAL_VOL: f64 = 0.01;

/// Anything that turns a market slice into a call
#[async_trait]
pub trait Analyst: Send + Sync {
    /// Unique agent name
    fn name(&self) -> &str;

    /// Analyze a slice. Must always resolve.
    async fn analyze(&self, slice: &MarketSlice) -> AgentCall;
}

/// Heuristic flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentKind {
    /// Moving-average spread (`ma10` vs `ma60`)
    Technical,
    /// Sign and size of the last `return`
    Sentiment,
    /// `return` direction, confidence from traded `volume`
    Fundamentals,
    /// Distance of realised `vol` from a calm market
    Macro,
    /// Order book `imbalance`
    OptionsFlow,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Technical => "technical",
            AgentKind::Sentiment => "sentiment",
            AgentKind::Fundamentals => "fundamentals",
            AgentKind::Macro => "macro",
            AgentKind::OptionsFlow => "options_flow",
        }
    }

    pub fn all() -> [AgentKind; 5] {
        [
            AgentKind::Technical,
            AgentKind::Sentiment,
            AgentKind::Fundamentals,
            AgentKind::Macro,
            AgentKind::OptionsFlow,
        ]
    }
}

impl FromStr for AgentKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "technical" => Ok(AgentKind::Technical),
            "sentiment" => Ok(AgentKind::Sentiment),
            "fundamentals" => Ok(AgentKind::Fundamentals),
            "macro" => Ok(AgentKind::Macro),
            "options_flow" | "optionsflow" => Ok(AgentKind::OptionsFlow),
            other => bail!("unknown agent kind '{}'", other),
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Deterministic agent over slice features
#[derive(Debug, Clone)]
pub struct HeuristicAgent {
    name: String,
    kind: AgentKind,
}

impl HeuristicAgent {
    pub fn new(name: impl Into<String>, kind: AgentKind) -> Self {
        Self { name: name.into(), kind }
    }

    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    /// The heuristic call for a slice
    pub fn evaluate(&self, slice: &MarketSlice) -> AgentCall {
        let (direction, confidence, evidence) = match self.kind {
            AgentKind::Technical => {
                let close = slice.feature_or_zero("close");
                let ma10 = slice.feature("ma10").unwrap_or(close);
                let ma60 = slice.feature("ma60").unwrap_or(close);
                let diff = ma10 - ma60;
                let confidence = if close != 0.0 {
                    (diff.abs() / close.abs()).min(1.0)
                } else {
                    0.5
                };
                (Direction::from_sign(diff), confidence, format!("ma_diff={:.4}", diff))
            }
            AgentKind::Sentiment => {
                let ret = slice.feature_or_zero("return");
                (
                    Direction::from_sign(ret),
                    (ret.abs() * 10.0).min(1.0),
                    format!("return={:.5}", ret),
                )
            }
            AgentKind::Fundamentals => {
                let volume = slice.feature_or_zero("volume");
                let ret = slice.feature_or_zero("return");
                (
                    Direction::from_sign(ret),
                    (volume / 1000.0).min(1.0),
                    format!("volume={}", volume),
                )
            }
            AgentKind::Macro => {
                let vol = slice.feature_or_zero("vol");
                let direction = if vol < MACRO_NEUTRAL_VOL {
                    Direction::Long
                } else {
                    Direction::Short
                };
                (
                    direction,
                    ((MACRO_NEUTRAL_VOL - vol).abs() * 100.0).min(1.0),
                    format!("vol={:.5}", vol),
                )
            }
            AgentKind::OptionsFlow => {
                let imbalance = slice.feature_or_zero("imbalance");
                (
                    Direction::from_sign(imbalance),
                    imbalance.abs().min(1.0),
                    format!("imbalance={:.4}", imbalance),
                )
            }
        };

        let call = AgentCall::new(
            slice.timestamp,
            slice.instrument.clone(),
            direction,
            confidence,
            0.0,
            vec![evidence],
        );
        AgentCall {
            expected_rr: 1.0 + call.confidence,
            ..call
        }
    }
}

#[async_trait]
impl Analyst for HeuristicAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn analyze(&self, slice: &MarketSlice) -> AgentCall {
        self.evaluate(slice)
    }
}

/// Agent backed by the advisory collaborator with a heuristic fallback
pub struct AdvisedAgent {
    fallback: HeuristicAgent,
    client: Arc<dyn AdvisoryClient>,
    /// Private evidence-keyed memory, recalled into later prompts
    memory: Mutex<RecallIndex>,
}

impl AdvisedAgent {
    pub fn new(
        fallback: HeuristicAgent,
        client: Arc<dyn AdvisoryClient>,
        memory_capacity: usize,
    ) -> Self {
        Self {
            fallback,
            client,
            memory: Mutex::new(RecallIndex::new(memory_capacity)),
        }
    }

    fn prompt(&self, slice: &MarketSlice, baseline: &AgentCall, recalled: &[RecallNote]) -> String {
        let features: Vec<String> = slice
            .features
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mut prompt = format!(
            "Instrument {} at {}.\nFeatures: {}\nHeuristic ({}): {} {:.2} [{}]",
            slice.instrument,
            slice.timestamp.to_rfc3339(),
            features.join(", "),
            self.fallback.kind(),
            baseline.direction,
            baseline.confidence,
            baseline.evidence.join("; "),
        );

        if !recalled.is_empty() {
            let notes: Vec<String> = recalled
                .iter()
                .map(|n| format!("{} {:.2}", n.direction, n.confidence))
                .collect();
            prompt.push_str(&format!(
                "\nYour earlier calls on this evidence: {}",
                notes.join(", ")
            ));
        }

        prompt
    }

    /// Number of evidence keys remembered so far
    pub async fn memory_len(&self) -> usize {
        self.memory.lock().await.len()
    }
}

#[async_trait]
impl Analyst for AdvisedAgent {
    fn name(&self) -> &str {
        self.fallback.name()
    }

    async fn analyze(&self, slice: &MarketSlice) -> AgentCall {
        let baseline = self.fallback.evaluate(slice);
        let key = baseline.evidence.join("; ");
        let recalled = self.memory.lock().await.recall(&key);
        let prompt = self.prompt(slice, &baseline, &recalled);

        let call = match self.client.complete(&prompt).await {
            Ok(text) => match parse_advice(&text) {
                Some(advice) => {
                    debug!(
                        agent = self.name(),
                        direction = %advice.direction,
                        confidence = advice.confidence,
                        "advisory call"
                    );
                    let mut evidence = vec![format!(
                        "advisory={} {:.2}",
                        advice.direction, advice.confidence
                    )];
                    evidence.extend(baseline.evidence.iter().cloned());
                    AgentCall::new(
                        slice.timestamp,
                        slice.instrument.clone(),
                        advice.direction,
                        advice.confidence,
                        1.0 + advice.confidence,
                        evidence,
                    )
                }
                None => {
                    warn!(agent = self.name(), "unparseable advisory reply, using heuristic");
                    baseline
                }
            },
            Err(e) => {
                warn!(agent = self.name(), error = %e, "advisory call failed, using heuristic");
                baseline
            }
        };

        self.memory.lock().await.remember(
            &key,
            RecallNote {
                direction: call.direction,
                confidence: call.confidence,
            },
        );

        call
    }
}

/// Build the configured agent set
///
/// Fails on an empty set, duplicate names, unknown kinds, or an advised
/// agent with no advisory client available.
pub fn build_agents(
    configs: &[AgentConfig],
    client: Option<Arc<dyn AdvisoryClient>>,
    memory_capacity: usize,
) -> Result<Vec<Arc<dyn Analyst>>> {
    if configs.is_empty() {
        bail!("no agents configured");
    }

    let mut seen = HashSet::new();
    let mut agents: Vec<Arc<dyn Analyst>> = Vec::with_capacity(configs.len());

    for cfg in configs {
        if !seen.insert(cfg.name.clone()) {
            bail!("duplicate agent name '{}'", cfg.name);
        }
        let heuristic = HeuristicAgent::new(cfg.name.clone(), cfg.kind.parse()?);

        if cfg.advisory {
            let Some(client) = client.clone() else {
                bail!("agent '{}' is advisory but no advisory client is configured", cfg.name);
            };
            agents.push(Arc::new(AdvisedAgent::new(heuristic, client, memory_capacity)));
        } else {
            agents.push(Arc::new(heuristic));
        }
    }

    Ok(agents)
}
