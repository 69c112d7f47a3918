//! Configuration loader
//!
//! One TOML document, loaded once and validated before anything is built.
//! Secrets never live here: the file only names the environment variables
//! that hold them.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::core::agent::AgentKind;
use crate::core::guardian::RiskConfig;
use crate::core::regime::Regime;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub regime: RegimeConfig,
    #[serde(default)]
    pub strategies: StrategiesConfig,
    #[serde(default)]
    pub advisory: AdvisoryConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Required: the process refuses to start without an agent set
    pub agents: Vec<AgentConfig>,
}

/// Run mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Backtest,
    Paper,
    Live,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Backtest => "backtest",
            Mode::Paper => "paper",
            Mode::Live => "live",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub name: String,
    pub log_level: String,
    pub mode: Mode,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            name: "agora".to_string(),
            log_level: "info".to_string(),
            mode: Mode::Paper,
        }
    }
}

/// Escalation policy for contested votes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebatePolicy {
    StandDown,
    WeightDelta,
    Advisory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Cycles with a lower edge are skipped
    pub min_edge: f64,
    pub near_tie_ratio: f64,
    /// Window for the per-round effective weight
    pub weight_window: usize,
    /// Window for the daily weight re-optimization
    pub reoptimize_window: usize,
    pub history_limit: usize,
    pub debate: DebatePolicy,
    /// Fraction of total mass the weight-delta debate needs to pick a side
    pub debate_margin: f64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            min_edge: 0.55,
            near_tie_ratio: 0.4,
            weight_window: 20,
            reoptimize_window: 100,
            history_limit: 1000,
            debate: DebatePolicy::StandDown,
            debate_margin: 0.1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    pub trend_threshold: f64,
    pub volatility_threshold: f64,
    pub hysteresis: f64,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            trend_threshold: 0.6,
            volatility_threshold: 0.6,
            hysteresis: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StrategiesConfig {
    /// Regime names left without a strategy
    pub disabled: Vec<String>,
}

impl StrategiesConfig {
    pub fn disabled_regimes(&self) -> Result<Vec<Regime>> {
        self.disabled.iter().map(|name| name.parse()).collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdvisoryConfig {
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding a comma-separated key list
    pub api_keys_env: String,
    pub timeout_secs: u64,
    pub max_tokens: u32,
    pub temperature: f64,
    pub memory_capacity: usize,
}

impl Default for AdvisoryConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            model: "gpt-4o-mini".to_string(),
            api_keys_env: "AGORA_ADVISORY_KEYS".to_string(),
            timeout_secs: 30,
            max_tokens: 64,
            temperature: 0.0,
            memory_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    /// technical | sentiment | fundamentals | macro | options_flow
    pub kind: String,
    #[serde(default)]
    pub advisory: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    Json,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub backend: StateBackend,
    pub path: String,
    pub trade_log_limit: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackend::Json,
            path: "agora_state.json".to_string(),
            trade_log_limit: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    Simulated,
    Rest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    /// Limit at the slice's `close` feature
    Limit,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub gateway: GatewayKind,
    pub endpoint: String,
    pub api_key_env: String,
    /// Decimal places kept on order quantities
    pub quantity_dp: u32,
    pub order_type: OrderType,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayKind::Simulated,
            endpoint: String::new(),
            api_key_env: "AGORA_EXECUTION_KEY".to_string(),
            quantity_dp: 6,
            order_type: OrderType::Market,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.agents.is_empty() {
            bail!("at least one agent must be configured");
        }
        let mut names = HashSet::new();
        for agent in &self.agents {
            if agent.name.trim().is_empty() {
                bail!("agent names must not be empty");
            }
            if !names.insert(agent.name.as_str()) {
                bail!("duplicate agent name '{}'", agent.name);
            }
            agent
                .kind
                .parse::<AgentKind>()
                .with_context(|| format!("agent '{}'", agent.name))?;
        }

        let c = &self.consensus;
        if !(0.0..=1.0).contains(&c.min_edge) {
            bail!("consensus.min_edge must be within [0, 1]");
        }
        if !(0.0..1.0).contains(&c.near_tie_ratio) {
            bail!("consensus.near_tie_ratio must be within [0, 1)");
        }
        if c.weight_window == 0 || c.reoptimize_window == 0 || c.history_limit == 0 {
            bail!("consensus windows and history_limit must be positive");
        }
        if !(0.0..=1.0).contains(&c.debate_margin) {
            bail!("consensus.debate_margin must be within [0, 1]");
        }

        let r = &self.regime;
        if !r.trend_threshold.is_finite() || !r.volatility_threshold.is_finite() {
            bail!("regime thresholds must be finite");
        }
        if r.hysteresis.is_nan() || r.hysteresis < 0.0 {
            bail!("regime.hysteresis must be non-negative");
        }
        self.strategies.disabled_regimes().context("strategies.disabled")?;

        let risk = &self.risk;
        if risk.equity <= rust_decimal::Decimal::ZERO {
            bail!("risk.equity must be positive");
        }
        // A zero stop rejects every order from a fresh day
        if risk.daily_stop >= rust_decimal::Decimal::ZERO {
            bail!("risk.daily_stop must be negative");
        }
        if risk.intraday_stop >= rust_decimal::Decimal::ZERO {
            bail!("risk.intraday_stop must be negative");
        }
        if !(1..=24).contains(&risk.intraday_session_hours) {
            bail!("risk.intraday_session_hours must be within 1..=24");
        }

        let advisory_needed =
            self.agents.iter().any(|a| a.advisory) || c.debate == DebatePolicy::Advisory;
        if advisory_needed && self.advisory.endpoint.is_empty() {
            bail!("advisory.endpoint is required when an advisory agent or debate is configured");
        }

        if self.execution.gateway == GatewayKind::Rest && self.execution.endpoint.is_empty() {
            bail!("execution.endpoint is required for the rest gateway");
        }
        if self.execution.quantity_dp > 28 {
            bail!("execution.quantity_dp must be <= 28");
        }
        if self.state.trade_log_limit == 0 {
            bail!("state.trade_log_limit must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const MINIMAL: &str = r#"
        [[agents]]
        name = "Technical"
        kind = "technical"
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg = Config::parse(MINIMAL).unwrap();
        assert_eq!(cfg.system.mode, Mode::Paper);
        assert_eq!(cfg.consensus.min_edge, 0.55);
        assert_eq!(cfg.consensus.debate, DebatePolicy::StandDown);
        assert_eq!(cfg.risk.daily_stop, dec!(-0.02));
        assert_eq!(cfg.state.backend, StateBackend::Json);
        assert_eq!(cfg.execution.quantity_dp, 6);
        assert!(!cfg.agents[0].advisory);
    }

    #[test]
    fn test_full_config() {
        let text = r#"
            [system]
            name = "desk"
            log_level = "debug"
            mode = "backtest"

            [risk]
            equity = 2.0
            max_gross_exposure = 1.2

            [consensus]
            debate = "weight_delta"
            debate_margin = 0.2

            [regime]
            hysteresis = 0.05

            [strategies]
            disabled = ["Choppy-LowVol"]

            [advisory]
            endpoint = "http://localhost:8080/v1/chat/completions"

            [state]
            backend = "sqlite"
            path = "state.db"

            [[agents]]
            name = "Technical"
            kind = "technical"
            advisory = true

            [[agents]]
            name = "Flow"
            kind = "options_flow"
        "#;
        let cfg = Config::parse(text).unwrap();
        assert_eq!(cfg.system.mode, Mode::Backtest);
        assert_eq!(cfg.risk.equity, dec!(2.0));
        assert_eq!(cfg.risk.solvency_buffer, dec!(0.1));
        assert_eq!(cfg.consensus.debate, DebatePolicy::WeightDelta);
        assert_eq!(cfg.strategies.disabled_regimes().unwrap(), vec![Regime::ChoppyLowVol]);
        assert_eq!(cfg.state.backend, StateBackend::Sqlite);
        assert_eq!(cfg.agents.len(), 2);
    }

    #[test]
    fn test_missing_agents_rejected() {
        assert!(Config::parse("[system]\nname = \"x\"\n").is_err());
        assert!(Config::parse("agents = []\n").is_err());
    }

    #[test]
    fn test_invalid_agents_rejected() {
        let dup = r#"
            [[agents]]
            name = "A"
            kind = "macro"
            [[agents]]
            name = "A"
            kind = "sentiment"
        "#;
        assert!(Config::parse(dup).is_err());

        let unknown = r#"
            [[agents]]
            name = "A"
            kind = "astrology"
        "#;
        assert!(Config::parse(unknown).is_err());
    }

    #[test]
    fn test_advisory_requires_endpoint() {
        let text = r#"
            [[agents]]
            name = "A"
            kind = "macro"
            advisory = true
        "#;
        assert!(Config::parse(text).is_err());
    }

    #[test]
    fn test_bad_thresholds_rejected() {
        let text = format!("[consensus]\nnear_tie_ratio = 1.5\n{}", MINIMAL);
        assert!(Config::parse(&text).is_err());
        let text = format!("[strategies]\ndisabled = [\"Sideways\"]\n{}", MINIMAL);
        assert!(Config::parse(&text).is_err());
        let text = format!("[risk]\ndaily_stop = 0.02\n{}", MINIMAL);
        assert!(Config::parse(&text).is_err());
    }

    #[test]
    fn test_zero_stops_rejected() {
        let text = format!("[risk]\ndaily_stop = 0\n{}", MINIMAL);
        assert!(Config::parse(&text).is_err());
        let text = format!("[risk]\nintraday_stop = 0.0\n{}", MINIMAL);
        assert!(Config::parse(&text).is_err());
        let text = format!("[risk]\ndaily_stop = -0.01\nintraday_stop = -0.015\n{}", MINIMAL);
        assert!(Config::parse(&text).is_ok());
    }
}
