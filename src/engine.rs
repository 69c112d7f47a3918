//! Trading Engine - one decision cycle per market slice
//!
//! Cycle order:
//! 1. calendar roll (UTC day, intraday session) from the slice timestamp
//! 2. multi-agent consensus
//! 3. gates: minimum edge, FLAT, unmapped regime, zero size, risk check
//! 4. order placement; fills go through the position book into the risk
//!    counters, venue-acknowledged pending orders reserve exposure
//! 5. state save, whatever happened above
//!
//! Agent and trade failures never stop the loop. Precondition violations
//! (no agents, bad weights) and state-store failures do.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Timelike, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{ExecutionGateway, OrderRequest, OrderStatus};
use crate::config::{Config, DebatePolicy, OrderType};
use crate::core::advisory::AdvisoryClient;
use crate::core::agent::build_agents;
use crate::core::book::PositionBook;
use crate::core::consensus::{
    AdvisoryDebate, ConsensusAggregator, ConsensusError, DebateResolver, StandDown, WeightDelta,
};
use crate::core::coordinator::Coordinator;
use crate::core::guardian::{RiskEngine, RiskRejection};
use crate::core::regime::{Regime, RegimeClassifier};
use crate::core::strategy::StrategyTable;
use crate::core::types::{Direction, MarketSlice};
use crate::data::state::{
    Calendar, OpenTrade, PersistedState, StateStore, TradeRecord, STATE_VERSION,
};

/// Knobs the cycle reads on every slice
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub min_edge: f64,
    pub reoptimize_window: usize,
    pub quantity_dp: u32,
    pub order_type: OrderType,
    pub trade_log_limit: usize,
    pub session_hours: u32,
}

impl From<&Config> for EngineSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            min_edge: cfg.consensus.min_edge,
            reoptimize_window: cfg.consensus.reoptimize_window,
            quantity_dp: cfg.execution.quantity_dp,
            order_type: cfg.execution.order_type,
            trade_log_limit: cfg.state.trade_log_limit,
            session_hours: cfg.risk.intraday_session_hours.max(1),
        }
    }
}

/// What one cycle did
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// An agent task was lost; no decision from a partial set
    Aborted { agent: String },
    LowEdge { edge: f64 },
    Flat,
    NoStrategy { regime: Regime },
    ZeroQuantity,
    RiskRejected(RiskRejection),
    GatewayFailed { error: String },
    /// Acknowledged without a fill; the quantity is reserved against exposure
    Pending { quantity: Decimal },
    NotFilled { status: OrderStatus },
    Filled(TradeRecord),
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Aborted { .. } => "aborted",
            CycleOutcome::LowEdge { .. } => "low_edge",
            CycleOutcome::Flat => "flat",
            CycleOutcome::NoStrategy { .. } => "no_strategy",
            CycleOutcome::ZeroQuantity => "zero_quantity",
            CycleOutcome::RiskRejected(_) => "risk_rejected",
            CycleOutcome::GatewayFailed { .. } => "gateway_failed",
            CycleOutcome::Pending { .. } => "pending",
            CycleOutcome::NotFilled { .. } => "not_filled",
            CycleOutcome::Filled(_) => "filled",
        }
    }
}

/// Counts per outcome over a run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub cycles: usize,
    pub outcomes: BTreeMap<&'static str, usize>,
}

impl RunSummary {
    fn record(&mut self, outcome: &CycleOutcome) {
        self.cycles += 1;
        *self.outcomes.entry(outcome.label()).or_default() += 1;
    }

    pub fn count(&self, label: &str) -> usize {
        self.outcomes.get(label).copied().unwrap_or(0)
    }
}

pub struct TradingEngine {
    coordinator: Coordinator,
    regimes: RegimeClassifier,
    strategies: StrategyTable,
    risk: RiskEngine,
    positions: PositionBook,
    gateway: Arc<dyn ExecutionGateway>,
    store: Box<dyn StateStore>,
    settings: EngineSettings,
    open_trades: Vec<OpenTrade>,
    trade_log: VecDeque<TradeRecord>,
    calendar: Calendar,
}

/// Escalation step for the configured debate policy
pub fn build_resolver(
    cfg: &Config,
    advisory: Option<Arc<dyn AdvisoryClient>>,
) -> Result<Arc<dyn DebateResolver>> {
    Ok(match cfg.consensus.debate {
        DebatePolicy::StandDown => Arc::new(StandDown),
        DebatePolicy::WeightDelta => Arc::new(WeightDelta::new(cfg.consensus.debate_margin)),
        DebatePolicy::Advisory => {
            let client =
                advisory.ok_or_else(|| anyhow!("advisory debate needs an advisory client"))?;
            Arc::new(AdvisoryDebate::new(client))
        }
    })
}

impl TradingEngine {
    pub fn new(
        coordinator: Coordinator,
        regimes: RegimeClassifier,
        strategies: StrategyTable,
        risk: RiskEngine,
        gateway: Arc<dyn ExecutionGateway>,
        store: Box<dyn StateStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            coordinator,
            regimes,
            strategies,
            risk,
            positions: PositionBook::new(),
            gateway,
            store,
            settings,
            open_trades: Vec::new(),
            trade_log: VecDeque::new(),
            calendar: Calendar::default(),
        }
    }

    /// Wire every component from a validated config
    pub fn from_config(
        cfg: &Config,
        gateway: Arc<dyn ExecutionGateway>,
        store: Box<dyn StateStore>,
        advisory: Option<Arc<dyn AdvisoryClient>>,
    ) -> Result<Self> {
        let agents = build_agents(&cfg.agents, advisory.clone(), cfg.advisory.memory_capacity)?;
        let resolver = build_resolver(cfg, advisory)?;
        let aggregator = ConsensusAggregator::new(cfg.consensus.near_tie_ratio, resolver);
        let coordinator = Coordinator::new(
            agents,
            aggregator,
            cfg.consensus.weight_window,
            cfg.consensus.history_limit,
        );
        let regimes = RegimeClassifier::new(
            cfg.regime.trend_threshold,
            cfg.regime.volatility_threshold,
            cfg.regime.hysteresis,
        );
        let strategies = StrategyTable::standard().without(&cfg.strategies.disabled_regimes()?);

        Ok(Self::new(
            coordinator,
            regimes,
            strategies,
            RiskEngine::new(cfg.risk.clone()),
            gateway,
            store,
            EngineSettings::from(cfg),
        ))
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn risk(&self) -> &RiskEngine {
        &self.risk
    }

    pub fn positions(&self) -> &PositionBook {
        &self.positions
    }

    pub fn open_trades(&self) -> &[OpenTrade] {
        &self.open_trades
    }

    pub fn trade_log(&self) -> impl Iterator<Item = &TradeRecord> {
        self.trade_log.iter()
    }

    /// Load the last snapshot and replay it into every component
    pub fn resume(&mut self) -> Result<()> {
        let state = self
            .store
            .load()
            .with_context(|| format!("failed to load state from {}", self.store.describe()))?;
        info!(
            store = %self.store.describe(),
            agents = state.agents.len(),
            positions = state.positions.len(),
            open_trades = state.open_trades.len(),
            trades = state.trade_log.len(),
            "state loaded"
        );
        self.restore(state);
        Ok(())
    }

    pub fn restore(&mut self, state: PersistedState) {
        self.coordinator.restore(state.agents);
        self.risk.restore(state.risk);
        self.positions = state.positions;
        self.regimes.restore(state.regimes);
        self.open_trades = state.open_trades;
        self.trade_log = state.trade_log.into();
        while self.trade_log.len() > self.settings.trade_log_limit {
            self.trade_log.pop_front();
        }
        self.calendar = state.calendar;
    }

    pub fn snapshot(&self) -> PersistedState {
        PersistedState {
            version: STATE_VERSION,
            agents: self.coordinator.snapshots(),
            risk: self.risk.state().clone(),
            positions: self.positions.clone(),
            regimes: self.regimes.memory().clone(),
            open_trades: self.open_trades.clone(),
            trade_log: self.trade_log.iter().cloned().collect(),
            calendar: self.calendar.clone(),
        }
    }

    /// Day and session bookkeeping driven by slice time
    fn roll_calendar(&mut self, ts: DateTime<Utc>) {
        let day = ts.date_naive();
        let session = ts.hour() / self.settings.session_hours;

        match self.calendar.trading_day {
            Some(current) if day < current => {
                debug!(%day, %current, "slice from an earlier day, calendar unchanged");
            }
            Some(current) if day == current => {
                if self.calendar.session.map_or(true, |s| session > s) {
                    self.risk.reset_intraday();
                    self.calendar.session = Some(session);
                }
            }
            previous => {
                if previous.is_some() {
                    self.risk.start_new_day();
                    if self.calendar.last_reoptimized != Some(day) {
                        self.coordinator.reoptimize_weights(self.settings.reoptimize_window);
                        self.calendar.last_reoptimized = Some(day);
                    }
                }
                info!(%day, session, "trading day started");
                self.calendar.trading_day = Some(day);
                self.calendar.session = Some(session);
            }
        }
    }

    /// Run one full cycle and persist the result
    pub async fn handle_slice(&mut self, slice: &MarketSlice) -> Result<CycleOutcome> {
        let outcome = self.cycle(slice).await;
        let saved = self
            .store
            .save(&self.snapshot())
            .with_context(|| format!("failed to save state to {}", self.store.describe()));

        let outcome = outcome?;
        saved?;
        Ok(outcome)
    }

    async fn cycle(&mut self, slice: &MarketSlice) -> Result<CycleOutcome> {
        self.roll_calendar(slice.timestamp);

        let consensus = match self.coordinator.decide(slice).await {
            Ok(c) => c,
            Err(ConsensusError::AgentAborted(agent)) => {
                warn!(instrument = %slice.instrument, %agent, "agent lost, cycle aborted");
                return Ok(CycleOutcome::Aborted { agent });
            }
            Err(e) => return Err(e).context("consensus precondition violated"),
        };

        if consensus.edge < self.settings.min_edge {
            debug!(instrument = %slice.instrument, edge = consensus.edge, "edge below threshold");
            return Ok(CycleOutcome::LowEdge { edge: consensus.edge });
        }
        if consensus.direction == Direction::Flat {
            debug!(instrument = %slice.instrument, debate = ?consensus.debate, "consensus flat");
            return Ok(CycleOutcome::Flat);
        }

        let regime = self.regimes.observe(slice);
        let signal = match self.strategies.dispatch(regime, slice) {
            Some(s) => s.sized(consensus.direction, consensus.edge, self.settings.quantity_dp),
            None => {
                debug!(instrument = %slice.instrument, %regime, "no strategy for regime");
                return Ok(CycleOutcome::NoStrategy { regime });
            }
        };
        if signal.quantity.is_zero() {
            return Ok(CycleOutcome::ZeroQuantity);
        }

        let price = match self.settings.order_type {
            OrderType::Market => None,
            OrderType::Limit => slice.feature("close").and_then(Decimal::from_f64_retain),
        };
        let order = OrderRequest {
            client_order_id: Uuid::new_v4(),
            instrument: signal.instrument.clone(),
            side: signal.side,
            quantity: signal.quantity,
            price,
            strategy_id: signal.strategy_id.to_string(),
            stop_loss_pct: signal.stop_loss_pct,
            take_profit_pct: signal.take_profit_pct,
            valid_for_secs: signal.valid_for_secs,
        };

        if let Err(rejection) = self.risk.check(&order.instrument, order.signed_quantity()) {
            info!(
                instrument = %order.instrument,
                strategy = %order.strategy_id,
                quantity = %order.signed_quantity(),
                reason = %rejection,
                "order rejected by risk"
            );
            return Ok(CycleOutcome::RiskRejected(rejection));
        }

        let result = match self.gateway.place_order(&order).await {
            Ok(r) => r,
            Err(e) => {
                error!(
                    instrument = %order.instrument,
                    gateway = self.gateway.name(),
                    error = %format!("{:#}", e),
                    "order placement failed"
                );
                return Ok(CycleOutcome::GatewayFailed { error: format!("{:#}", e) });
            }
        };
        match result.status {
            OrderStatus::Filled => {}
            OrderStatus::Pending => {
                // No fill report is polled, so the venue may fill it at any time
                self.risk.reserve(&order.instrument, order.signed_quantity());
                warn!(
                    instrument = %order.instrument,
                    quantity = %order.signed_quantity(),
                    venue_order_id = ?result.venue_order_id,
                    "order pending at venue, exposure reserved"
                );
                return Ok(CycleOutcome::Pending { quantity: order.quantity });
            }
            OrderStatus::Rejected => {
                warn!(
                    instrument = %order.instrument,
                    message = ?result.message,
                    "order rejected by venue"
                );
                return Ok(CycleOutcome::NotFilled { status: result.status });
            }
        }

        let filled = if result.filled_quantity.is_zero() {
            order.quantity
        } else {
            result.filled_quantity
        };
        let signed = if order.signed_quantity().is_sign_negative() { -filled } else { filled };
        let fill_price = result.fill_price.or(order.price);
        let realized_pnl = self.positions.apply(&order.instrument, signed, fill_price);
        self.risk.record_fill(&order.instrument, signed, realized_pnl);

        let timestamp = consensus.timestamp;
        let remaining =
            offset_open_trades(&mut self.open_trades, &order.instrument, order.side, filled);
        if !remaining.is_zero() {
            self.open_trades.push(OpenTrade {
                client_order_id: order.client_order_id,
                instrument: order.instrument.clone(),
                strategy_id: order.strategy_id.clone(),
                side: order.side,
                quantity: remaining,
                entry_price: fill_price,
                stop_loss_pct: order.stop_loss_pct,
                take_profit_pct: order.take_profit_pct,
                opened_at: timestamp,
            });
        }
        let record = TradeRecord {
            timestamp,
            client_order_id: order.client_order_id,
            venue_order_id: result.venue_order_id.clone(),
            instrument: order.instrument.clone(),
            strategy_id: order.strategy_id.clone(),
            regime: regime.to_string(),
            side: order.side,
            quantity: filled,
            fill_price,
            realized_pnl,
            edge: consensus.edge,
            votes: self.coordinator.transcript().to_vec(),
        };
        self.trade_log.push_back(record.clone());
        while self.trade_log.len() > self.settings.trade_log_limit {
            self.trade_log.pop_front();
        }

        info!(
            instrument = %order.instrument,
            side = %order.side,
            quantity = %filled,
            strategy = %order.strategy_id,
            %regime,
            edge = consensus.edge,
            pnl = %realized_pnl,
            "order filled"
        );
        Ok(CycleOutcome::Filled(record))
    }

    /// Consume slices until the channel closes or shutdown fires
    ///
    /// Shutdown is only observed between cycles; a started cycle always
    /// runs to completion and is saved.
    pub async fn run<F>(
        &mut self,
        mut slices: mpsc::Receiver<MarketSlice>,
        shutdown: F,
    ) -> Result<RunSummary>
    where
        F: Future<Output = ()>,
    {
        let mut summary = RunSummary::default();
        tokio::pin!(shutdown);

        loop {
            let slice = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested, stopping after last completed cycle");
                    break;
                }
                next = slices.recv() => match next {
                    Some(slice) => slice,
                    None => {
                        info!("slice feed ended");
                        break;
                    }
                },
            };

            let outcome = self.handle_slice(&slice).await?;
            debug!(instrument = %slice.instrument, outcome = outcome.label(), "cycle complete");
            summary.record(&outcome);
        }

        info!(cycles = summary.cycles, status = %self.risk.status(), "engine stopped");
        Ok(summary)
    }
}

/// Close opposite-side open trades on an instrument, oldest first
///
/// Returns the part of `quantity` left over to open a new trade.
fn offset_open_trades(
    open: &mut Vec<OpenTrade>,
    instrument: &str,
    side: Direction,
    mut quantity: Decimal,
) -> Decimal {
    for trade in open.iter_mut().filter(|t| t.instrument == instrument && t.side != side) {
        if quantity.is_zero() {
            break;
        }
        let closed = trade.quantity.min(quantity);
        trade.quantity -= closed;
        quantity -= closed;
    }
    open.retain(|t| !t.quantity.is_zero());
    quantity
}
