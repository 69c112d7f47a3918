//! Core trading logic
//!
//! - Analysts produce one call per slice, optionally advised by a remote model
//! - Ledgers track each analyst's history and self-adjusting weight
//! - Consensus combines calls, escalating contested votes to a debate step
//! - Regime classification picks the strategy that shapes the order
//! - The guardian admits or rejects the order against risk limits
//! - The position book turns fills into realized P&L

pub mod advisory;
pub mod agent;
pub mod book;
pub mod consensus;
pub mod coordinator;
pub mod guardian;
pub mod ledger;
pub mod memory;
pub mod regime;
pub mod strategy;
pub mod types;

// Re-export commonly used types
pub use agent::{build_agents, AdvisedAgent, AgentKind, Analyst, HeuristicAgent};
pub use book::{Position, PositionBook};
pub use consensus::{weighted_consensus, ConsensusAggregator, ConsensusError, DebateResolver};
pub use coordinator::Coordinator;
pub use guardian::{RiskConfig, RiskEngine, RiskRejection, RiskState};
pub use ledger::{AgentLedger, AgentSnapshot};
pub use regime::{Regime, RegimeClassifier};
pub use strategy::{StrategySignal, StrategyTable};
pub use types::{AgentCall, AgentVote, ConsensusResult, Direction, MarketSlice};
