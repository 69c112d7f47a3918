//! Coordinator Module
//!
//! Fans one market slice out to every agent in parallel, waits for all of
//! them, and drives the aggregator. There is no partial quorum: if any agent
//! task is lost, the round produces no decision.
//!
//! After consensus each agent's own call (not the aggregate) goes into that
//! agent's ledger. The round's votes are kept until the next round so the
//! engine can attach them to the trade they led to.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::agent::Analyst;
use super::consensus::{ConsensusAggregator, ConsensusError};
use super::ledger::{AgentLedger, AgentSnapshot};
use super::types::{AgentCall, AgentVote, ConsensusResult, MarketSlice};

/// Default window for the per-round effective weight
pub const DEFAULT_WEIGHT_WINDOW: usize = 20;

/// Coordinator owns the agents and their ledgers
pub struct Coordinator {
    agents: Vec<Arc<dyn Analyst>>,
    ledgers: Vec<AgentLedger>,
    aggregator: ConsensusAggregator,
    weight_window: usize,
    transcript: Vec<AgentVote>,
}

impl Coordinator {
    pub fn new(
        agents: Vec<Arc<dyn Analyst>>,
        aggregator: ConsensusAggregator,
        weight_window: usize,
        history_limit: usize,
    ) -> Self {
        let ledgers = agents
            .iter()
            .map(|a| AgentLedger::new(a.name(), history_limit))
            .collect();
        Self {
            agents,
            ledgers,
            aggregator,
            weight_window: weight_window.max(1),
            transcript: Vec::new(),
        }
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn ledgers(&self) -> &[AgentLedger] {
        &self.ledgers
    }

    pub fn ledger(&self, name: &str) -> Option<&AgentLedger> {
        self.ledgers.iter().find(|l| l.name() == name)
    }

    /// Votes of the last round that reached consensus
    pub fn transcript(&self) -> &[AgentVote] {
        &self.transcript
    }

    /// Run every agent against the slice concurrently
    ///
    /// Each agent gets its own task so a slow advisory call never blocks its
    /// siblings. Returns calls in agent order.
    async fn gather(&self, slice: &MarketSlice) -> Result<Vec<AgentCall>, ConsensusError> {
        let mut tasks = JoinSet::new();
        for (idx, agent) in self.agents.iter().enumerate() {
            let agent = Arc::clone(agent);
            let slice = slice.clone();
            tasks.spawn(async move { (idx, agent.analyze(&slice).await) });
        }

        let mut slots: Vec<Option<AgentCall>> = vec![None; self.agents.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, call)) => slots[idx] = Some(call),
                Err(e) => warn!(error = %e, "agent task did not complete"),
            }
        }

        let mut calls = Vec::with_capacity(slots.len());
        for (slot, agent) in slots.into_iter().zip(&self.agents) {
            match slot {
                Some(call) => calls.push(call),
                None => return Err(ConsensusError::AgentAborted(agent.name().to_string())),
            }
        }
        Ok(calls)
    }

    /// Decide on one slice
    pub async fn decide(&mut self, slice: &MarketSlice) -> Result<ConsensusResult, ConsensusError> {
        self.transcript.clear();
        let calls = self.gather(slice).await?;
        let weights: Vec<f64> = self
            .ledgers
            .iter()
            .map(|l| l.effective_weight(self.weight_window))
            .collect();

        let consensus = self.aggregator.aggregate(&calls, &weights).await?;

        for ((ledger, call), weight) in self.ledgers.iter_mut().zip(calls).zip(weights) {
            debug!(
                agent = ledger.name(),
                direction = %call.direction,
                confidence = call.confidence,
                "agent call"
            );
            self.transcript.push(AgentVote {
                agent: ledger.name().to_string(),
                direction: call.direction,
                confidence: call.confidence,
                weight,
            });
            ledger.record(call);
        }

        Ok(consensus)
    }

    /// Full re-optimization of stored weights over a longer window
    pub fn reoptimize_weights(&mut self, window: usize) {
        for ledger in &mut self.ledgers {
            let before = ledger.weight();
            let after = ledger.update_weight(window);
            info!(agent = ledger.name(), before, after, "weight re-optimized");
        }
    }

    pub fn snapshots(&self) -> BTreeMap<String, AgentSnapshot> {
        self.ledgers
            .iter()
            .map(|l| (l.name().to_string(), l.snapshot()))
            .collect()
    }

    /// Restore ledgers from persisted snapshots
    ///
    /// Snapshots for agents that are no longer configured are dropped.
    pub fn restore(&mut self, mut snapshots: BTreeMap<String, AgentSnapshot>) {
        for ledger in &mut self.ledgers {
            if let Some(snapshot) = snapshots.remove(ledger.name()) {
                info!(
                    agent = ledger.name(),
                    calls = snapshot.history.len(),
                    weight = snapshot.weight,
                    "ledger restored"
                );
                ledger.restore(snapshot);
            }
        }
        for name in snapshots.keys() {
            warn!(agent = %name, "dropping snapshot for unconfigured agent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::agent::{AgentKind, HeuristicAgent};
    use crate::core::types::Direction;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::time::Duration;

    /// Agent with a fixed call and an optional delay
    struct FixedAgent {
        name: String,
        direction: Direction,
        confidence: f64,
        delay_ms: u64,
    }

    #[async_trait]
    impl Analyst for FixedAgent {
        fn name(&self) -> &str {
            &self.name
        }

        async fn analyze(&self, slice: &MarketSlice) -> AgentCall {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            AgentCall::new(
                slice.timestamp,
                slice.instrument.clone(),
                self.direction,
                self.confidence,
                1.5,
                vec![self.name.clone()],
            )
        }
    }

    struct PanickingAgent;

    #[async_trait]
    impl Analyst for PanickingAgent {
        fn name(&self) -> &str {
            "Broken"
        }

        async fn analyze(&self, _slice: &MarketSlice) -> AgentCall {
            panic!("agent blew up");
        }
    }

    fn fixed(name: &str, direction: Direction, confidence: f64, delay_ms: u64) -> Arc<dyn Analyst> {
        Arc::new(FixedAgent { name: name.into(), direction, confidence, delay_ms })
    }

    fn slice() -> MarketSlice {
        MarketSlice::new("BTC", Utc::now())
    }

    #[tokio::test]
    async fn test_decide_waits_for_all_agents() {
        let agents = vec![
            fixed("slow", Direction::Long, 0.8, 50),
            fixed("fast", Direction::Long, 0.7, 0),
        ];
        let mut coord = Coordinator::new(agents, ConsensusAggregator::default(), 20, 100);

        let result = coord.decide(&slice()).await.unwrap();
        assert_eq!(result.direction, Direction::Long);
        // Evidence keeps agent order regardless of completion order
        assert_eq!(result.evidence, vec!["slow".to_string(), "fast".to_string()]);
        assert_eq!(coord.ledger("slow").unwrap().history_len(), 1);
        assert_eq!(coord.ledger("fast").unwrap().history_len(), 1);
    }

    #[tokio::test]
    async fn test_transcript_keeps_round_votes() {
        let agents = vec![
            fixed("bull", Direction::Long, 0.8, 10),
            fixed("bear", Direction::Short, 0.3, 0),
        ];
        let mut coord = Coordinator::new(agents, ConsensusAggregator::default(), 20, 100);

        coord.decide(&slice()).await.unwrap();
        let votes = coord.transcript();
        assert_eq!(votes.len(), 2);
        assert_eq!(votes[0].agent, "bull");
        assert_eq!(votes[0].direction, Direction::Long);
        assert_eq!(votes[1].agent, "bear");
        assert_eq!(votes[1].confidence, 0.3);
        // Empty histories weigh equally
        assert_eq!(votes[0].weight, votes[1].weight);
    }

    #[tokio::test]
    async fn test_ledgers_record_own_calls() {
        let agents = vec![
            fixed("bull", Direction::Long, 0.6, 0),
            fixed("bear", Direction::Short, 0.6, 0),
        ];
        let mut coord = Coordinator::new(agents, ConsensusAggregator::default(), 20, 100);

        let result = coord.decide(&slice()).await.unwrap();
        assert_eq!(result.direction, Direction::Flat);

        let bear = coord.ledger("bear").unwrap().snapshot();
        assert_eq!(bear.history[0].direction, Direction::Short);
    }

    #[tokio::test]
    async fn test_lost_agent_aborts_round() {
        let agents: Vec<Arc<dyn Analyst>> = vec![
            fixed("ok", Direction::Long, 0.9, 0),
            Arc::new(PanickingAgent),
        ];
        let mut coord = Coordinator::new(agents, ConsensusAggregator::default(), 20, 100);

        let err = coord.decide(&slice()).await.unwrap_err();
        assert_eq!(err, ConsensusError::AgentAborted("Broken".into()));
        // Nothing recorded from a partial round
        assert_eq!(coord.ledger("ok").unwrap().history_len(), 0);
        assert!(coord.transcript().is_empty());
    }

    #[tokio::test]
    async fn test_no_agents_is_precondition_error() {
        let mut coord = Coordinator::new(vec![], ConsensusAggregator::default(), 20, 100);
        assert_eq!(coord.decide(&slice()).await.unwrap_err(), ConsensusError::NoCalls);
    }

    #[tokio::test]
    async fn test_weights_follow_history() {
        let agents = vec![
            fixed("confident", Direction::Long, 0.9, 0),
            fixed("timid", Direction::Short, 0.05, 0),
        ];
        let mut coord = Coordinator::new(agents, ConsensusAggregator::default(), 20, 100);

        // First round: empty histories, equal weights -> contested -> FLAT
        let first = coord.decide(&slice()).await.unwrap();
        assert_eq!(first.direction, Direction::Flat);

        // Second round: weights scale with recent confidence (0.9 vs floor 0.1)
        let second = coord.decide(&slice()).await.unwrap();
        assert_eq!(second.direction, Direction::Long);
    }

    #[tokio::test]
    async fn test_snapshot_restore_and_reoptimize() {
        let agents: Vec<Arc<dyn Analyst>> =
            vec![Arc::new(HeuristicAgent::new("Technical", AgentKind::Technical))];
        let mut coord = Coordinator::new(agents, ConsensusAggregator::default(), 20, 100);

        let s = slice()
            .with_feature("close", 100.0)
            .with_feature("ma10", 102.0)
            .with_feature("ma60", 100.0);
        coord.decide(&s).await.unwrap();
        let s = slice()
            .with_feature("close", 100.0)
            .with_feature("ma10", 104.0)
            .with_feature("ma60", 100.0);
        coord.decide(&s).await.unwrap();
        coord.reoptimize_weights(100);

        let mut snaps = coord.snapshots();
        let weight = snaps["Technical"].weight;
        // mean 0.03, deviation 0.01
        assert!((weight - 3.0).abs() < 1e-6);

        snaps.insert("Retired".into(), AgentSnapshot { history: vec![], weight: 2.0 });
        let agents: Vec<Arc<dyn Analyst>> =
            vec![Arc::new(HeuristicAgent::new("Technical", AgentKind::Technical))];
        let mut fresh = Coordinator::new(agents, ConsensusAggregator::default(), 20, 100);
        fresh.restore(snaps);
        assert_eq!(fresh.ledger("Technical").unwrap().weight().to_bits(), weight.to_bits());
        assert!(fresh.ledger("Retired").is_none());
    }
}
