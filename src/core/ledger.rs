//! Agent Ledger - rolling call history and self-adjusting weight
//!
//! The weight is a Sharpe-like self-confidence score: mean confidence over
//! a window divided by its dispersion. It never drops below `MIN_WEIGHT`,
//! so one bad streak cannot silence an agent for good.
//!
//! The ledger is the single owner of an agent's history and weight; both
//! the per-round consensus path and the daily re-optimization go through
//! its methods.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::types::AgentCall;

/// Weight floor
pub const MIN_WEIGHT: f64 = 0.1;

/// Guard against division by a zero dispersion
const DEVIATION_EPSILON: f64 = 1e-9;

/// Default history retained per agent
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Persistable snapshot of one ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub history: Vec<AgentCall>,
    pub weight: f64,
}

/// Per-agent history and weight
#[derive(Debug, Clone)]
pub struct AgentLedger {
    name: String,
    history: VecDeque<AgentCall>,
    weight: f64,
    history_limit: usize,
}

impl AgentLedger {
    pub fn new(name: impl Into<String>, history_limit: usize) -> Self {
        Self {
            name: name.into(),
            history: VecDeque::new(),
            weight: 1.0,
            history_limit: history_limit.max(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Append a call, dropping the oldest beyond the retention limit
    pub fn record(&mut self, call: AgentCall) {
        self.history.push_back(call);
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
    }

    /// Confidences of the last `window` calls, oldest first
    fn recent(&self, window: usize) -> impl Iterator<Item = f64> + '_ {
        let skip = self.history.len().saturating_sub(window);
        self.history.iter().skip(skip).map(|c| c.confidence)
    }

    /// Mean confidence over the last `window` calls (1.0 with no history)
    pub fn mean_edge(&self, window: usize) -> f64 {
        let edges: Vec<f64> = self.recent(window).collect();
        if edges.is_empty() {
            return 1.0;
        }
        edges.iter().sum::<f64>() / edges.len() as f64
    }

    /// Weight used for one consensus round
    ///
    /// Stored weight scaled by recent mean confidence, floored. Does not
    /// change the stored weight.
    pub fn effective_weight(&self, window: usize) -> f64 {
        (self.weight * self.mean_edge(window)).max(MIN_WEIGHT)
    }

    /// Recompute the stored weight from the last `window` calls
    ///
    /// weight = max(0.1, mean / deviation). Leaves the weight untouched when
    /// there is no history yet. Returns the new weight.
    pub fn update_weight(&mut self, window: usize) -> f64 {
        let edges: Vec<f64> = self.recent(window).collect();
        if edges.is_empty() {
            return self.weight;
        }

        let n = edges.len() as f64;
        let mean = edges.iter().sum::<f64>() / n;
        let variance = edges.iter().map(|e| (e - mean).powi(2)).sum::<f64>() / n;
        let sharpe = mean / (variance.sqrt() + DEVIATION_EPSILON);

        self.weight = if sharpe.is_finite() {
            sharpe.max(MIN_WEIGHT)
        } else {
            MIN_WEIGHT
        };
        self.weight
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            history: self.history.iter().cloned().collect(),
            weight: self.weight,
        }
    }

    /// Replace history and weight with a persisted snapshot
    pub fn restore(&mut self, snapshot: AgentSnapshot) {
        self.history = snapshot.history.into();
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
        self.weight = if snapshot.weight.is_finite() {
            snapshot.weight.max(MIN_WEIGHT)
        } else {
            MIN_WEIGHT
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Direction;
    use chrono::Utc;

    fn call(confidence: f64) -> AgentCall {
        AgentCall::new(Utc::now(), "BTC", Direction::Long, confidence, 1.0, vec![])
    }

    #[test]
    fn test_new_ledger() {
        let ledger = AgentLedger::new("Technical", 10);
        assert_eq!(ledger.weight(), 1.0);
        assert_eq!(ledger.mean_edge(20), 1.0);
        assert_eq!(ledger.effective_weight(20), 1.0);
    }

    #[test]
    fn test_history_bounded() {
        let mut ledger = AgentLedger::new("A", 3);
        for i in 0..5 {
            ledger.record(call(i as f64 / 10.0));
        }
        assert_eq!(ledger.history_len(), 3);
        assert!((ledger.mean_edge(10) - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_update_weight_sharpe() {
        let mut ledger = AgentLedger::new("A", 100);
        for c in [0.4, 0.6, 0.4, 0.6] {
            ledger.record(call(c));
        }
        // mean 0.5, deviation 0.1
        let w = ledger.update_weight(20);
        assert!((w - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_update_weight_floor() {
        let mut ledger = AgentLedger::new("A", 100);
        for c in [0.0, 0.0, 0.0, 1.0] {
            ledger.record(call(c));
        }
        // mean 0.25, deviation ~0.433 -> 0.577; then all-zero history -> floor
        assert!(ledger.update_weight(20) > MIN_WEIGHT);
        for _ in 0..20 {
            ledger.record(call(0.0));
        }
        assert_eq!(ledger.update_weight(20), MIN_WEIGHT);
    }

    #[test]
    fn test_update_weight_without_history_keeps_weight() {
        let mut ledger = AgentLedger::new("A", 100);
        assert_eq!(ledger.update_weight(20), 1.0);
    }

    #[test]
    fn test_effective_weight_uses_window() {
        let mut ledger = AgentLedger::new("A", 100);
        for _ in 0..10 {
            ledger.record(call(0.9));
        }
        for _ in 0..2 {
            ledger.record(call(0.5));
        }
        assert!((ledger.effective_weight(2) - 0.5).abs() < 1e-12);
        for _ in 0..20 {
            ledger.record(call(0.01));
        }
        assert_eq!(ledger.effective_weight(20), MIN_WEIGHT);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut ledger = AgentLedger::new("A", 100);
        ledger.record(call(0.3));
        ledger.record(call(0.7));
        ledger.update_weight(20);

        let snap = ledger.snapshot();
        let mut restored = AgentLedger::new("A", 100);
        restored.restore(snap.clone());

        assert_eq!(restored.snapshot(), snap);
        assert_eq!(restored.weight().to_bits(), ledger.weight().to_bits());
    }
}
