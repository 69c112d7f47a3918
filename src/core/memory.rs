//! Recall Index - private agent memory
//!
//! Each advised agent remembers which calls it made under which evidence.
//! When the same evidence shows up again, the prior calls are fed back into
//! its advisory prompt. The index is owned by one agent and never shared.

use std::collections::{HashMap, VecDeque};

use super::types::Direction;

/// Default number of distinct evidence keys kept
pub const DEFAULT_CAPACITY: usize = 256;

/// Maximum remembered calls per evidence key
const MAX_NOTES_PER_KEY: usize = 8;

/// A remembered call
#[derive(Debug, Clone, PartialEq)]
pub struct RecallNote {
    pub direction: Direction,
    pub confidence: f64,
}

/// Bounded evidence-keyed memory with FIFO eviction
#[derive(Debug, Clone)]
pub struct RecallIndex {
    notes: HashMap<String, VecDeque<RecallNote>>,
    /// Insertion order of keys, oldest first
    order: VecDeque<String>,
    capacity: usize,
}

impl Default for RecallIndex {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl RecallIndex {
    pub fn new(capacity: usize) -> Self {
        Self {
            notes: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Remember a call made under the given evidence
    pub fn remember(&mut self, evidence: &str, note: RecallNote) {
        if let Some(list) = self.notes.get_mut(evidence) {
            list.push_back(note);
            while list.len() > MAX_NOTES_PER_KEY {
                list.pop_front();
            }
            return;
        }

        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.notes.remove(&oldest);
            }
        }

        self.order.push_back(evidence.to_string());
        self.notes.insert(evidence.to_string(), VecDeque::from([note]));
    }

    /// Prior calls made under the given evidence, oldest first
    pub fn recall(&self, evidence: &str) -> Vec<RecallNote> {
        self.notes
            .get(evidence)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(direction: Direction, confidence: f64) -> RecallNote {
        RecallNote { direction, confidence }
    }

    #[test]
    fn test_remember_and_recall() {
        let mut index = RecallIndex::new(4);
        index.remember("ma_diff=0.5", note(Direction::Long, 0.6));
        index.remember("ma_diff=0.5", note(Direction::Long, 0.7));

        let notes = index.recall("ma_diff=0.5");
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[1].confidence, 0.7);
        assert!(index.recall("unknown").is_empty());
    }

    #[test]
    fn test_evicts_oldest_key() {
        let mut index = RecallIndex::new(2);
        index.remember("a", note(Direction::Long, 0.1));
        index.remember("b", note(Direction::Short, 0.2));
        index.remember("c", note(Direction::Flat, 0.3));

        assert_eq!(index.len(), 2);
        assert!(index.recall("a").is_empty());
        assert_eq!(index.recall("c").len(), 1);
    }

    #[test]
    fn test_notes_per_key_bounded() {
        let mut index = RecallIndex::new(2);
        for i in 0..20 {
            index.remember("k", note(Direction::Long, i as f64 / 20.0));
        }
        let notes = index.recall("k");
        assert_eq!(notes.len(), MAX_NOTES_PER_KEY);
        assert!((notes.last().unwrap().confidence - 0.95).abs() < 1e-12);
    }
}
