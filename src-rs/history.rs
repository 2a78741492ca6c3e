//! Bounded records of what the agent recently did.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::action::ActionSignature;

/// Sliding window of canonical action signatures for loop detection.
#[derive(Debug, Clone)]
pub struct SignatureHistory {
    window: usize,
    signatures: VecDeque<ActionSignature>,
}

impl SignatureHistory {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            signatures: VecDeque::with_capacity(window.max(1)),
        }
    }

    pub fn push(&mut self, signature: ActionSignature) {
        if self.signatures.len() == self.window {
            self.signatures.pop_front();
        }
        self.signatures.push_back(signature);
    }

    /// True when the last `n` signatures exist and are all equal.
    pub fn is_looping(&self, n: usize) -> bool {
        if n == 0 || self.signatures.len() < n {
            return false;
        }
        let mut tail = self.signatures.iter().rev().take(n);
        let Some(first) = tail.next() else {
            return false;
        };
        tail.all(|sig| sig == first)
    }

    pub fn clear(&mut self) {
        self.signatures.clear();
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    pub fn last(&self) -> Option<&ActionSignature> {
        self.signatures.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActionSignature> {
        self.signatures.iter()
    }
}

/// One executed action as the oracle will see it next cycle.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HistoryEntry {
    pub tool: String,
    pub justification: String,
    pub result: String,
    pub success: bool,
    pub at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(
        tool: impl Into<String>,
        justification: impl Into<String>,
        result: impl Into<String>,
        success: bool,
    ) -> Self {
        Self {
            tool: tool.into(),
            justification: justification.into(),
            result: result.into(),
            success,
            at: Utc::now(),
        }
    }
}

/// Recent action/justification pairs, oldest first.
#[derive(Debug, Clone)]
pub struct ActionHistory {
    capacity: usize,
    entries: VecDeque<HistoryEntry>,
}

impl ActionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Last `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<HistoryEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(raw: &str) -> ActionSignature {
        ActionSignature::from_raw(raw)
    }

    #[test]
    fn window_is_bounded() {
        let mut history = SignatureHistory::new(10);
        for i in 0..25 {
            history.push(sig(&format!("click:{i}:0:")));
        }
        assert_eq!(history.len(), 10);
        assert_eq!(history.last(), Some(&sig("click:24:0:")));
        assert_eq!(history.iter().next(), Some(&sig("click:15:0:")));
    }

    #[test]
    fn detects_identical_tail_only() {
        let mut history = SignatureHistory::new(10);
        for _ in 0..3 {
            history.push(sig("scroll:0:-300"));
        }
        assert!(!history.is_looping(4));
        history.push(sig("scroll:0:-300"));
        assert!(history.is_looping(4));
        history.push(sig("type:5"));
        assert!(!history.is_looping(4));
        history.clear();
        assert!(history.is_empty());
        assert!(!history.is_looping(4));
    }

    #[test]
    fn recent_returns_newest_tail_in_order() {
        let mut history = ActionHistory::new(8);
        for i in 0..12 {
            history.push(HistoryEntry::new("click", format!("step {i}"), "ok", true));
        }
        assert_eq!(history.len(), 8);
        let recent = history.recent(4);
        let just: Vec<&str> = recent.iter().map(|e| e.justification.as_str()).collect();
        assert_eq!(just, vec!["step 8", "step 9", "step 10", "step 11"]);
    }
}
