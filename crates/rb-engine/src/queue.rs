//! Per-tick action queue
//!
//! Actions fired between two ticks accumulate here, coalesced by
//! `kind -> key` with the last write winning, next to at most one pending
//! transition.

use indexmap::IndexMap;
use rb_core::Value;
use std::time::Duration;

/// A deferred state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransit {
    pub target: String,
    pub delay: Duration,
}

/// Coalesced actions of one kind, keyed by (optional) key
pub type KindActions = IndexMap<Option<String>, Option<Value>>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionQueue {
    actions: IndexMap<String, KindActions>,
    transit: Option<PendingTransit>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an action; a later action on the same kind and key replaces it
    pub fn push(&mut self, kind: &str, key: Option<&str>, value: Option<Value>) {
        self.actions
            .entry(kind.to_string())
            .or_default()
            .insert(key.map(str::to_string), value);
    }

    /// Queue a transition, replacing any pending one
    pub fn set_transit(&mut self, transit: PendingTransit) {
        self.transit = Some(transit);
    }

    pub fn transit(&self) -> Option<&PendingTransit> {
        self.transit.as_ref()
    }

    pub fn actions(&self) -> &IndexMap<String, KindActions> {
        &self.actions
    }

    /// Swap the queue for an empty one and return what was queued
    pub fn take(&mut self) -> ActionQueue {
        std::mem::take(self)
    }

    pub fn into_parts(self) -> (IndexMap<String, KindActions>, Option<PendingTransit>) {
        (self.actions, self.transit)
    }

    /// Total number of queued key actions, transition excluded
    pub fn len(&self) -> usize {
        self.actions.values().map(IndexMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.transit.is_none()
    }

    pub fn clear(&mut self) {
        self.actions.clear();
        self.transit = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_write_wins() {
        let mut queue = ActionQueue::new();
        queue.push("lcd", Some("1"), Some(Value::from("A")));
        queue.push("lcd", Some("2"), Some(Value::from("X")));
        queue.push("lcd", Some("1"), Some(Value::from("B")));

        assert_eq!(queue.len(), 2);
        let lcd = &queue.actions()["lcd"];
        assert_eq!(lcd[&Some("1".to_string())], Some(Value::from("B")));
        // Replaced entries keep their original position
        assert_eq!(lcd.keys().next(), Some(&Some("1".to_string())));
    }

    #[test]
    fn test_single_pending_transit() {
        let mut queue = ActionQueue::new();
        queue.set_transit(PendingTransit {
            target: "a".into(),
            delay: Duration::ZERO,
        });
        queue.set_transit(PendingTransit {
            target: "b".into(),
            delay: Duration::from_millis(10),
        });
        assert_eq!(queue.transit().map(|t| t.target.as_str()), Some("b"));
    }

    #[test]
    fn test_take_leaves_empty_queue() {
        let mut queue = ActionQueue::new();
        queue.push("mcp23017", Some("0"), Some(Value::Bool(true)));
        let taken = queue.take();
        assert!(queue.is_empty());
        assert_eq!(taken.len(), 1);
    }
}
