//! Global device state storage for the rulebot engine
//!
//! This crate provides [`GlobalState`], the `kind -> key -> value` table the
//! rule engine evaluates conditions against. Writes report whether they
//! changed anything and hand back a deep copy of the table as it was before
//! the write, so the caller can compare current and previous values.

use indexmap::IndexMap;
use rb_core::{StateAddress, Value};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

/// Outcome of a [`GlobalState::update`]
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    /// The stored value already equalled the new one; nothing happened
    Unchanged,
    /// The value was written; `previous` is the table before the write
    Changed { previous: GlobalState },
}

impl StateChange {
    pub fn is_changed(&self) -> bool {
        matches!(self, StateChange::Changed { .. })
    }
}

/// The state table
///
/// Kinds and keys keep their insertion order so dumps are stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalState {
    kinds: IndexMap<String, IndexMap<String, Value>>,
}

impl GlobalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the stored value of a slot
    pub fn get(&self, kind: &str, key: &str) -> Option<&Value> {
        self.kinds.get(kind).and_then(|entries| entries.get(key))
    }

    /// Get a slot, falling back to the neutral value of `like`'s type
    ///
    /// Returns `None` only when the slot is absent and no type hint is given.
    pub fn get_or_default(&self, kind: &str, key: &str, like: Option<&Value>) -> Option<Value> {
        match self.get(kind, key) {
            Some(value) => Some(value.clone()),
            None => like.map(Value::default_like),
        }
    }

    pub fn get_address(&self, address: &StateAddress) -> Option<&Value> {
        self.get(&address.kind, &address.key)
    }

    /// Write a slot unconditionally, without change tracking
    ///
    /// Used to seed the table (input mirroring, optimizer scratch state).
    pub fn insert(&mut self, kind: impl Into<String>, key: impl Into<String>, value: Value) {
        self.kinds
            .entry(kind.into())
            .or_default()
            .insert(key.into(), value);
    }

    /// Write a slot, snapshotting the table first if the value changes
    ///
    /// Writing the value a slot already holds is a no-op.
    #[instrument(skip(self, value), fields(value = %value))]
    pub fn update(&mut self, kind: &str, key: &str, value: Value) -> StateChange {
        if self.get(kind, key) == Some(&value) {
            trace!("Value unchanged");
            return StateChange::Unchanged;
        }

        let previous = self.clone();
        debug!(
            old = ?previous.get(kind, key),
            "Setting device state"
        );
        self.insert(kind, key, value);

        StateChange::Changed { previous }
    }

    /// All slots of one kind
    pub fn entries(&self, kind: &str) -> Option<&IndexMap<String, Value>> {
        self.kinds.get(kind)
    }

    /// All kinds present in the table
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }

    /// Iterate every `(kind, key, value)` triple
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.kinds.iter().flat_map(|(kind, entries)| {
            entries
                .iter()
                .map(move |(key, value)| (kind.as_str(), key.as_str(), value))
        })
    }

    /// Number of slots across all kinds
    pub fn len(&self) -> usize {
        self.kinds.values().map(IndexMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.kinds.clear();
    }

    /// The table as a JSON object of objects
    pub fn to_json(&self) -> serde_json::Map<String, serde_json::Value> {
        self.kinds
            .iter()
            .map(|(kind, entries)| {
                let object = entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect::<serde_json::Map<_, _>>();
                (kind.clone(), serde_json::Value::Object(object))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_reports_change_and_snapshot() {
        let mut state = GlobalState::new();
        state.insert("lcd", "1", Value::from("hello"));

        let change = state.update("mcp23017", "3", Value::Bool(true));
        match change {
            StateChange::Changed { previous } => {
                assert_eq!(previous.get("mcp23017", "3"), None);
                assert_eq!(previous.get("lcd", "1"), Some(&Value::from("hello")));
            }
            StateChange::Unchanged => panic!("expected a change"),
        }
        assert_eq!(state.get("mcp23017", "3"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_update_same_value_is_noop() {
        let mut state = GlobalState::new();
        assert!(state.update("a", "b", Value::Int(1)).is_changed());
        assert_eq!(state.update("a", "b", Value::Int(1)), StateChange::Unchanged);
        assert!(state.update("a", "b", Value::Int(2)).is_changed());
    }

    #[test]
    fn test_snapshot_is_independent() {
        let mut state = GlobalState::new();
        state.insert("a", "b", Value::Int(1));
        let StateChange::Changed { previous } = state.update("a", "b", Value::Int(2)) else {
            panic!("expected a change");
        };
        state.insert("a", "b", Value::Int(3));
        assert_eq!(previous.get("a", "b"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_get_or_default_uses_type_hint() {
        let state = GlobalState::new();
        assert_eq!(
            state.get_or_default("x", "y", Some(&Value::Bool(true))),
            Some(Value::Bool(false))
        );
        assert_eq!(state.get_or_default("x", "y", None), None);
    }

    #[test]
    fn test_to_json_nests_by_kind() {
        let mut state = GlobalState::new();
        state.insert("bluetooth", "connected", Value::Bool(true));
        state.insert("mcp23017", "0", Value::Bool(false));

        let json = serde_json::Value::Object(state.to_json());
        assert_eq!(
            json,
            serde_json::json!({
                "bluetooth": {"connected": true},
                "mcp23017": {"0": false},
            })
        );
        assert_eq!(state.len(), 2);
        assert_eq!(state.iter().count(), 2);
    }
}
