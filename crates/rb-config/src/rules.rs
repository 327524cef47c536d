//! Resolved rule set
//!
//! Every item here carries a concrete `kind`; device names have already been
//! looked up. The same types are persisted as the optimized cache.

use indexmap::IndexMap;
use rb_core::{Gate, StateAddress, Value};
use rb_state_store::GlobalState;
use rb_template::Environment;
use serde::{Deserialize, Serialize};

/// Kinds treated as boolean when no explicit domain is declared
pub const DEFAULT_BINARY_KINDS: &[&str] = &[rb_core::kinds::BITS];

fn is_false(value: &bool) -> bool {
    !*value
}

/// A named device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<Value>>,
}

impl Device {
    /// Key of the device's state slot; keyless devices use their kind
    pub fn state_key(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.kind)
    }

    pub fn address(&self) -> StateAddress {
        StateAddress::new(&self.kind, self.state_key())
    }
}

/// A resolved expression or action item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRef {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Device name the item was written with, kept for diagnostics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub eval: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only: Option<Gate>,
}

impl DeviceRef {
    pub fn new(kind: impl Into<String>, key: Option<&str>) -> Self {
        Self {
            kind: kind.into(),
            key: key.map(str::to_string),
            name: None,
            value: None,
            eval: false,
            only: None,
        }
    }

    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn evaluated(mut self) -> Self {
        self.eval = true;
        self
    }

    /// Key of the referenced state slot; keyless items use their kind
    pub fn state_key(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.kind)
    }

    pub fn address(&self) -> StateAddress {
        StateAddress::new(&self.kind, self.state_key())
    }

    /// Template text of an evaluated item
    pub fn template_source(&self) -> Option<String> {
        match &self.value {
            Some(value) if self.eval => Some(value.to_string()),
            _ => None,
        }
    }
}

/// A condition term
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expression {
    /// Bare gate name, true only while that gate is evaluated
    Literal(String),
    Device(DeviceRef),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only: Option<Gate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expressions: Vec<Expression>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<DeviceRef>,
    /// An expression named an unknown device; the condition never fires
    #[serde(default, skip_serializing_if = "is_false")]
    pub unresolved: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRules {
    pub name: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// The compiled rule table the engine runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub devices: IndexMap<String, Device>,
    #[serde(default)]
    pub vars: IndexMap<String, Value>,
    pub initial_state: String,
    #[serde(default)]
    pub binary_kinds: Vec<String>,
    pub states: Vec<StateRules>,
    /// Set once templated conditions have been expanded
    #[serde(default)]
    pub optimized: bool,
}

impl RuleSet {
    pub fn state(&self, name: &str) -> Option<&StateRules> {
        self.states.iter().find(|state| state.name == name)
    }

    pub fn has_state(&self, name: &str) -> bool {
        self.state(name).is_some()
    }

    pub fn device(&self, name: &str) -> Option<&Device> {
        self.devices.get(name)
    }

    /// Find a declared device by its state slot
    pub fn device_at(&self, kind: &str, key: &str) -> Option<&Device> {
        self.devices
            .values()
            .find(|device| device.kind == kind && device.state_key() == key)
    }

    pub fn is_binary_kind(&self, kind: &str) -> bool {
        self.binary_kinds.iter().any(|k| k == kind)
    }

    /// Template environment: vars, then state kinds, then device names
    pub fn environment(&self, state: &GlobalState) -> Environment {
        environment(&self.devices, &self.vars, state)
    }

    /// Every evaluated item's template text
    pub fn template_sources(&self) -> impl Iterator<Item = String> + '_ {
        self.states
            .iter()
            .flat_map(|state| &state.conditions)
            .flat_map(|condition| {
                let expressions = condition.expressions.iter().filter_map(|e| match e {
                    Expression::Device(item) => Some(item),
                    Expression::Literal(_) => None,
                });
                expressions.chain(condition.actions.iter())
            })
            .filter_map(DeviceRef::template_source)
    }

    /// JSON description of the tables, as sent to peers on request
    pub fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "devices": self.devices,
            "vars": self.vars,
            "states": self.states,
        })
    }
}

/// Build a template environment
///
/// Later layers shadow earlier ones: static vars, then one object per state
/// kind, then each device name bound to its current value (null if unset).
pub fn environment(
    devices: &IndexMap<String, Device>,
    vars: &IndexMap<String, Value>,
    state: &GlobalState,
) -> Environment {
    let mut env: Environment = vars
        .iter()
        .map(|(name, value)| (name.clone(), value.to_json()))
        .collect();
    env.extend(state.to_json());
    for (name, device) in devices {
        let current = state
            .get(&device.kind, device.state_key())
            .map_or(serde_json::Value::Null, Value::to_json);
        env.insert(name.clone(), current);
    }
    env
}
