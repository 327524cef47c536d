//! Rule document as written by users
//!
//! These types mirror the YAML file one to one. Items may address a device
//! either directly (`kind`/`key`) or by `name` through the `devices` table;
//! [`crate::resolve`] turns them into the resolved [`crate::RuleSet`].

use indexmap::IndexMap;
use rb_core::{Gate, Value};
use serde::Deserialize;

/// One YAML document of a rule file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleDocument {
    #[serde(default)]
    pub devices: IndexMap<String, DeviceDef>,
    #[serde(default)]
    pub vars: IndexMap<String, Value>,
    #[serde(default)]
    pub initial_state: Option<String>,
    /// Kinds whose slots only hold booleans; defaults to the bit expander
    #[serde(default)]
    pub binary_kinds: Option<Vec<String>>,
    #[serde(default)]
    pub states: Vec<StateDef>,
}

impl RuleDocument {
    /// Fold a later document into this one
    ///
    /// Devices and vars are merged by name, `initial_state` and
    /// `binary_kinds` are replaced when given, states are appended.
    pub fn merge(&mut self, other: RuleDocument) {
        self.devices.extend(other.devices);
        self.vars.extend(other.vars);
        if other.initial_state.is_some() {
            self.initial_state = other.initial_state;
        }
        if other.binary_kinds.is_some() {
            self.binary_kinds = other.binary_kinds;
        }
        self.states.extend(other.states);
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceDef {
    pub kind: String,
    #[serde(default)]
    pub key: Option<Value>,
    #[serde(default)]
    pub values: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateDef {
    pub name: String,
    #[serde(default)]
    pub conditions: Vec<ConditionDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConditionDef {
    #[serde(default)]
    pub only: Option<Gate>,
    #[serde(default)]
    pub expressions: Vec<ExpressionDef>,
    #[serde(default)]
    pub actions: Vec<ItemDef>,
}

/// An expression is either a bare gate name or a device item
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ExpressionDef {
    Literal(String),
    Item(ItemDef),
}

/// An expression or action entry
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemDef {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub key: Option<Value>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub eval: bool,
    #[serde(default)]
    pub only: Option<Gate>,
}
