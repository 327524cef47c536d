//! Resolution of a rule document into a [`RuleSet`]

use crate::document::{ConditionDef, DeviceDef, ExpressionDef, ItemDef, RuleDocument};
use crate::error::{ConfigError, ConfigResult};
use crate::rules::{
    Condition, Device, DeviceRef, Expression, RuleSet, StateRules, DEFAULT_BINARY_KINDS,
};
use indexmap::IndexMap;
use rb_core::kinds;
use rb_template::TemplateCache;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Resolve device names, validate states and precompile templates
///
/// Items that name an unknown device are dropped with a warning; a condition
/// that loses an expression this way is marked as never firing. Templates
/// that fail to compile are left in place; they fall back to their raw text
/// when evaluated.
pub fn resolve(document: RuleDocument, templates: &mut TemplateCache) -> ConfigResult<RuleSet> {
    let devices: IndexMap<String, Device> = document
        .devices
        .into_iter()
        .map(|(name, def)| (name, resolve_device(def)))
        .collect();

    if document.states.is_empty() {
        return Err(ConfigError::NoStates);
    }

    let mut seen = HashSet::new();
    let mut states = Vec::with_capacity(document.states.len());
    for state in document.states {
        if !seen.insert(state.name.clone()) {
            return Err(ConfigError::DuplicateState { name: state.name });
        }
        let conditions = state
            .conditions
            .into_iter()
            .map(|condition| resolve_condition(&state.name, condition, &devices))
            .collect();
        states.push(StateRules {
            name: state.name,
            conditions,
        });
    }

    let initial_state = match document.initial_state {
        Some(name) if seen.contains(&name) => name,
        Some(name) => return Err(ConfigError::UnknownState { name }),
        None => states[0].name.clone(),
    };

    let binary_kinds = document
        .binary_kinds
        .unwrap_or_else(|| DEFAULT_BINARY_KINDS.iter().map(|k| k.to_string()).collect());

    let rules = RuleSet {
        devices,
        vars: document.vars,
        initial_state,
        binary_kinds,
        states,
        optimized: false,
    };

    check_transition_targets(&rules);
    compile_templates(&rules, templates);

    Ok(rules)
}

/// Compile every evaluated item's template into the cache
pub fn compile_templates(rules: &RuleSet, templates: &mut TemplateCache) {
    for source in rules.template_sources() {
        if let Err(err) = templates.get_or_compile(&source) {
            warn!(template = %source, error = %err, "Template does not compile, it will render as plain text");
        }
    }
    debug!(count = templates.len(), "Templates compiled");
}

fn resolve_device(def: DeviceDef) -> Device {
    Device {
        kind: def.kind,
        key: def.key.map(|key| key.to_string()),
        values: def.values,
    }
}

fn resolve_condition(
    state: &str,
    condition: ConditionDef,
    devices: &IndexMap<String, Device>,
) -> Condition {
    let mut unresolved = false;
    let mut expressions = Vec::with_capacity(condition.expressions.len());
    for expression in condition.expressions {
        match expression {
            ExpressionDef::Literal(literal) => expressions.push(Expression::Literal(literal)),
            ExpressionDef::Item(item) => match resolve_item(state, item, devices) {
                Some(item) => expressions.push(Expression::Device(item)),
                // A slot that cannot be read never matches
                None => unresolved = true,
            },
        }
    }

    let actions = condition
        .actions
        .into_iter()
        .filter_map(|item| resolve_item(state, item, devices))
        .collect();

    Condition {
        only: condition.only,
        expressions,
        actions,
        unresolved,
    }
}

/// Resolve `name` through the device table; explicit `kind`/`key` win
pub fn resolve_item(
    state: &str,
    item: ItemDef,
    devices: &IndexMap<String, Device>,
) -> Option<DeviceRef> {
    let device = item.name.as_ref().and_then(|name| devices.get(name));

    if let (Some(name), None, None) = (&item.name, device, &item.kind) {
        warn!(state, device = %name, "Unknown device, dropping item");
        return None;
    }

    let Some(kind) = item.kind.or_else(|| device.map(|d| d.kind.clone())) else {
        warn!(state, "Item has neither kind nor device name, dropping it");
        return None;
    };
    let key = item
        .key
        .map(|key| key.to_string())
        .or_else(|| device.and_then(|d| d.key.clone()));

    Some(DeviceRef {
        kind,
        key,
        name: item.name,
        value: item.value,
        eval: item.eval,
        only: item.only,
    })
}

fn check_transition_targets(rules: &RuleSet) {
    for state in &rules.states {
        for action in state.conditions.iter().flat_map(|c| &c.actions) {
            if !kinds::is_transition(&action.kind) || action.eval {
                continue;
            }
            match action.key.as_deref() {
                Some(target) if rules.has_state(target) => {}
                target => warn!(
                    state = %state.name,
                    target = ?target,
                    "Transition targets an undeclared state"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rb_core::{Gate, Value};

    fn parse(yaml: &str) -> RuleDocument {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_resolve_names_and_keys() {
        let document = parse(
            r#"
devices:
  button: {kind: mcp23017, key: 3}
  display: {kind: lcd}
vars:
  greeting: hello
states:
  - name: idle
    conditions:
      - expressions:
          - name: button
            value: true
        actions:
          - name: display
            key: 1
            value: "{{ greeting }}"
            eval: true
"#,
        );
        let mut templates = TemplateCache::new();
        let rules = resolve(document, &mut templates).unwrap();

        assert_eq!(rules.initial_state, "idle");
        assert_eq!(rules.binary_kinds, vec!["mcp23017".to_string()]);

        let condition = &rules.states[0].conditions[0];
        let Expression::Device(expression) = &condition.expressions[0] else {
            panic!("expected a device expression");
        };
        assert_eq!(expression.kind, "mcp23017");
        assert_eq!(expression.key.as_deref(), Some("3"));
        assert_eq!(expression.value, Some(Value::Bool(true)));

        assert_eq!(condition.actions[0].kind, "lcd");
        assert_eq!(condition.actions[0].key.as_deref(), Some("1"));
        assert!(templates.contains("{{ greeting }}"));
    }

    #[test]
    fn test_unknown_device_is_dropped() {
        let document = parse(
            r#"
states:
  - name: idle
    conditions:
      - expressions: [enter]
        actions:
          - name: ghost
            value: 1
          - kind: lcd
            key: 0
            value: hi
"#,
        );
        let rules = resolve(document, &mut TemplateCache::new()).unwrap();
        let condition = &rules.states[0].conditions[0];
        assert_eq!(condition.expressions, vec![Expression::Literal("enter".into())]);
        assert_eq!(condition.actions.len(), 1);
        assert_eq!(condition.actions[0].kind, "lcd");
        assert!(!condition.unresolved);
    }

    #[test]
    fn test_unknown_expression_device_marks_condition() {
        let document = parse(
            r#"
devices:
  button: {kind: mcp23017, key: 0}
states:
  - name: idle
    conditions:
      - expressions: [{name: ghost, value: true}, {name: button}]
        actions: [{kind: lcd, key: 0, value: hi}]
"#,
        );
        let rules = resolve(document, &mut TemplateCache::new()).unwrap();
        let condition = &rules.states[0].conditions[0];
        assert!(condition.unresolved);
        assert_eq!(condition.expressions.len(), 1);
        assert_eq!(condition.actions.len(), 1);
    }

    #[test]
    fn test_state_validation() {
        assert!(matches!(
            resolve(parse("states: []"), &mut TemplateCache::new()),
            Err(ConfigError::NoStates)
        ));
        assert!(matches!(
            resolve(
                parse("states: [{name: a}, {name: a}]"),
                &mut TemplateCache::new()
            ),
            Err(ConfigError::DuplicateState { .. })
        ));
        assert!(matches!(
            resolve(
                parse("initial_state: b\nstates: [{name: a}]"),
                &mut TemplateCache::new()
            ),
            Err(ConfigError::UnknownState { .. })
        ));
    }

    #[test]
    fn test_explicit_initial_state_and_gates() {
        let document = parse(
            r#"
initial_state: running
states:
  - name: idle
  - name: running
    conditions:
      - only: normal
        actions:
          - {kind: GOTO, key: idle, value: 500, only: normal}
"#,
        );
        let rules = resolve(document, &mut TemplateCache::new()).unwrap();
        assert_eq!(rules.initial_state, "running");
        let condition = &rules.state("running").unwrap().conditions[0];
        assert_eq!(condition.only, Some(Gate::Normal));
        assert_eq!(condition.actions[0].value, Some(Value::Int(500)));
    }
}
