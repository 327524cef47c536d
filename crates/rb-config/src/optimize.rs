//! Build-time expansion of templated conditions
//!
//! A condition whose actions are templates is replaced by one concrete
//! condition per combination of the values its expressions can take. Each
//! copy pins its expressions to one combination and carries the actions
//! pre-rendered for it, so nothing is rendered at runtime.
//!
//! Only conditions whose outcome is fully determined by their own
//! expressions are expanded. Templates that read other state, or that
//! subscript a whole kind, are left for runtime rendering.

use crate::error::{ConfigError, ConfigResult};
use crate::rules::{environment, Condition, Device, DeviceRef, Expression, RuleSet};
use indexmap::IndexMap;
use rb_core::{parse_literal, Gate, StateAddress, Value};
use rb_state_store::GlobalState;
use rb_template::{Reference, ReferenceKey, TemplateCache};
use tracing::{debug, info};

/// Default cap on combinations generated for a single condition
pub const DEFAULT_MAX_COMBINATIONS: usize = 4096;

/// Counters reported by [`optimize`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizeStats {
    /// Conditions replaced by their expansion
    pub expanded: usize,
    /// Conditions generated by the expansion
    pub generated: usize,
    /// Templated conditions left as they were
    pub kept: usize,
}

/// One expression slot and the values it can take
#[derive(Debug, Clone)]
struct Slot {
    address: StateAddress,
    domain: Vec<Value>,
}

/// Expand every eligible condition of the rule set in place
pub fn optimize(
    rules: &mut RuleSet,
    templates: &mut TemplateCache,
    max_combinations: usize,
) -> ConfigResult<OptimizeStats> {
    let RuleSet {
        devices,
        vars,
        binary_kinds,
        states,
        optimized,
        ..
    } = rules;
    let mut stats = OptimizeStats::default();

    // Slots some expression compares against a boolean are binary too
    let boolean_slots: Vec<StateAddress> = states
        .iter()
        .flat_map(|state| state.conditions.iter())
        .flat_map(|condition| condition.expressions.iter())
        .filter_map(|expression| match expression {
            Expression::Device(item) if matches!(item.value, Some(Value::Bool(_))) => {
                Some(item.address())
            }
            _ => None,
        })
        .collect();

    for state in states.iter_mut() {
        let original = std::mem::take(&mut state.conditions);
        let mut conditions = Vec::with_capacity(original.len());

        for (index, condition) in original.into_iter().enumerate() {
            if !condition.actions.iter().any(|action| action.eval) {
                conditions.push(condition);
                continue;
            }

            let planned = plan(
                &condition,
                devices,
                vars,
                binary_kinds,
                &boolean_slots,
                templates,
            );
            let Some(slots) = planned else {
                debug!(state = %state.name, condition = index, "Keeping templated condition");
                stats.kept += 1;
                conditions.push(condition);
                continue;
            };

            let combinations = slots
                .iter()
                .fold(1u128, |acc, slot| acc.saturating_mul(slot.domain.len() as u128));
            if combinations > max_combinations as u128 {
                return Err(ConfigError::DomainOverflow {
                    state: state.name.clone(),
                    condition: index,
                    combinations,
                    limit: max_combinations,
                });
            }

            let expansion = expand(&condition, &slots, devices, vars, templates);
            debug!(
                state = %state.name,
                condition = index,
                generated = expansion.len(),
                "Expanded templated condition"
            );
            stats.expanded += 1;
            stats.generated += expansion.len();
            conditions.extend(expansion);
        }

        state.conditions = conditions;
    }

    *optimized = true;
    info!(
        expanded = stats.expanded,
        generated = stats.generated,
        kept = stats.kept,
        "Rules optimized"
    );
    Ok(stats)
}

/// Work out the slots of an expandable condition, or `None` if it must stay templated
fn plan(
    condition: &Condition,
    devices: &IndexMap<String, Device>,
    vars: &IndexMap<String, Value>,
    binary_kinds: &[String],
    boolean_slots: &[StateAddress],
    templates: &mut TemplateCache,
) -> Option<Vec<Slot>> {
    // Conditions that fire on ENTER see the state left by the previous state
    if condition.unresolved
        || condition.only == Some(Gate::Enter)
        || condition.expressions.is_empty()
    {
        return None;
    }

    let mut slots: Vec<Slot> = Vec::new();
    for expression in &condition.expressions {
        let item = match expression {
            Expression::Literal(literal) if Gate::Enter.matches_literal(literal) => return None,
            Expression::Literal(_) => continue,
            Expression::Device(item) => item,
        };
        if item.eval || item.only.is_some() {
            return None;
        }

        let address = item.address();
        if slots.iter().any(|slot| slot.address == address) {
            return None;
        }

        let domain = match &item.value {
            Some(value) => vec![value.clone()],
            None => domain_of(item, devices, binary_kinds, boolean_slots)?,
        };
        if domain.is_empty() {
            return None;
        }
        slots.push(Slot { address, domain });
    }

    if slots.is_empty() {
        return None;
    }

    for action in condition.actions.iter().filter(|action| action.eval) {
        let source = action.template_source()?;
        let template = templates.get_or_compile(&source).ok()?;
        let pinned = template
            .references()
            .iter()
            .all(|reference| is_pinned(reference, &slots, devices, vars));
        if !pinned {
            return None;
        }
    }

    Some(slots)
}

fn domain_of(
    item: &DeviceRef,
    devices: &IndexMap<String, Device>,
    binary_kinds: &[String],
    boolean_slots: &[StateAddress],
) -> Option<Vec<Value>> {
    let declared = devices
        .values()
        .find(|device| device.kind == item.kind && device.state_key() == item.state_key())
        .and_then(|device| device.values.clone());

    match declared {
        Some(values) => Some(values),
        None if binary_kinds.iter().any(|kind| *kind == item.kind)
            || boolean_slots.contains(&item.address()) =>
        {
            Some(vec![Value::Bool(false), Value::Bool(true)])
        }
        None => None,
    }
}

/// Whether a template reference only reads pinned slots or static vars
///
/// Mirrors the environment layering: device names shadow state kinds, which
/// shadow vars.
fn is_pinned(
    reference: &Reference,
    slots: &[Slot],
    devices: &IndexMap<String, Device>,
    vars: &IndexMap<String, Value>,
) -> bool {
    let root = reference.root.as_str();

    if let Some(device) = devices.get(root) {
        let address = device.address();
        return slots.iter().any(|slot| slot.address == address);
    }

    if slots.iter().any(|slot| slot.address.kind == root) {
        return match &reference.key {
            ReferenceKey::Static(key) => slots
                .iter()
                .any(|slot| slot.address.kind == root && slot.address.key == *key),
            ReferenceKey::Whole => false,
        };
    }

    // A declared kind may hold state at runtime that the scratch table lacks
    let is_kind = devices.values().any(|device| device.kind == root);
    vars.contains_key(root) && !is_kind
}

fn expand(
    condition: &Condition,
    slots: &[Slot],
    devices: &IndexMap<String, Device>,
    vars: &IndexMap<String, Value>,
    templates: &mut TemplateCache,
) -> Vec<Condition> {
    let mut expansion = Vec::new();
    let mut odometer = vec![0usize; slots.len()];

    loop {
        let mut scratch = GlobalState::new();
        for (slot, &choice) in slots.iter().zip(&odometer) {
            scratch.insert(
                slot.address.kind.clone(),
                slot.address.key.clone(),
                slot.domain[choice].clone(),
            );
        }
        let env = environment(devices, vars, &scratch);

        let mut concrete = condition.clone();
        for expression in &mut concrete.expressions {
            if let Expression::Device(item) = expression {
                if item.value.is_none() {
                    item.value = scratch.get(&item.kind, item.state_key()).cloned();
                }
            }
        }
        for action in concrete.actions.iter_mut().filter(|action| action.eval) {
            let Some(source) = action.template_source() else {
                continue;
            };
            // Same fallback as runtime rendering: raw text on error
            let rendered = templates
                .get_or_compile(&source)
                .and_then(|template| template.render(&env))
                .map(|text| parse_literal(&text))
                .unwrap_or(Value::Str(source));
            action.value = Some(rendered);
            action.eval = false;
        }
        expansion.push(concrete);

        // Advance the odometer; the first slot varies fastest
        let mut position = 0;
        loop {
            if position == slots.len() {
                return expansion;
            }
            odometer[position] += 1;
            if odometer[position] < slots[position].domain.len() {
                break;
            }
            odometer[position] = 0;
            position += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::RuleDocument;
    use crate::resolve::resolve;

    fn rules(yaml: &str) -> (RuleSet, TemplateCache) {
        let document: RuleDocument = serde_yaml::from_str(yaml).unwrap();
        let mut templates = TemplateCache::new();
        let rules = resolve(document, &mut templates).unwrap();
        (rules, templates)
    }

    const TWO_BUTTONS: &str = r#"
devices:
  left: {kind: mcp23017, key: 0}
  right: {kind: mcp23017, key: 1}
  display: {kind: lcd}
vars:
  on_text: PRESSED
states:
  - name: idle
    conditions:
      - expressions:
          - name: left
          - name: right
        actions:
          - name: display
            key: 0
            value: "{{ (on_text if left else 'up') ~ '/' ~ (on_text if right else 'up') }}"
            eval: true
"#;

    #[test]
    fn test_expands_binary_cartesian_product() {
        let (mut rules, mut templates) = rules(TWO_BUTTONS);
        let stats = optimize(&mut rules, &mut templates, 16).unwrap();

        assert_eq!(
            stats,
            OptimizeStats {
                expanded: 1,
                generated: 4,
                kept: 0
            }
        );
        assert!(rules.optimized);

        let conditions = &rules.states[0].conditions;
        assert_eq!(conditions.len(), 4);
        let rendered: Vec<_> = conditions
            .iter()
            .map(|c| c.actions[0].value.clone().unwrap().to_string())
            .collect();
        assert_eq!(
            rendered,
            vec!["up/up", "PRESSED/up", "up/PRESSED", "PRESSED/PRESSED"]
        );
        assert!(conditions.iter().all(|c| !c.actions[0].eval));

        let Expression::Device(left) = &conditions[1].expressions[0] else {
            panic!("expected a device expression");
        };
        assert_eq!(left.value, Some(Value::Bool(true)));
    }

    #[test]
    fn test_domain_overflow_is_fatal() {
        let (mut rules, mut templates) = rules(TWO_BUTTONS);
        let err = optimize(&mut rules, &mut templates, 3).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::DomainOverflow {
                combinations: 4,
                limit: 3,
                ..
            }
        ));
    }

    #[test]
    fn test_declared_values_domain() {
        let (mut rules, mut templates) = rules(
            r#"
devices:
  mode: {kind: selector, key: mode, values: [eco, boost]}
states:
  - name: idle
    conditions:
      - expressions: [{name: mode}]
        actions:
          - {kind: lcd, key: 1, value: "{{ mode | upper }}", eval: true}
"#,
        );
        optimize(&mut rules, &mut templates, 16).unwrap();
        let values: Vec<_> = rules.states[0]
            .conditions
            .iter()
            .map(|c| c.actions[0].value.clone().unwrap())
            .collect();
        assert_eq!(values, vec![Value::from("ECO"), Value::from("BOOST")]);
    }

    #[test]
    fn test_boolean_comparison_makes_slot_binary() {
        let (mut rules, mut templates) = rules(
            r#"
devices:
  door: {kind: contact, key: door}
states:
  - name: idle
    conditions:
      - expressions: [{name: door, value: true}]
        actions: [{kind: GOTO, key: open}]
  - name: open
    conditions:
      - expressions: [{name: door}]
        actions:
          - {kind: lcd, key: 0, value: "{{ 'open' if door else 'shut' }}", eval: true}
"#,
        );
        let stats = optimize(&mut rules, &mut templates, 16).unwrap();
        assert_eq!(stats.generated, 2);
        let values: Vec<_> = rules.states[1]
            .conditions
            .iter()
            .map(|c| c.actions[0].value.clone().unwrap())
            .collect();
        assert_eq!(values, vec![Value::from("shut"), Value::from("open")]);
    }

    #[test]
    fn test_keeps_conditions_reading_other_state() {
        let (mut rules, mut templates) = rules(
            r#"
devices:
  left: {kind: mcp23017, key: 0}
  speed: {kind: motor, key: speed}
states:
  - name: idle
    conditions:
      - expressions: [{name: left}]
        actions:
          - {kind: lcd, key: 1, value: "{{ speed }}", eval: true}
      - expressions: [enter]
        actions:
          - {kind: lcd, key: 1, value: "{{ 1 + 1 }}", eval: true}
      - expressions: [{name: speed}]
        actions:
          - {kind: lcd, key: 1, value: "{{ speed }}", eval: true}
"#,
        );
        let before = rules.clone();
        let stats = optimize(&mut rules, &mut templates, 16).unwrap();
        assert_eq!(stats.kept, 3);
        assert_eq!(rules.states, before.states);
    }
}
