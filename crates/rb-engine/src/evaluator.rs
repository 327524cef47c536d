//! Value resolution and condition checks

use rb_config::{Condition, DeviceRef, Expression, RuleSet};
use rb_core::{parse_literal, Gate, Value};
use rb_state_store::GlobalState;
use rb_template::{Environment, TemplateCache};
use tracing::{trace, warn};

/// Resolves item values against the current state
///
/// The template environment is built on first use and reused for the
/// lifetime of the resolver, so create one per evaluation pass.
pub struct ValueResolver<'a> {
    rules: &'a RuleSet,
    state: &'a GlobalState,
    templates: &'a mut TemplateCache,
    env: Option<Environment>,
}

impl<'a> ValueResolver<'a> {
    pub fn new(rules: &'a RuleSet, state: &'a GlobalState, templates: &'a mut TemplateCache) -> Self {
        Self {
            rules,
            state,
            templates,
            env: None,
        }
    }

    /// The value an item stands for
    ///
    /// Plain values are returned as written. Evaluated values are rendered
    /// and parsed as literals; a template that fails falls back to its raw
    /// text. Either way a string naming a var is replaced by that var's
    /// value, one level deep.
    pub fn resolve(&mut self, item: &DeviceRef) -> Option<Value> {
        let value = if item.eval {
            self.render(item)
        } else {
            item.value.clone()
        };
        value.map(|value| self.indirect(value))
    }

    /// The template environment for the current state
    pub fn environment(&mut self) -> &Environment {
        let (rules, state) = (self.rules, self.state);
        self.env.get_or_insert_with(|| rules.environment(state))
    }

    fn render(&mut self, item: &DeviceRef) -> Option<Value> {
        let source = item.template_source()?;

        let template = match self.templates.get_or_compile(&source) {
            Ok(template) => template,
            Err(err) => {
                warn!(kind = %item.kind, template = %source, error = %err, "Template does not compile, using raw text");
                return Some(Value::Str(source));
            }
        };

        match template.render(self.environment()) {
            Ok(text) => {
                trace!(template = %source, rendered = %text, "Rendered");
                Some(parse_literal(&text))
            }
            Err(err) => {
                warn!(kind = %item.kind, template = %source, error = %err, "Template render failed, using raw text");
                Some(Value::Str(source))
            }
        }
    }

    fn indirect(&self, value: Value) -> Value {
        if let Value::Str(name) = &value {
            if let Some(var) = self.rules.vars.get(name) {
                return var.clone();
            }
        }
        value
    }
}

/// Whether a condition fires for a gate
///
/// A condition without expressions fires only on ENTER. Otherwise every
/// expression must hold (`result`) and at least one must report a change
/// (`changed`): a gate literal always counts as changed, a device slot
/// counts when its text differs from the snapshot or the gate is not
/// NORMAL. Device expressions are not checked on ENTER. A condition that
/// lost an expression to an unknown device never fires.
pub fn condition_fires(
    condition: &Condition,
    gate: Gate,
    resolver: &mut ValueResolver<'_>,
    state: &GlobalState,
    previous: Option<&GlobalState>,
) -> bool {
    if condition.unresolved {
        return false;
    }
    if condition.expressions.is_empty() {
        return gate == Gate::Enter;
    }

    let mut result = true;
    let mut changed = false;

    for expression in &condition.expressions {
        match expression {
            Expression::Literal(literal) => {
                result &= gate.matches_literal(literal);
                changed = true;
            }
            Expression::Device(item) => {
                if gate == Gate::Enter || !gate.allowed_by(item.only) {
                    continue;
                }

                let expected = match item.value {
                    Some(_) => resolver.resolve(item),
                    None => None,
                };
                let key = item.state_key();
                let current = state
                    .get_or_default(&item.kind, key, expected.as_ref())
                    .map(|v| v.to_string());
                let before = previous
                    .and_then(|p| p.get_or_default(&item.kind, key, expected.as_ref()))
                    .map(|v| v.to_string());

                if let Some(expected) = &expected {
                    result &= current.as_deref() == Some(expected.to_string().as_str());
                }
                changed |= current != before || gate != Gate::Normal;
            }
        }
    }

    result && changed
}
