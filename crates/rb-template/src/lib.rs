//! Jinja2-compatible templates for rule values
//!
//! Each template is compiled once into its own `minijinja` environment with
//! strict undefined handling, so a misspelled name is an error rather than
//! an empty string. Templates render against an [`Environment`], a JSON
//! object mapping top-level names to values.
//!
//! On top of the minijinja builtins, `int`, `float` and `bool` are lenient
//! and fall back to a default. `none` renders as an empty string.
//!
//! # Example
//!
//! ```
//! use rb_template::{Environment, Template};
//!
//! let template = Template::compile("speed={{ motor.speed * 2 }}").unwrap();
//! let mut env = Environment::new();
//! env.insert("motor".into(), serde_json::json!({"speed": 3}));
//! assert_eq!(template.render(&env).unwrap(), "speed=6");
//! ```

mod cache;
mod error;
mod filters;

pub use cache::TemplateCache;
pub use error::{TemplateError, TemplateResult};

use minijinja::UndefinedBehavior;
use std::fmt;

/// Variables visible to a template
pub type Environment = serde_json::Map<String, serde_json::Value>;

const TEMPLATE_NAME: &str = "rule";

/// A top-level name a template reads, with the first attribute applied to it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    pub root: String,
    pub key: ReferenceKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReferenceKey {
    /// The name is used as a whole, or through a subscript
    Whole,
    /// `root.key`
    Static(String),
}

impl Reference {
    /// Parse a dotted lookup path such as `motor.speed`
    fn from_path(path: &str) -> Self {
        let mut parts = path.split('.');
        let root = parts.next().unwrap_or_default().to_string();
        let key = match parts.next() {
            Some(key) => ReferenceKey::Static(key.to_string()),
            None => ReferenceKey::Whole,
        };
        Self { root, key }
    }
}

fn environment() -> minijinja::Environment<'static> {
    let mut env = minijinja::Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_formatter(|out, state, value| {
        if value.is_none() {
            Ok(())
        } else {
            minijinja::escape_formatter(out, state, value)
        }
    });

    // Type conversion
    env.add_filter("int", filters::to_int);
    env.add_filter("float", filters::to_float);
    env.add_filter("bool", filters::to_bool);

    env
}

/// A compiled template
pub struct Template {
    source: String,
    env: minijinja::Environment<'static>,
    references: Vec<Reference>,
}

impl Template {
    /// Compile template source
    pub fn compile(source: &str) -> TemplateResult<Self> {
        let mut env = environment();
        env.add_template_owned(TEMPLATE_NAME, source.to_string())?;

        let mut references: Vec<Reference> = env
            .get_template(TEMPLATE_NAME)?
            .undeclared_variables(true)
            .iter()
            .map(|path| Reference::from_path(path))
            .collect();
        references.sort();
        references.dedup();

        Ok(Self {
            source: source.to_string(),
            env,
            references,
        })
    }

    /// The source text this template was compiled from
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Render against an environment
    pub fn render(&self, env: &Environment) -> TemplateResult<String> {
        let template = self.env.get_template(TEMPLATE_NAME)?;
        Ok(template.render(env)?)
    }

    /// Every top-level name the template reads that it does not set itself
    pub fn references(&self) -> &[Reference] {
        &self.references
    }
}

impl fmt::Debug for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Template")
            .field("source", &self.source)
            .field("references", &self.references)
            .finish()
    }
}

/// Check if a string contains template syntax
pub fn is_template(text: &str) -> bool {
    text.contains("{{") || text.contains("{%") || text.contains("{#")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env(value: serde_json::Value) -> Environment {
        match value {
            serde_json::Value::Object(map) => map,
            _ => Environment::new(),
        }
    }

    #[test]
    fn test_simple_render() {
        let template = Template::compile("Hello, {{ name }}!").unwrap();
        let rendered = template.render(&env(json!({"name": "World"}))).unwrap();
        assert_eq!(rendered, "Hello, World!");
    }

    #[test]
    fn test_plain_text() {
        let template = Template::compile("a { b } c").unwrap();
        assert!(template.references().is_empty());
        assert_eq!(template.render(&Environment::new()).unwrap(), "a { b } c");
    }

    #[test]
    fn test_statement_blocks() {
        let template = Template::compile("{% if button %}ON{% else %}OFF{% endif %}").unwrap();
        assert_eq!(template.render(&env(json!({"button": true}))).unwrap(), "ON");
        assert_eq!(template.render(&env(json!({"button": false}))).unwrap(), "OFF");

        let template = Template::compile("{% for line in lines %}{{ line }};{% endfor %}").unwrap();
        let rendered = template.render(&env(json!({"lines": ["a", "b"]}))).unwrap();
        assert_eq!(rendered, "a;b;");
    }

    #[test]
    fn test_syntax_error() {
        assert!(matches!(
            Template::compile("{{ x "),
            Err(TemplateError::Syntax { .. })
        ));
        assert!(matches!(
            Template::compile("{% if x %}y"),
            Err(TemplateError::Syntax { .. })
        ));
    }

    #[test]
    fn test_undefined_variable() {
        let template = Template::compile("{{ bogus_var }}").unwrap();
        assert!(matches!(
            template.render(&Environment::new()),
            Err(TemplateError::UndefinedVariable { .. })
        ));
    }

    #[test]
    fn test_null_renders_empty() {
        let template = Template::compile("[{{ nothing }}]").unwrap();
        assert_eq!(template.render(&env(json!({"nothing": null}))).unwrap(), "[]");
    }

    #[test]
    fn test_lenient_filters() {
        let template = Template::compile("{{ level | int + 1 }}/{{ 'on' | bool }}").unwrap();
        let rendered = template.render(&env(json!({"level": "41"}))).unwrap();
        assert_eq!(rendered, "42/true");
    }

    #[test]
    fn test_references() {
        let template = Template::compile(
            "{{ 'on' if button else level }}{{ motor.speed }}{% set local = 1 %}{{ local }}",
        )
        .unwrap();
        assert_eq!(
            template.references(),
            &[
                Reference {
                    root: "button".into(),
                    key: ReferenceKey::Whole
                },
                Reference {
                    root: "level".into(),
                    key: ReferenceKey::Whole
                },
                Reference {
                    root: "motor".into(),
                    key: ReferenceKey::Static("speed".into())
                },
            ]
        );
    }

    #[test]
    fn test_is_template() {
        assert!(is_template("{{ x }}"));
        assert!(is_template("{% if %}"));
        assert!(!is_template("plain"));
    }
}
