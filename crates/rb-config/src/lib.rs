//! Rule document loading for rulebot
//!
//! This crate turns a YAML rule file into the [`RuleSet`] the engine runs:
//!
//! - [`loader`]: multi-document YAML with `!env_var` tags, and the
//!   `.optimized` cache keyed by source modification time
//! - [`resolve`]: device-name resolution, state validation and template
//!   precompilation
//! - [`optimize`]: expansion of templated conditions over the value
//!   domains of their expressions
//!
//! # Document layout
//!
//! ```yaml
//! devices:
//!   button: {kind: mcp23017, key: 3}
//!   display: {kind: lcd}
//! vars:
//!   greeting: Hello
//! initial_state: idle
//! states:
//!   - name: idle
//!     conditions:
//!       - expressions: [enter]
//!         actions:
//!           - {name: display, key: 0, value: "{{ greeting }}", eval: true}
//!       - expressions:
//!           - {name: button, value: true}
//!         actions:
//!           - {kind: GOTO, key: busy, value: 500}
//!   - name: busy
//! ```

pub mod document;
mod error;
pub mod loader;
pub mod optimize;
pub mod resolve;
mod rules;

pub use document::RuleDocument;
pub use error::{ConfigError, ConfigResult};
pub use loader::{parse_documents, LoadOptions, LoadedRules, RuleLoader, CACHE_SUFFIX};
pub use optimize::{optimize, OptimizeStats, DEFAULT_MAX_COMBINATIONS};
pub use resolve::{compile_templates, resolve, resolve_item};
pub use rules::{
    environment, Condition, Device, DeviceRef, Expression, RuleSet, StateRules,
    DEFAULT_BINARY_KINDS,
};

/// Parse and resolve rule text without touching the filesystem
///
/// Convenience for tests and embedding; no optimization is applied.
pub fn load_str(content: &str) -> ConfigResult<LoadedRules> {
    let document = parse_documents(content, std::path::Path::new("<memory>"))?;
    let mut templates = rb_template::TemplateCache::new();
    let rules = resolve(document, &mut templates)?;
    Ok(LoadedRules {
        rules,
        templates,
        source_modified: None,
        from_cache: false,
    })
}
