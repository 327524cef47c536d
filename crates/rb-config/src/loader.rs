//! Rule file loading with an optimized cache
//!
//! A rule file may hold several YAML documents; they are merged in order.
//! The `!env_var NAME [default]` tag substitutes an environment variable.
//!
//! When optimization is enabled the resolved and expanded rule set is
//! persisted next to the source as `<file>.optimized` and reused as long as
//! it is at least as recent as the source.

use crate::document::RuleDocument;
use crate::error::{ConfigError, ConfigResult};
use crate::optimize::{optimize, OptimizeStats, DEFAULT_MAX_COMBINATIONS};
use crate::resolve::{compile_templates, resolve};
use crate::rules::RuleSet;
use rb_template::TemplateCache;
use serde::Deserialize;
use serde_yaml::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, instrument, trace, warn};

/// Suffix appended to the source path for the optimized cache
pub const CACHE_SUFFIX: &str = ".optimized";

#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Expand templated conditions and persist the result
    pub optimize: bool,
    /// Cap on combinations per expanded condition
    pub max_combinations: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            optimize: true,
            max_combinations: DEFAULT_MAX_COMBINATIONS,
        }
    }
}

/// A rule set ready to run
#[derive(Debug, Clone)]
pub struct LoadedRules {
    pub rules: RuleSet,
    pub templates: TemplateCache,
    /// Modification time of the source when it was loaded
    pub source_modified: Option<SystemTime>,
    /// Whether the rules came from the optimized cache
    pub from_cache: bool,
}

impl LoadedRules {
    /// Wrap an in-memory rule set, compiling its templates
    pub fn from_rules(rules: RuleSet) -> Self {
        let mut templates = TemplateCache::new();
        compile_templates(&rules, &mut templates);
        Self {
            rules,
            templates,
            source_modified: None,
            from_cache: false,
        }
    }
}

/// Loads a rule file, going through the optimized cache when possible
#[derive(Debug, Clone)]
pub struct RuleLoader {
    path: PathBuf,
    options: LoadOptions,
}

impl RuleLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            options: LoadOptions::default(),
        }
    }

    pub fn with_options(mut self, options: LoadOptions) -> Self {
        self.options = options;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &LoadOptions {
        &self.options
    }

    /// Path of the optimized cache for this source
    pub fn cache_path(&self) -> PathBuf {
        let mut path = self.path.clone().into_os_string();
        path.push(CACHE_SUFFIX);
        PathBuf::from(path)
    }

    /// Current modification time of the source file
    pub fn source_modified(&self) -> ConfigResult<SystemTime> {
        modified(&self.path)
    }

    /// Load, resolve and (optionally) optimize the rule file
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn load(&self) -> ConfigResult<LoadedRules> {
        let source_modified = self.source_modified()?;

        if self.options.optimize {
            if let Some(rules) = self.read_cache(source_modified) {
                let mut templates = TemplateCache::new();
                compile_templates(&rules, &mut templates);
                info!(states = rules.states.len(), "Loaded optimized rules from cache");
                return Ok(LoadedRules {
                    rules,
                    templates,
                    source_modified: Some(source_modified),
                    from_cache: true,
                });
            }
        }

        let content = fs::read_to_string(&self.path).map_err(|e| ConfigError::ReadFile {
            path: self.path.clone(),
            source: e,
        })?;
        let document = parse_documents(&content, &self.path)?;

        let mut templates = TemplateCache::new();
        let mut rules = resolve(document, &mut templates)?;
        info!(
            states = rules.states.len(),
            devices = rules.devices.len(),
            initial_state = %rules.initial_state,
            "Rules loaded"
        );

        if self.options.optimize {
            let stats: OptimizeStats =
                optimize(&mut rules, &mut templates, self.options.max_combinations)?;
            if stats.expanded > 0 || stats.kept > 0 {
                debug!(?stats, "Optimization finished");
            }
            if let Err(err) = self.write_cache(&rules) {
                warn!(error = %err, "Continuing with unpersisted optimized rules");
            }
        }

        Ok(LoadedRules {
            rules,
            templates,
            source_modified: Some(source_modified),
            from_cache: false,
        })
    }

    /// Read the cache if it exists and is not older than the source
    fn read_cache(&self, source_modified: SystemTime) -> Option<RuleSet> {
        let cache_path = self.cache_path();
        let cache_modified = modified(&cache_path).ok()?;
        if cache_modified < source_modified {
            debug!(cache = %cache_path.display(), "Optimized cache is stale");
            return None;
        }

        let content = fs::read_to_string(&cache_path).ok()?;
        match serde_yaml::from_str::<RuleSet>(&content) {
            Ok(rules) if rules.optimized => Some(rules),
            Ok(_) => None,
            Err(err) => {
                warn!(cache = %cache_path.display(), error = %err, "Ignoring unreadable optimized cache");
                None
            }
        }
    }

    /// Persist an optimized rule set next to the source
    pub fn write_cache(&self, rules: &RuleSet) -> ConfigResult<()> {
        let cache_path = self.cache_path();
        let content = serde_yaml::to_string(rules).map_err(|e| ConfigError::WriteCache {
            path: cache_path.clone(),
            reason: e.to_string(),
        })?;
        fs::write(&cache_path, content).map_err(|e| ConfigError::WriteCache {
            path: cache_path.clone(),
            reason: e.to_string(),
        })?;
        debug!(cache = %cache_path.display(), "Optimized rules written");
        Ok(())
    }
}

fn modified(path: &Path) -> ConfigResult<SystemTime> {
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Parse every YAML document of a rule file and merge them
pub fn parse_documents(content: &str, source_path: &Path) -> ConfigResult<RuleDocument> {
    let mut merged = RuleDocument::default();
    let mut count = 0;

    for document in serde_yaml::Deserializer::from_str(content) {
        let value = Value::deserialize(document).map_err(|e| ConfigError::ParseYaml {
            path: source_path.to_path_buf(),
            source: e,
        })?;
        if value.is_null() {
            continue;
        }
        let value = process_value(value)?;
        let document: RuleDocument =
            serde_yaml::from_value(value).map_err(|e| ConfigError::ParseYaml {
                path: source_path.to_path_buf(),
                source: e,
            })?;
        merged.merge(document);
        count += 1;
    }

    debug!(documents = count, "Parsed rule documents");
    Ok(merged)
}

/// Process a YAML value, handling custom tags
fn process_value(value: Value) -> ConfigResult<Value> {
    match value {
        Value::Tagged(tagged) => process_tagged(*tagged),
        Value::Mapping(map) => {
            let mut result = serde_yaml::Mapping::new();
            for (k, v) in map {
                result.insert(process_value(k)?, process_value(v)?);
            }
            Ok(Value::Mapping(result))
        }
        Value::Sequence(seq) => Ok(Value::Sequence(
            seq.into_iter()
                .map(process_value)
                .collect::<ConfigResult<Vec<_>>>()?,
        )),
        _ => Ok(value),
    }
}

fn process_tagged(tagged: serde_yaml::value::TaggedValue) -> ConfigResult<Value> {
    let tag = tagged.tag.to_string();
    trace!("Processing tag '{}' with value {:?}", tag, tagged.value);

    match tag.as_str() {
        "!env_var" => process_env_var(tagged.value),
        _ => {
            // Unknown tag, keep it but process the inner value
            let processed = process_value(tagged.value)?;
            Ok(Value::Tagged(Box::new(serde_yaml::value::TaggedValue {
                tag: tagged.tag,
                value: processed,
            })))
        }
    }
}

/// `!env_var NAME` or `!env_var NAME default`; the text is parsed as a YAML scalar
fn process_env_var(value: Value) -> ConfigResult<Value> {
    let spec = match value {
        Value::String(s) => s,
        _ => {
            return Err(ConfigError::InvalidValue {
                key: "!env_var".to_string(),
                reason: "environment variable name must be a string".to_string(),
            })
        }
    };

    let (name, default) = match spec.trim().split_once(char::is_whitespace) {
        Some((name, default)) => (name.to_string(), Some(default.trim().to_string())),
        None => (spec.trim().to_string(), None),
    };

    let text = match (std::env::var(&name), default) {
        (Ok(text), _) => text,
        (Err(_), Some(default)) => default,
        (Err(_), None) => return Err(ConfigError::EnvVarNotFound { var: name }),
    };

    debug!("Substituted env var: {}", name);
    Ok(serde_yaml::from_str::<Value>(&text).unwrap_or(Value::String(text)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rb_core::Value as Literal;

    #[test]
    fn test_multi_document_merge() {
        let content = r#"
devices:
  display: {kind: lcd}
vars:
  a: 1
states:
  - name: idle
---
vars:
  a: 2
  b: x
initial_state: busy
states:
  - name: busy
"#;
        let document = parse_documents(content, Path::new("rules.yaml")).unwrap();
        assert_eq!(document.states.len(), 2);
        assert_eq!(document.vars.get("a"), Some(&Literal::Int(2)));
        assert_eq!(document.vars.get("b"), Some(&Literal::from("x")));
        assert_eq!(document.initial_state.as_deref(), Some("busy"));
        assert!(document.devices.contains_key("display"));
    }

    #[test]
    fn test_env_var_tag_with_default() {
        std::env::set_var("RB_CONFIG_TEST_PORT", "8123");
        let content = r#"
vars:
  port: !env_var RB_CONFIG_TEST_PORT
  fallback: !env_var RB_CONFIG_TEST_UNSET_VAR 2.5
states:
  - name: idle
"#;
        let document = parse_documents(content, Path::new("rules.yaml")).unwrap();
        assert_eq!(document.vars.get("port"), Some(&Literal::Int(8123)));
        assert_eq!(document.vars.get("fallback"), Some(&Literal::Float(2.5)));
    }

    #[test]
    fn test_env_var_missing() {
        let content = "vars:\n  x: !env_var RB_CONFIG_TEST_SURELY_MISSING\n";
        assert!(matches!(
            parse_documents(content, Path::new("rules.yaml")),
            Err(ConfigError::EnvVarNotFound { .. })
        ));
    }

    #[test]
    fn test_malformed_yaml() {
        assert!(matches!(
            parse_documents("states: [", Path::new("rules.yaml")),
            Err(ConfigError::ParseYaml { .. })
        ));
    }

    #[test]
    fn test_cache_path() {
        let loader = RuleLoader::new("/etc/rulebot/rules.yaml");
        assert_eq!(
            loader.cache_path(),
            PathBuf::from("/etc/rulebot/rules.yaml.optimized")
        );
    }
}
