//! Loader tests against real files: cache creation, reuse and staleness

use rb_config::{ConfigError, Expression, LoadOptions, RuleLoader};
use rb_core::Value;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

const RULES: &str = r#"
devices:
  button: {kind: mcp23017, key: 3}
  display: {kind: lcd}
states:
  - name: idle
    conditions:
      - expressions: [enter]
        actions:
          - {name: display, key: 0, value: ready}
      - expressions: [{name: button}]
        actions:
          - name: display
            key: 1
            value: "{{ 'down' if button else 'up' }}"
            eval: true
"#;

fn write_rules(dir: &Path, content: &str) -> std::path::PathBuf {
    let path = dir.join("rules.yaml");
    fs::write(&path, content).unwrap();
    path
}

fn set_modified(path: &Path, time: SystemTime) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(time).unwrap();
}

#[test]
fn test_load_writes_optimized_cache() {
    let dir = TempDir::new().unwrap();
    let path = write_rules(dir.path(), RULES);
    let loader = RuleLoader::new(&path);

    let loaded = loader.load().unwrap();
    assert!(!loaded.from_cache);
    assert!(loaded.rules.optimized);
    assert!(loader.cache_path().exists());

    // The templated condition expanded into one copy per button value
    let conditions = &loaded.rules.state("idle").unwrap().conditions;
    assert_eq!(conditions.len(), 3);
    let rendered: Vec<_> = conditions[1..]
        .iter()
        .map(|c| c.actions[0].value.clone().unwrap())
        .collect();
    assert_eq!(rendered, vec![Value::from("up"), Value::from("down")]);
}

#[test]
fn test_fresh_cache_is_reused() {
    let dir = TempDir::new().unwrap();
    let path = write_rules(dir.path(), RULES);
    let loader = RuleLoader::new(&path);

    let first = loader.load().unwrap();
    let second = loader.load().unwrap();
    assert!(second.from_cache);
    assert_eq!(first.rules, second.rules);
}

#[test]
fn test_stale_cache_is_rebuilt() {
    let dir = TempDir::new().unwrap();
    let path = write_rules(dir.path(), RULES);
    let loader = RuleLoader::new(&path);
    loader.load().unwrap();

    let past = SystemTime::now() - Duration::from_secs(60);
    set_modified(&loader.cache_path(), past);
    fs::write(&path, RULES.replace("ready", "booted")).unwrap();
    set_modified(&path, past + Duration::from_secs(30));

    let loaded = loader.load().unwrap();
    assert!(!loaded.from_cache);
    let enter = &loaded.rules.state("idle").unwrap().conditions[0];
    assert_eq!(enter.actions[0].value, Some(Value::from("booted")));
    assert_eq!(
        enter.expressions,
        vec![Expression::Literal("enter".to_string())]
    );
}

#[test]
fn test_without_optimization_no_cache() {
    let dir = TempDir::new().unwrap();
    let path = write_rules(dir.path(), RULES);
    let loader = RuleLoader::new(&path).with_options(LoadOptions {
        optimize: false,
        ..LoadOptions::default()
    });

    let loaded = loader.load().unwrap();
    assert!(!loaded.rules.optimized);
    assert!(!loader.cache_path().exists());
    assert!(loaded.templates.contains("{{ 'down' if button else 'up' }}"));
}

#[test]
fn test_missing_file() {
    let dir = TempDir::new().unwrap();
    let loader = RuleLoader::new(dir.path().join("absent.yaml"));
    assert!(matches!(loader.load(), Err(ConfigError::ReadFile { .. })));
}

#[test]
fn test_unwritable_cache_is_not_fatal() {
    let dir = TempDir::new().unwrap();
    let path = write_rules(dir.path(), RULES);
    let loader = RuleLoader::new(&path);
    // A directory where the cache file should go makes the write fail
    fs::create_dir(loader.cache_path()).unwrap();

    let loaded = loader.load().unwrap();
    assert!(loaded.rules.optimized);
    assert!(!loaded.from_cache);
}
