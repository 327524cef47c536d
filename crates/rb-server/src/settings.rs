//! Daemon settings: optional YAML file, overridden by flags and environment

use anyhow::{Context, Result};
use clap::Parser;
use rb_config::{LoadOptions, DEFAULT_MAX_COMBINATIONS};
use rb_engine::RuntimeConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// rulebot - declarative state-machine controller
#[derive(Parser, Debug, Default)]
#[command(name = "rulebot")]
#[command(version)]
#[command(about = "Runs a rule file against the attached devices")]
pub struct Cli {
    /// Settings file
    #[arg(short, long, env = "RULEBOT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Rule file
    #[arg(short, long, env = "RULEBOT_RULES")]
    pub rules: Option<PathBuf>,

    /// Dispatch tick period in milliseconds
    #[arg(long, env = "RULEBOT_TICK_MS")]
    pub tick_ms: Option<u64>,

    /// Rule file check period in milliseconds
    #[arg(long, env = "RULEBOT_WATCH_MS")]
    pub watch_ms: Option<u64>,

    /// Do not expand templated rules or use the optimized cache
    #[arg(long)]
    pub no_optimize: bool,

    /// Cap on combinations per expanded condition
    #[arg(long, env = "RULEBOT_MAX_COMBINATIONS")]
    pub max_combinations: Option<usize>,

    /// MQTT broker host; MQTT stays off without one
    #[arg(long, env = "RULEBOT_MQTT_HOST")]
    pub mqtt_host: Option<String>,

    #[arg(long, env = "RULEBOT_MQTT_PORT")]
    pub mqtt_port: Option<u16>,

    #[arg(long, env = "RULEBOT_MQTT_CLIENT_ID")]
    pub mqtt_client_id: Option<String>,

    /// Log filter, e.g. `info` or `rb_engine=debug`
    #[arg(long, env = "RULEBOT_LOG")]
    pub log: Option<String>,
}

fn default_rules() -> PathBuf {
    PathBuf::from("rules.yaml")
}

fn default_tick_ms() -> u64 {
    250
}

fn default_watch_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_max_combinations() -> usize {
    DEFAULT_MAX_COMBINATIONS
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "rulebot".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MqttSettings {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default = "default_rules")]
    pub rules: PathBuf,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_watch_ms")]
    pub watch_ms: u64,
    #[serde(default = "default_true")]
    pub optimize: bool,
    #[serde(default = "default_max_combinations")]
    pub max_combinations: usize,
    #[serde(default)]
    pub mqtt: Option<MqttSettings>,
    #[serde(default)]
    pub log: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            tick_ms: default_tick_ms(),
            watch_ms: default_watch_ms(),
            optimize: true,
            max_combinations: default_max_combinations(),
            mqtt: None,
            log: None,
        }
    }
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))
    }

    /// Settings file (if any) with the command line applied on top
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let mut settings = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply(cli);
        Ok(settings)
    }

    fn apply(&mut self, cli: &Cli) {
        if let Some(rules) = &cli.rules {
            self.rules = rules.clone();
        }
        if let Some(tick_ms) = cli.tick_ms {
            self.tick_ms = tick_ms;
        }
        if let Some(watch_ms) = cli.watch_ms {
            self.watch_ms = watch_ms;
        }
        if cli.no_optimize {
            self.optimize = false;
        }
        if let Some(max) = cli.max_combinations {
            self.max_combinations = max;
        }
        if let Some(host) = &cli.mqtt_host {
            let mqtt = self.mqtt.get_or_insert_with(|| MqttSettings {
                host: host.clone(),
                port: default_mqtt_port(),
                client_id: default_client_id(),
            });
            mqtt.host = host.clone();
        }
        if let Some(mqtt) = &mut self.mqtt {
            if let Some(port) = cli.mqtt_port {
                mqtt.port = port;
            }
            if let Some(client_id) = &cli.mqtt_client_id {
                mqtt.client_id = client_id.clone();
            }
        }
        if let Some(log) = &cli.log {
            self.log = Some(log.clone());
        }
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            optimize: self.optimize,
            max_combinations: self.max_combinations,
        }
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            tick_period: Duration::from_millis(self.tick_ms.max(1)),
            watch_period: Duration::from_millis(self.watch_ms.max(1)),
            ..RuntimeConfig::default()
        }
    }
}
