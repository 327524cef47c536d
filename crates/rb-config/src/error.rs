//! Error types for rule loading

use std::path::PathBuf;
use thiserror::Error;

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors that can occur while loading a rule document
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a file
    #[error("failed to read file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML
    #[error("failed to parse YAML in {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Environment variable not found
    #[error("environment variable '{var}' not set")]
    EnvVarNotFound { var: String },

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    /// The document declares no states
    #[error("rule document declares no states")]
    NoStates,

    /// Two states share a name
    #[error("state '{name}' is declared more than once")]
    DuplicateState { name: String },

    /// A state name that is not declared
    #[error("unknown state '{name}'")]
    UnknownState { name: String },

    /// Optimizing a condition would generate too many combinations
    #[error(
        "condition #{condition} of state '{state}' expands to {combinations} combinations (limit {limit})"
    )]
    DomainOverflow {
        state: String,
        condition: usize,
        combinations: u128,
        limit: usize,
    },

    /// Failed to persist the optimized rule set
    #[error("failed to write optimized rules to {path}: {reason}")]
    WriteCache { path: PathBuf, reason: String },
}
