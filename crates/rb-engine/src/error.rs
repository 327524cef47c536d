//! Error types for the rule engine

use rb_config::ConfigError;
use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Transition to a state the rule set does not declare
    #[error("unknown state '{name}'")]
    UnknownState { name: String },

    /// Too many immediate transitions chained while entering states
    #[error("transition chain to '{name}' exceeded {limit} hops")]
    TransitDepth { name: String, limit: usize },

    /// Rule loading failed
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The engine task has stopped
    #[error("engine is not running")]
    Closed,
}
