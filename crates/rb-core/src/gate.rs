//! Evaluation gates

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a gate name is not recognised
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown gate: {0}")]
pub struct GateParseError(pub String);

/// Phase in which a state's conditions are evaluated
///
/// `Enter` and `Initialized` run once each, in that order, when a state is
/// entered. `Normal` runs on every external state change afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gate {
    Enter,
    Initialized,
    Normal,
}

impl Gate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gate::Enter => "enter",
            Gate::Initialized => "initialized",
            Gate::Normal => "normal",
        }
    }

    /// Gates reached while a state is being entered
    pub fn is_startup(&self) -> bool {
        matches!(self, Gate::Enter | Gate::Initialized)
    }

    /// Whether an optional `only` restriction lets this gate through
    pub fn allowed_by(&self, only: Option<Gate>) -> bool {
        only.map_or(true, |restriction| restriction == *self)
    }

    /// Whether a bare literal names this gate
    pub fn matches_literal(&self, literal: &str) -> bool {
        literal.trim().eq_ignore_ascii_case(self.as_str())
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Gate {
    type Err = GateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enter" => Ok(Gate::Enter),
            "initialized" => Ok(Gate::Initialized),
            "normal" => Ok(Gate::Normal),
            _ => Err(GateParseError(s.to_string())),
        }
    }
}

impl Serialize for Gate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Gate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!("ENTER".parse::<Gate>().unwrap(), Gate::Enter);
        assert_eq!("Initialized".parse::<Gate>().unwrap(), Gate::Initialized);
        assert_eq!(" normal ".parse::<Gate>().unwrap(), Gate::Normal);
        assert!("exit".parse::<Gate>().is_err());
    }

    #[test]
    fn test_allowed_by() {
        assert!(Gate::Normal.allowed_by(None));
        assert!(Gate::Normal.allowed_by(Some(Gate::Normal)));
        assert!(!Gate::Enter.allowed_by(Some(Gate::Normal)));
    }

    #[test]
    fn test_serde_uses_lowercase_names() {
        let gate: Gate = serde_yaml::from_str("INITIALIZED").unwrap();
        assert_eq!(gate, Gate::Initialized);
        assert_eq!(serde_yaml::to_string(&gate).unwrap().trim(), "initialized");
    }
}
