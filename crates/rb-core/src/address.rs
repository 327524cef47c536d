//! Two-part address of a device state slot

use serde::{Deserialize, Serialize};
use std::fmt;

/// A `(kind, key)` pair identifying one slot of the global state
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateAddress {
    pub kind: String,
    pub key: String,
}

impl StateAddress {
    pub fn new(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for StateAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.kind, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(StateAddress::new("mcp23017", "3").to_string(), "mcp23017[3]");
    }
}
