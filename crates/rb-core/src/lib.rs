//! Core types for the rulebot rule engine
//!
//! This crate provides the fundamental types shared by every other crate:
//! the typed [`Value`] literal with its parser, the evaluation [`Gate`] and
//! the [`StateAddress`] naming a device state slot.

mod address;
mod gate;
mod value;

pub use address::StateAddress;
pub use gate::{Gate, GateParseError};
pub use value::{parse_literal, Value};

/// Well-known device kinds understood by the engine and its collaborators
pub mod kinds {
    /// Deferred transition, obeys the gate restriction
    pub const GOTO: &str = "GOTO";

    /// Transition that bypasses the gate restriction
    pub const JUMP: &str = "JUMP";

    /// Character display
    pub const LCD: &str = "lcd";

    /// I2C bit expander (inputs and outputs)
    pub const BITS: &str = "mcp23017";

    /// Addressable LED indicator strip
    pub const INDICATORS: &str = "ws281x-indicators";

    /// Peer-to-peer transport
    pub const PEER: &str = "bluetooth";

    /// Whether the kind requests a state transition
    pub fn is_transition(kind: &str) -> bool {
        kind == GOTO || kind == JUMP
    }
}
