//! Device collaborators driven by the rulebot engine
//!
//! The engine talks to hardware through four narrow interfaces:
//!
//! - [`Lcd`]: character display with numbered lines
//! - [`BitExpander`]: bit outputs written in one batch, plus readable inputs
//! - [`IndicatorStrip`]: addressable indicator LEDs
//! - [`PeerTransport`]: text messages to a connected peer
//!
//! [`Collaborators`] holds the ones present on a given machine; missing
//! collaborators are simply absent. The [`simulated`] module provides
//! in-memory implementations that log what they are asked to do.

pub mod simulated;

use rb_core::Value;
use std::fmt;
use thiserror::Error;
use tracing::error;

pub use simulated::{
    SimulatedBits, SimulatedDevices, SimulatedIndicators, SimulatedLcd, SimulatedPeer,
};

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Errors reported by collaborators
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeviceError {
    #[error("{kind}: invalid key '{key}'")]
    InvalidKey { kind: String, key: String },

    #[error("{kind}: invalid value '{value}'")]
    InvalidValue { kind: String, value: String },

    #[error("{kind}: {message}")]
    Io { kind: String, message: String },
}

/// Character display
pub trait Lcd: Send {
    /// Write one line
    fn write_line(&mut self, line: u8, text: &str) -> DeviceResult<()>;

    /// Replace the whole display content
    fn write_message(&mut self, text: &str) -> DeviceResult<()>;

    fn clear(&mut self) -> DeviceResult<()>;

    /// Drop queued writes that were not shown yet
    fn clear_queue(&mut self);

    /// Re-initialise the controller
    fn reinitialize(&mut self) -> DeviceResult<()>;

    fn set_backlight(&mut self, on: bool) -> DeviceResult<()>;

    /// Return to a neutral, blank display
    fn reset(&mut self) -> DeviceResult<()> {
        self.clear_queue();
        self.clear()
    }
}

/// Bit expander with buffered outputs
pub trait BitExpander: Send {
    /// Buffer an output bit; nothing is written until [`BitExpander::write_all`]
    fn set_bit(&mut self, bit: u8, value: bool);

    /// Write all buffered outputs in one operation
    fn write_all(&mut self) -> DeviceResult<()>;

    /// Current input levels, indexed by bit
    fn read_inputs(&mut self) -> DeviceResult<Vec<bool>>;

    /// Drive every output low
    fn reset(&mut self) -> DeviceResult<()>;
}

/// Addressable indicator LEDs
pub trait IndicatorStrip: Send {
    fn set(&mut self, index: usize, value: &Value) -> DeviceResult<()>;

    /// Turn every indicator off
    fn reset(&mut self) -> DeviceResult<()>;
}

/// Text channel to a connected peer
pub trait PeerTransport: Send {
    fn send(&mut self, message: &str) -> DeviceResult<()>;
}

/// The collaborators available to the engine
///
/// Built once at startup; each slot is optional.
#[derive(Default)]
pub struct Collaborators {
    lcd: Option<Box<dyn Lcd>>,
    bits: Option<Box<dyn BitExpander>>,
    indicators: Option<Box<dyn IndicatorStrip>>,
    peer: Option<Box<dyn PeerTransport>>,
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lcd(mut self, lcd: impl Lcd + 'static) -> Self {
        self.lcd = Some(Box::new(lcd));
        self
    }

    pub fn with_bits(mut self, bits: impl BitExpander + 'static) -> Self {
        self.bits = Some(Box::new(bits));
        self
    }

    pub fn with_indicators(mut self, indicators: impl IndicatorStrip + 'static) -> Self {
        self.indicators = Some(Box::new(indicators));
        self
    }

    pub fn with_peer(mut self, peer: impl PeerTransport + 'static) -> Self {
        self.peer = Some(Box::new(peer));
        self
    }

    pub fn lcd(&mut self) -> Option<&mut (dyn Lcd + 'static)> {
        self.lcd.as_deref_mut()
    }

    pub fn bits(&mut self) -> Option<&mut (dyn BitExpander + 'static)> {
        self.bits.as_deref_mut()
    }

    pub fn indicators(&mut self) -> Option<&mut (dyn IndicatorStrip + 'static)> {
        self.indicators.as_deref_mut()
    }

    pub fn peer(&mut self) -> Option<&mut (dyn PeerTransport + 'static)> {
        self.peer.as_deref_mut()
    }

    /// Put every output collaborator back into its neutral state
    ///
    /// Failures are logged; a broken device does not stop the others.
    pub fn reset_all(&mut self) {
        if let Some(lcd) = self.lcd.as_deref_mut() {
            if let Err(err) = lcd.reset() {
                error!(error = %err, "Failed to reset LCD");
            }
        }
        if let Some(bits) = self.bits.as_deref_mut() {
            if let Err(err) = bits.reset() {
                error!(error = %err, "Failed to reset bit expander");
            }
        }
        if let Some(indicators) = self.indicators.as_deref_mut() {
            if let Err(err) = indicators.reset() {
                error!(error = %err, "Failed to reset indicators");
            }
        }
    }

    /// Input levels of the bit expander, empty when there is none
    pub fn read_inputs(&mut self) -> Vec<bool> {
        match self.bits.as_deref_mut().map(|bits| bits.read_inputs()) {
            Some(Ok(inputs)) => inputs,
            Some(Err(err)) => {
                error!(error = %err, "Failed to read bit expander inputs");
                Vec::new()
            }
            None => Vec::new(),
        }
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("lcd", &self.lcd.is_some())
            .field("bits", &self.bits.is_some())
            .field("indicators", &self.indicators.is_some())
            .field("peer", &self.peer.is_some())
            .finish()
    }
}
