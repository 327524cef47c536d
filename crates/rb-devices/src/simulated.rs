//! In-memory devices
//!
//! Each simulated device is a cheap handle over shared state: keep one
//! clone to inspect what the engine did, hand another to [`Collaborators`].
//! Every operation is also logged at debug level, which makes them usable
//! as stand-ins on machines without the hardware.

use crate::{BitExpander, Collaborators, DeviceResult, IndicatorStrip, Lcd, PeerTransport};
use rb_core::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Number of bits on the simulated expander
pub const BIT_COUNT: usize = 16;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One write the LCD received; `line` is `None` for whole-message writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LcdWrite {
    pub line: Option<u8>,
    pub text: String,
}

#[derive(Debug, Default)]
struct LcdState {
    lines: BTreeMap<u8, String>,
    writes: Vec<LcdWrite>,
    backlight: Option<bool>,
    clears: usize,
    resets: usize,
    reinitializations: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedLcd {
    state: Arc<Mutex<LcdState>>,
}

impl SimulatedLcd {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text currently shown, by line
    pub fn lines(&self) -> BTreeMap<u8, String> {
        lock(&self.state).lines.clone()
    }

    /// Every write since creation, in order
    pub fn writes(&self) -> Vec<LcdWrite> {
        lock(&self.state).writes.clone()
    }

    pub fn backlight(&self) -> Option<bool> {
        lock(&self.state).backlight
    }

    pub fn clears(&self) -> usize {
        lock(&self.state).clears
    }

    pub fn resets(&self) -> usize {
        lock(&self.state).resets
    }

    pub fn reinitializations(&self) -> usize {
        lock(&self.state).reinitializations
    }
}

impl Lcd for SimulatedLcd {
    fn write_line(&mut self, line: u8, text: &str) -> DeviceResult<()> {
        debug!(line, text, "LCD line");
        let mut state = lock(&self.state);
        state.lines.insert(line, text.to_string());
        state.writes.push(LcdWrite {
            line: Some(line),
            text: text.to_string(),
        });
        Ok(())
    }

    fn write_message(&mut self, text: &str) -> DeviceResult<()> {
        debug!(text, "LCD message");
        let mut state = lock(&self.state);
        state.lines.clear();
        for (line, content) in text.lines().enumerate() {
            state.lines.insert(line as u8, content.to_string());
        }
        state.writes.push(LcdWrite {
            line: None,
            text: text.to_string(),
        });
        Ok(())
    }

    fn clear(&mut self) -> DeviceResult<()> {
        debug!("LCD clear");
        let mut state = lock(&self.state);
        state.lines.clear();
        state.clears += 1;
        Ok(())
    }

    fn clear_queue(&mut self) {}

    fn reinitialize(&mut self) -> DeviceResult<()> {
        debug!("LCD reinitialize");
        lock(&self.state).reinitializations += 1;
        Ok(())
    }

    fn set_backlight(&mut self, on: bool) -> DeviceResult<()> {
        debug!(on, "LCD backlight");
        lock(&self.state).backlight = Some(on);
        Ok(())
    }

    fn reset(&mut self) -> DeviceResult<()> {
        debug!("LCD reset");
        let mut state = lock(&self.state);
        state.lines.clear();
        state.resets += 1;
        Ok(())
    }
}

#[derive(Debug)]
struct BitsState {
    pending: [bool; BIT_COUNT],
    outputs: [bool; BIT_COUNT],
    inputs: [bool; BIT_COUNT],
    writes: usize,
    resets: usize,
}

impl Default for BitsState {
    fn default() -> Self {
        Self {
            pending: [false; BIT_COUNT],
            outputs: [false; BIT_COUNT],
            inputs: [false; BIT_COUNT],
            writes: 0,
            resets: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedBits {
    state: Arc<Mutex<BitsState>>,
}

impl SimulatedBits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drive an input level, as a wired switch would
    pub fn set_input(&self, bit: u8, value: bool) {
        if let Some(slot) = lock(&self.state).inputs.get_mut(bit as usize) {
            *slot = value;
        }
    }

    /// Level of an output as last written
    pub fn output(&self, bit: u8) -> bool {
        lock(&self.state)
            .outputs
            .get(bit as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Number of batched writes performed
    pub fn writes(&self) -> usize {
        lock(&self.state).writes
    }

    pub fn resets(&self) -> usize {
        lock(&self.state).resets
    }
}

impl BitExpander for SimulatedBits {
    fn set_bit(&mut self, bit: u8, value: bool) {
        if let Some(slot) = lock(&self.state).pending.get_mut(bit as usize) {
            *slot = value;
        }
    }

    fn write_all(&mut self) -> DeviceResult<()> {
        let mut state = lock(&self.state);
        state.outputs = state.pending;
        state.writes += 1;
        debug!(outputs = ?state.outputs, "Bit expander write");
        Ok(())
    }

    fn read_inputs(&mut self) -> DeviceResult<Vec<bool>> {
        Ok(lock(&self.state).inputs.to_vec())
    }

    fn reset(&mut self) -> DeviceResult<()> {
        debug!("Bit expander reset");
        let mut state = lock(&self.state);
        state.pending = [false; BIT_COUNT];
        state.outputs = [false; BIT_COUNT];
        state.resets += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct IndicatorState {
    pixels: BTreeMap<usize, Value>,
    resets: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedIndicators {
    state: Arc<Mutex<IndicatorState>>,
}

impl SimulatedIndicators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indicators currently lit
    pub fn pixels(&self) -> BTreeMap<usize, Value> {
        lock(&self.state).pixels.clone()
    }

    pub fn resets(&self) -> usize {
        lock(&self.state).resets
    }
}

impl IndicatorStrip for SimulatedIndicators {
    fn set(&mut self, index: usize, value: &Value) -> DeviceResult<()> {
        debug!(index, value = %value, "Indicator");
        lock(&self.state).pixels.insert(index, value.clone());
        Ok(())
    }

    fn reset(&mut self) -> DeviceResult<()> {
        debug!("Indicators reset");
        let mut state = lock(&self.state);
        state.pixels.clear();
        state.resets += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedPeer {
    sent: Arc<Mutex<Vec<String>>>,
}

impl SimulatedPeer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages sent so far
    pub fn sent(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }
}

impl PeerTransport for SimulatedPeer {
    fn send(&mut self, message: &str) -> DeviceResult<()> {
        debug!(message, "Peer send");
        lock(&self.sent).push(message.to_string());
        Ok(())
    }
}

/// A full set of simulated devices
#[derive(Debug, Clone, Default)]
pub struct SimulatedDevices {
    pub lcd: SimulatedLcd,
    pub bits: SimulatedBits,
    pub indicators: SimulatedIndicators,
    pub peer: SimulatedPeer,
}

impl SimulatedDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collaborators backed by handles to these devices
    pub fn collaborators(&self) -> Collaborators {
        Collaborators::new()
            .with_lcd(self.lcd.clone())
            .with_bits(self.bits.clone())
            .with_indicators(self.indicators.clone())
            .with_peer(self.peer.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_write_in_one_batch() {
        let bits = SimulatedBits::new();
        let mut handle = bits.clone();
        handle.set_bit(0, true);
        handle.set_bit(5, true);
        assert!(!bits.output(0));
        handle.write_all().unwrap();
        assert!(bits.output(0));
        assert!(bits.output(5));
        assert_eq!(bits.writes(), 1);
    }

    #[test]
    fn test_inputs() {
        let bits = SimulatedBits::new();
        bits.set_input(3, true);
        let inputs = bits.clone().read_inputs().unwrap();
        assert_eq!(inputs.len(), BIT_COUNT);
        assert!(inputs[3]);
    }

    #[test]
    fn test_lcd_message_replaces_lines() {
        let lcd = SimulatedLcd::new();
        let mut handle = lcd.clone();
        handle.write_line(3, "old").unwrap();
        handle.write_message("a\nb").unwrap();
        let lines = lcd.lines();
        assert_eq!(lines.get(&0).map(String::as_str), Some("a"));
        assert_eq!(lines.get(&1).map(String::as_str), Some("b"));
        assert!(!lines.contains_key(&3));
        assert_eq!(lcd.writes().len(), 2);
    }
}
