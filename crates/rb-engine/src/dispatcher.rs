//! Forwards coalesced actions to the device collaborators

use crate::queue::KindActions;
use indexmap::IndexMap;
use rb_core::{kinds, Value};
use rb_devices::{Collaborators, DeviceError, DeviceResult};
use rb_template::Environment;
use serde_json::json;
use tracing::{debug, error, warn};

/// LCD value that leaves the display untouched
pub const IGNORE: &str = "IGNORE";

/// Peer value that sends the template environment under the action key
pub const DUMP: &str = "DUMP";

/// Routes actions by kind to the matching collaborator
#[derive(Debug, Default)]
pub struct Dispatcher {
    collaborators: Collaborators,
}

impl Dispatcher {
    pub fn new(collaborators: Collaborators) -> Self {
        Self { collaborators }
    }

    pub fn collaborators(&mut self) -> &mut Collaborators {
        &mut self.collaborators
    }

    /// Forward one tick's worth of actions
    ///
    /// `env` is only called when a peer dump needs the template environment.
    pub fn dispatch(
        &mut self,
        actions: IndexMap<String, KindActions>,
        env: &dyn Fn() -> Environment,
    ) {
        for (kind, entries) in actions {
            if let Err(err) = self.dispatch_kind(&kind, &entries, env) {
                error!(kind = %kind, error = %err, "Dispatch failed");
            }
        }
    }

    fn dispatch_kind(
        &mut self,
        kind: &str,
        entries: &KindActions,
        env: &dyn Fn() -> Environment,
    ) -> DeviceResult<()> {
        debug!(kind, count = entries.len(), "Dispatching");
        match kind {
            kinds::LCD => self.dispatch_lcd(entries),
            kinds::BITS => self.dispatch_bits(entries),
            kinds::INDICATORS => self.dispatch_indicators(entries),
            kinds::PEER => self.dispatch_peer(entries, env),
            kinds::GOTO | kinds::JUMP => {
                warn!(kind, "Transition reached the dispatcher, dropped");
                Ok(())
            }
            _ => {
                warn!(kind, "No collaborator handles this kind");
                Ok(())
            }
        }
    }

    fn dispatch_lcd(&mut self, entries: &KindActions) -> DeviceResult<()> {
        let Some(lcd) = self.collaborators.lcd() else {
            warn!("No LCD attached");
            return Ok(());
        };

        for (key, value) in entries {
            let text = value.as_ref().map(Value::to_string).unwrap_or_default();
            match key.as_deref() {
                None => {
                    if text != IGNORE {
                        lcd.clear_queue();
                        lcd.write_message(&text)?;
                    }
                }
                Some("clear") => lcd.clear()?,
                Some("reset") => lcd.reinitialize()?,
                Some("backlight") => lcd.set_backlight(value.as_ref().is_some_and(Value::to_bool))?,
                Some(line) => {
                    let line: u8 = line.parse().map_err(|_| DeviceError::InvalidKey {
                        kind: kinds::LCD.to_string(),
                        key: line.to_string(),
                    })?;
                    if text != IGNORE {
                        lcd.write_line(line, &text)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn dispatch_bits(&mut self, entries: &KindActions) -> DeviceResult<()> {
        let Some(bits) = self.collaborators.bits() else {
            warn!("No bit expander attached");
            return Ok(());
        };

        let mut touched = false;
        for (key, value) in entries {
            let bit = key.as_deref().and_then(|k| k.parse::<u8>().ok());
            match bit {
                Some(bit) => {
                    bits.set_bit(bit, value.as_ref().is_some_and(Value::to_bool));
                    touched = true;
                }
                None => warn!(
                    error = %DeviceError::InvalidKey {
                        kind: kinds::BITS.to_string(),
                        key: key.clone().unwrap_or_default(),
                    },
                    "Skipping bit"
                ),
            }
        }

        if touched {
            bits.write_all()?;
        }
        Ok(())
    }

    fn dispatch_indicators(&mut self, entries: &KindActions) -> DeviceResult<()> {
        let Some(indicators) = self.collaborators.indicators() else {
            warn!("No indicator strip attached");
            return Ok(());
        };

        for (key, value) in entries {
            let Some(index) = key.as_deref().and_then(|k| k.parse::<usize>().ok()) else {
                warn!(key = ?key, "Indicator key is not an index");
                continue;
            };
            let value = value.clone().unwrap_or_else(|| Value::Bool(false));
            if let Err(err) = indicators.set(index, &value) {
                error!(index, error = %err, "Failed to set indicator");
            }
        }
        Ok(())
    }

    fn dispatch_peer(
        &mut self,
        entries: &KindActions,
        env: &dyn Fn() -> Environment,
    ) -> DeviceResult<()> {
        let Some(peer) = self.collaborators.peer() else {
            warn!("No peer transport attached");
            return Ok(());
        };

        for (key, value) in entries {
            let message = match (key, value) {
                (None, _) => serde_json::Value::Object(env()),
                (Some(key), Some(Value::Str(s))) if s == DUMP => json!({ key: env() }),
                (Some(key), value) => json!({
                    key: value.as_ref().map_or(serde_json::Value::Null, Value::to_json)
                }),
            };
            peer.send(&message.to_string())?;
        }
        Ok(())
    }

    /// Send a raw message to the peer, if one is attached
    pub fn send_peer(&mut self, message: &str) {
        match self.collaborators.peer() {
            Some(peer) => {
                if let Err(err) = peer.send(message) {
                    error!(error = %err, "Failed to send to peer");
                }
            }
            None => warn!("No peer transport attached"),
        }
    }

    pub fn reset_all(&mut self) {
        self.collaborators.reset_all();
    }

    pub fn read_inputs(&mut self) -> Vec<bool> {
        self.collaborators.read_inputs()
    }
}
