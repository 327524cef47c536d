//! The rule engine core
//!
//! [`RuleEngine`] is synchronous and takes `&mut self` for everything that
//! touches state: exclusive access is what makes an evaluation cascade
//! atomic. The [`runtime`](crate::runtime) module wraps it in a task that
//! owns it and feeds it events one at a time.

use crate::command::{Command, PeerCommand, PeerMessage};
use crate::dispatcher::Dispatcher;
use crate::error::{EngineError, EngineResult};
use crate::evaluator::{condition_fires, ValueResolver};
use crate::queue::{ActionQueue, KindActions, PendingTransit};
use indexmap::IndexMap;
use rb_config::{DeviceRef, LoadedRules, RuleLoader, RuleSet};
use rb_core::{kinds, parse_literal, Gate, Value};
use rb_devices::Collaborators;
use rb_state_store::{GlobalState, StateChange};
use rb_template::TemplateCache;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, instrument, warn};

/// Maximum number of immediate transitions chained from startup gates
pub const MAX_TRANSIT_DEPTH: usize = 16;

pub struct RuleEngine {
    rules: Arc<RuleSet>,
    templates: TemplateCache,
    state: GlobalState,
    current: Option<String>,
    queue: ActionQueue,
    dispatcher: Dispatcher,
    loader: Option<RuleLoader>,
    source_modified: Option<SystemTime>,
    /// Bumped on every transit; an evaluation pass stops once it changes
    generation: u64,
    depth: usize,
}

impl RuleEngine {
    pub fn new(loaded: LoadedRules, collaborators: Collaborators) -> Self {
        Self {
            rules: Arc::new(loaded.rules),
            templates: loaded.templates,
            state: GlobalState::new(),
            current: None,
            queue: ActionQueue::new(),
            dispatcher: Dispatcher::new(collaborators),
            loader: None,
            source_modified: loaded.source_modified,
            generation: 0,
            depth: 0,
        }
    }

    /// Load rules from a file; the loader is kept for restarts and watching
    pub fn from_loader(loader: RuleLoader, collaborators: Collaborators) -> EngineResult<Self> {
        let loaded = loader.load()?;
        Ok(Self::new(loaded, collaborators).with_loader(loader))
    }

    pub fn with_loader(mut self, loader: RuleLoader) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn current_state(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn state(&self) -> &GlobalState {
        &self.state
    }

    pub fn get_state(&self, kind: &str, key: &str) -> Option<&Value> {
        self.state.get(kind, key)
    }

    /// Actions waiting for the next tick
    pub fn queue(&self) -> &ActionQueue {
        &self.queue
    }

    /// Reset everything and enter the initial state
    ///
    /// Clears the queue and the state table, resets every collaborator
    /// output, mirrors the bit expander inputs into the table, then transits.
    pub fn start(&mut self) -> EngineResult<()> {
        info!(initial = %self.rules.initial_state, "Starting rule engine");
        self.queue.clear();
        self.state.clear();
        self.current = None;
        self.depth = 0;
        self.dispatcher.reset_all();

        for (bit, level) in self.dispatcher.read_inputs().into_iter().enumerate() {
            self.state.insert(kinds::BITS, bit.to_string(), Value::Bool(level));
        }

        let initial = self.rules.initial_state.clone();
        self.transit(&initial)
    }

    /// Swap in a new rule set; call [`RuleEngine::start`] afterwards
    pub fn replace_rules(&mut self, loaded: LoadedRules) {
        self.rules = Arc::new(loaded.rules);
        self.templates = loaded.templates;
        self.source_modified = loaded.source_modified;
    }

    /// Reload from the attached loader and restart
    ///
    /// When loading fails the running rules stay untouched.
    pub fn reload(&mut self) -> EngineResult<()> {
        let Some(loader) = &self.loader else {
            return self.start();
        };
        let loaded = loader.load()?;
        self.replace_rules(loaded);
        self.start()
    }

    /// Restart, with fresh rules when they load
    pub fn restart(&mut self) -> EngineResult<()> {
        if let Err(err) = self.reload() {
            error!(error = %err, "Reload failed, restarting with previous rules");
            self.start()?;
        }
        Ok(())
    }

    /// Reload when the source file changed since it was last seen
    ///
    /// Returns whether the engine restarted.
    pub fn check_source(&mut self) -> bool {
        let Some(loader) = &self.loader else {
            return false;
        };
        let modified = match loader.source_modified() {
            Ok(modified) => Some(modified),
            Err(err) => {
                debug!(error = %err, "Cannot stat rule source");
                return false;
            }
        };
        if modified == self.source_modified {
            return false;
        }

        info!(path = %loader.path().display(), "Rule source changed, reloading");
        // Remember the new time even on failure, so a broken file is not
        // reloaded on every check
        self.source_modified = modified;
        match self.reload() {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, "Reload failed, keeping previous rules");
                false
            }
        }
    }

    /// Write a state slot; evaluates NORMAL conditions when it changed
    pub fn set_state(&mut self, kind: &str, key: &str, value: Value) -> bool {
        match self.state.update(kind, key, value) {
            StateChange::Unchanged => false,
            StateChange::Changed { previous } => {
                self.evaluate(Gate::Normal, Some(&previous));
                true
            }
        }
    }

    /// Write the slot of a named device, or `kind = key = name`
    pub fn set_named(&mut self, name: &str, value: Value) -> bool {
        let (kind, key) = match self.rules.device(name) {
            Some(device) => (device.kind.clone(), device.state_key().to_string()),
            None => (name.to_string(), name.to_string()),
        };
        self.set_state(&kind, &key, value)
    }

    /// Enter a state: evaluate ENTER, then INITIALIZED
    ///
    /// INITIALIZED is skipped when ENTER already moved on to another state.
    #[instrument(skip(self), fields(from = ?self.current))]
    pub fn transit(&mut self, name: &str) -> EngineResult<()> {
        if !self.rules.has_state(name) {
            return Err(EngineError::UnknownState {
                name: name.to_string(),
            });
        }
        if self.depth >= MAX_TRANSIT_DEPTH {
            return Err(EngineError::TransitDepth {
                name: name.to_string(),
                limit: MAX_TRANSIT_DEPTH,
            });
        }

        info!("Entering state");
        self.current = Some(name.to_string());
        self.generation += 1;
        let generation = self.generation;

        self.depth += 1;
        self.evaluate(Gate::Enter, None);
        if self.generation == generation {
            self.evaluate(Gate::Initialized, None);
        }
        self.depth -= 1;
        Ok(())
    }

    /// Evaluate the current state's conditions for a gate
    fn evaluate(&mut self, gate: Gate, previous: Option<&GlobalState>) {
        let Some(current) = self.current.clone() else {
            return;
        };
        let rules = Arc::clone(&self.rules);
        let Some(state_rules) = rules.state(&current) else {
            warn!(state = %current, "Current state has no rules");
            return;
        };
        let generation = self.generation;

        for (index, condition) in state_rules.conditions.iter().enumerate() {
            if self.generation != generation {
                break;
            }
            if !gate.allowed_by(condition.only) {
                continue;
            }

            let fired = {
                let mut resolver = ValueResolver::new(&rules, &self.state, &mut self.templates);
                condition_fires(condition, gate, &mut resolver, &self.state, previous)
            };
            if !fired {
                continue;
            }

            debug!(state = %current, condition = index, gate = %gate, "Condition fired");
            for action in &condition.actions {
                if self.generation != generation {
                    break;
                }
                if gate.allowed_by(action.only) {
                    self.execute(action, gate);
                }
            }
        }
    }

    /// Queue an action, or handle a transition
    fn execute(&mut self, action: &DeviceRef, gate: Gate) {
        let value = ValueResolver::new(&self.rules, &self.state, &mut self.templates).resolve(action);

        if !kinds::is_transition(&action.kind) {
            self.queue.push(&action.kind, action.key.as_deref(), value);
            return;
        }

        if action.kind == kinds::GOTO && gate == Gate::Enter {
            debug!(to = ?action.key, "GOTO ignored while entering");
            return;
        }
        let Some(target) = action.key.clone() else {
            warn!(kind = %action.kind, "Transition without a target state");
            return;
        };

        let delay = transit_delay(value.as_ref());
        if gate.is_startup() && delay.is_zero() {
            if let Err(err) = self.transit(&target) {
                error!(to = %target, error = %err, "Transition failed");
            }
        } else {
            debug!(to = %target, ?delay, "Transition queued");
            self.queue.set_transit(PendingTransit { target, delay });
        }
    }

    /// Run an action right away instead of queueing it
    pub fn execute_now(&mut self, action: &DeviceRef) {
        let value = ValueResolver::new(&self.rules, &self.state, &mut self.templates).resolve(action);

        if kinds::is_transition(&action.kind) {
            match &action.key {
                Some(target) => {
                    if let Err(err) = self.transit(target) {
                        error!(to = %target, error = %err, "Transition failed");
                    }
                }
                None => warn!(kind = %action.kind, "Transition without a target state"),
            }
            return;
        }

        let mut entries = KindActions::new();
        entries.insert(action.key.clone(), value);
        let mut actions = IndexMap::new();
        actions.insert(action.kind.clone(), entries);
        self.dispatch(actions);
    }

    /// Flush the queue to the collaborators
    ///
    /// Non-transition actions go out first. A zero-delay transition then
    /// runs immediately; a delayed one is returned for the caller to time.
    pub fn tick(&mut self) -> Option<PendingTransit> {
        if self.queue.is_empty() {
            return None;
        }
        let (actions, transit) = self.queue.take().into_parts();
        if !actions.is_empty() {
            self.dispatch(actions);
        }

        match transit {
            Some(transit) if transit.delay.is_zero() => {
                self.complete_transit(&transit.target);
                None
            }
            other => other,
        }
    }

    /// Perform a transition whose delay has elapsed
    pub fn complete_transit(&mut self, target: &str) {
        if let Err(err) = self.transit(target) {
            error!(to = target, error = %err, "Transition failed");
        }
    }

    fn dispatch(&mut self, actions: IndexMap<String, KindActions>) {
        let (rules, state) = (&self.rules, &self.state);
        self.dispatcher
            .dispatch(actions, &|| rules.environment(state));
    }

    /// Handle a bus command; returns a report for `[]`
    pub fn handle_command<S: AsRef<str>>(&mut self, path: &[S], payload: &str) -> Option<String> {
        let Some(command) = Command::parse(path) else {
            let path: Vec<&str> = path.iter().map(|segment| segment.as_ref()).collect();
            warn!(?path, "Unsupported command path");
            return None;
        };

        match command {
            Command::ReportState => {
                let current = self.current.clone().unwrap_or_default();
                info!(state = %current, "Current state");
                return Some(current);
            }
            Command::Restart => {
                if let Err(err) = self.restart() {
                    error!(error = %err, "Restart failed");
                }
            }
            Command::SetNamed(name) => {
                self.set_named(&name, parse_literal(payload));
            }
            Command::Set { kind, key } => {
                self.set_state(&kind, &key, parse_literal(payload));
            }
        }
        None
    }

    /// Handle a message from the peer transport
    pub fn handle_peer(&mut self, text: &str) {
        match PeerMessage::parse(text) {
            PeerMessage::Connected => {
                self.set_state(kinds::PEER, "connected", Value::Bool(true));
            }
            PeerMessage::Disconnected => {
                self.set_state(kinds::PEER, "connected", Value::Bool(false));
            }
            PeerMessage::Identified(id) => {
                self.set_state(kinds::PEER, "device", Value::Str(id));
            }
            PeerMessage::Pull => {
                let description = self.describe().to_string();
                self.dispatcher.send_peer(&description);
            }
            PeerMessage::Commands(commands) => {
                for command in commands {
                    self.handle_peer_command(command);
                }
            }
        }
    }

    fn handle_peer_command(&mut self, command: PeerCommand) {
        match command {
            PeerCommand::Action { name, value } => {
                let Some(device) = self.rules.device(&name) else {
                    warn!(device = %name, "Unknown device in peer action");
                    return;
                };
                let mut action = DeviceRef::new(&device.kind, device.key.as_deref())
                    .with_value(value)
                    .evaluated();
                action.name = Some(name);
                self.execute_now(&action);
            }
            PeerCommand::Transit(target) => self.complete_transit(&target),
            PeerCommand::State { key, value } => {
                self.set_state(kinds::PEER, &key, value);
            }
        }
    }

    /// JSON description of the loaded tables
    pub fn describe(&self) -> serde_json::Value {
        self.rules.describe()
    }
}

/// Delay of a transition action, in milliseconds; absent means none
fn transit_delay(value: Option<&Value>) -> Duration {
    let millis = value.and_then(Value::as_i64).unwrap_or(0);
    Duration::from_millis(millis.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rb_config::load_str;
    use rb_devices::SimulatedDevices;

    fn engine(rules: &str) -> (RuleEngine, SimulatedDevices) {
        let devices = SimulatedDevices::new();
        let engine = RuleEngine::new(load_str(rules).unwrap(), devices.collaborators());
        (engine, devices)
    }

    #[test]
    fn test_transit_delay() {
        assert_eq!(transit_delay(None), Duration::ZERO);
        assert_eq!(transit_delay(Some(&Value::Int(250))), Duration::from_millis(250));
        assert_eq!(transit_delay(Some(&Value::Int(-5))), Duration::ZERO);
        assert_eq!(transit_delay(Some(&Value::from("100"))), Duration::from_millis(100));
    }

    #[test]
    fn test_goto_ignored_on_enter_but_jump_runs() {
        let (mut engine, _) = engine(
            r#"
states:
  - name: a
    conditions:
      - actions:
          - {kind: GOTO, key: b}
  - name: b
    conditions:
      - actions:
          - {kind: JUMP, key: c}
  - name: c
"#,
        );
        engine.start().unwrap();
        assert_eq!(engine.current_state(), Some("a"));

        engine.transit("b").unwrap();
        assert_eq!(engine.current_state(), Some("c"));
    }

    #[test]
    fn test_startup_chain_through_initialized() {
        let (mut engine, devices) = engine(
            r#"
states:
  - name: boot
    conditions:
      - expressions: [initialized]
        actions:
          - {kind: GOTO, key: ready}
      - expressions: [initialized]
        actions:
          - {kind: lcd, key: 0, value: never}
  - name: ready
    conditions:
      - actions:
          - {kind: lcd, key: 0, value: ready}
"#,
        );
        engine.start().unwrap();
        assert_eq!(engine.current_state(), Some("ready"));

        // The second boot condition was cut off by the transit
        engine.tick();
        let writes = devices.lcd.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].text, "ready");
    }

    #[test]
    fn test_initialized_runs_once_for_the_state_entered() {
        let (mut engine, devices) = engine(
            r#"
states:
  - name: splash
    conditions:
      - actions:
          - {kind: JUMP, key: menu}
      - expressions: [initialized]
        actions:
          - {kind: lcd, key: 1, value: splash-init}
  - name: menu
    conditions:
      - actions:
          - {kind: lcd, key: 0, value: menu}
      - expressions: [initialized]
        actions:
          - {kind: lcd, key: 2, value: menu-init}
"#,
        );
        engine.start().unwrap();
        assert_eq!(engine.current_state(), Some("menu"));

        engine.tick();
        let lines = devices.lcd.lines();
        assert_eq!(lines.get(&0).map(String::as_str), Some("menu"));
        assert_eq!(lines.get(&1), None);
        assert_eq!(lines.get(&2).map(String::as_str), Some("menu-init"));
        assert_eq!(devices.lcd.writes().len(), 2);
    }

    #[test]
    fn test_transit_loop_is_bounded() {
        let (mut engine, _) = engine(
            r#"
states:
  - name: ping
    conditions:
      - expressions: [initialized]
        actions: [{kind: GOTO, key: pong}]
  - name: pong
    conditions:
      - expressions: [initialized]
        actions: [{kind: GOTO, key: ping}]
"#,
        );
        // The chain stops at the hop limit instead of recursing forever
        engine.start().unwrap();
        assert!(engine.current_state().is_some());
    }

    #[test]
    fn test_unknown_state() {
        let (mut engine, _) = engine("states: [{name: only}]");
        assert!(matches!(
            engine.transit("missing"),
            Err(EngineError::UnknownState { .. })
        ));
    }

    #[test]
    fn test_normal_goto_is_queued_with_delay() {
        let (mut engine, _) = engine(
            r#"
devices:
  button: {kind: mcp23017, key: 1}
states:
  - name: idle
    conditions:
      - expressions: [{name: button, value: true}]
        actions: [{kind: GOTO, key: busy, value: 500}]
  - name: busy
"#,
        );
        engine.start().unwrap();
        engine.set_state("mcp23017", "1", Value::Bool(true));
        assert_eq!(engine.current_state(), Some("idle"));

        let pending = engine.tick().unwrap();
        assert_eq!(pending.target, "busy");
        assert_eq!(pending.delay, Duration::from_millis(500));
        engine.complete_transit(&pending.target);
        assert_eq!(engine.current_state(), Some("busy"));
    }

    #[test]
    fn test_peer_messages() {
        let (mut engine, devices) = engine(
            r#"
devices:
  display: {kind: lcd, key: 2}
states:
  - name: idle
  - name: away
"#,
        );
        engine.start().unwrap();

        engine.handle_peer("BT:CONNECTED");
        engine.handle_peer("IDD:phone");
        assert_eq!(engine.get_state("bluetooth", "connected"), Some(&Value::Bool(true)));
        assert_eq!(engine.get_state("bluetooth", "device"), Some(&Value::from("phone")));

        engine.handle_peer("action,display,{{ 40 + 2 }};state,speed,3;transit,away");
        assert_eq!(devices.lcd.lines().get(&2).map(String::as_str), Some("42"));
        assert_eq!(engine.get_state("bluetooth", "speed"), Some(&Value::Int(3)));
        assert_eq!(engine.current_state(), Some("away"));

        engine.handle_peer("PULL");
        let sent = devices.peer.sent();
        let description: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert!(description["devices"]["display"].is_object());
    }

    #[test]
    fn test_commands() {
        let (mut engine, _) = engine(
            r#"
devices:
  motor: {kind: pwm, key: left}
states:
  - name: idle
"#,
        );
        engine.start().unwrap();

        let empty: [&str; 0] = [];
        assert_eq!(engine.handle_command(&empty, ""), Some("idle".to_string()));

        engine.handle_command(&["motor"], "0.5");
        assert_eq!(engine.get_state("pwm", "left"), Some(&Value::Float(0.5)));

        engine.handle_command(&["relay"], "true");
        assert_eq!(engine.get_state("relay", "relay"), Some(&Value::Bool(true)));

        engine.handle_command(&["mcp23017", "4"], "1");
        assert_eq!(engine.get_state("mcp23017", "4"), Some(&Value::Int(1)));
    }
}
