//! Gated state-machine rule engine for rulebot
//!
//! The engine runs the [`RuleSet`](rb_config::RuleSet) of one rule file:
//! on entering a state it evaluates the state's conditions for the ENTER
//! and INITIALIZED gates, and afterwards for the NORMAL gate on every state
//! change. Fired actions are coalesced per tick and forwarded to the device
//! collaborators; transitions run immediately while a state is being
//! entered and at the next tick otherwise.
//!
//! - [`RuleEngine`]: the synchronous core
//! - [`EngineRuntime`] / [`EngineHandle`]: the task that owns the core, its
//!   ticker and rule file watcher
//! - [`Command`] / [`PeerMessage`]: the inbound command surfaces

pub mod command;
pub mod dispatcher;
mod engine;
mod error;
pub mod evaluator;
pub mod queue;
pub mod runtime;

pub use command::{Command, PeerCommand, PeerMessage};
pub use dispatcher::Dispatcher;
pub use engine::{RuleEngine, MAX_TRANSIT_DEPTH};
pub use error::{EngineError, EngineResult};
pub use evaluator::{condition_fires, ValueResolver};
pub use queue::{ActionQueue, KindActions, PendingTransit};
pub use runtime::{EngineHandle, EngineMessage, EngineRuntime, RuntimeConfig};
