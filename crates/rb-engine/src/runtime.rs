//! Actor runtime for the rule engine
//!
//! A single task owns the [`RuleEngine`] and processes, one at a time:
//!
//! - messages from [`EngineHandle`]s (state changes, commands, peer text)
//! - the dispatch ticker, which flushes queued actions
//! - a delayed transition timer; ticks pause while one is pending
//! - the rule file watcher
//!
//! Every event runs to completion before the next is looked at, so an
//! evaluation cascade always sees a consistent state table.

use crate::engine::RuleEngine;
use crate::error::{EngineError, EngineResult};
use rb_core::Value;
use rb_state_store::GlobalState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Period of the dispatch ticker
    pub tick_period: Duration,
    /// Period of the rule file modification check
    pub watch_period: Duration,
    /// Capacity of the message channel
    pub channel_capacity: usize,
    /// How long [`EngineHandle::stop`] waits for the task
    pub shutdown_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_millis(250),
            watch_period: Duration::from_secs(1),
            channel_capacity: 256,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Messages processed by the engine task
#[derive(Debug)]
pub enum EngineMessage {
    SetState {
        kind: String,
        key: String,
        value: Value,
        reply: Option<oneshot::Sender<bool>>,
    },
    Command {
        path: Vec<String>,
        payload: String,
        reply: oneshot::Sender<Option<String>>,
    },
    Peer(String),
    Restart(oneshot::Sender<()>),
    CurrentState(oneshot::Sender<Option<String>>),
    GetState {
        kind: String,
        key: String,
        reply: oneshot::Sender<Option<Value>>,
    },
    Snapshot(oneshot::Sender<GlobalState>),
}

pub struct EngineRuntime {
    engine: RuleEngine,
    config: RuntimeConfig,
}

impl EngineRuntime {
    pub fn new(engine: RuleEngine, config: RuntimeConfig) -> Self {
        Self { engine, config }
    }

    /// Enter the initial state and spawn the engine task
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(mut self) -> EngineResult<EngineHandle> {
        self.engine.start()?;

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let shutdown_timeout = self.config.shutdown_timeout;

        info!(
            tick_ms = self.config.tick_period.as_millis() as u64,
            watch_ms = self.config.watch_period.as_millis() as u64,
            "Starting engine task"
        );
        let task = tokio::spawn(run(self.engine, self.config, rx, shutdown_rx));

        Ok(EngineHandle {
            tx,
            shutdown_tx,
            shutdown_timeout,
            task: Arc::new(Mutex::new(Some(task))),
        })
    }
}

async fn run(
    mut engine: RuleEngine,
    config: RuntimeConfig,
    mut rx: mpsc::Receiver<EngineMessage>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = interval(config.tick_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut watcher = interval(config.watch_period);
    watcher.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut pending: Option<(Instant, String)> = None;

    loop {
        let deadline = pending.as_ref().map(|(at, _)| *at);

        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Received shutdown signal");
                break;
            }
            message = rx.recv() => {
                match message {
                    Some(message) => {
                        if handle_message(&mut engine, message) {
                            pending = None;
                        }
                    }
                    None => {
                        info!("All engine handles dropped");
                        break;
                    }
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if let Some((_, target)) = pending.take() {
                    engine.complete_transit(&target);
                }
            }
            _ = ticker.tick(), if pending.is_none() => {
                if let Some(transit) = engine.tick() {
                    debug!(to = %transit.target, delay_ms = transit.delay.as_millis() as u64, "Delaying transition");
                    pending = Some((Instant::now() + transit.delay, transit.target));
                }
            }
            _ = watcher.tick() => {
                if engine.check_source() {
                    pending = None;
                }
            }
        }
    }

    info!("Engine task stopped");
}

/// Process one message; returns whether the engine restarted
fn handle_message(engine: &mut RuleEngine, message: EngineMessage) -> bool {
    match message {
        EngineMessage::SetState {
            kind,
            key,
            value,
            reply,
        } => {
            let changed = engine.set_state(&kind, &key, value);
            if let Some(reply) = reply {
                let _ = reply.send(changed);
            }
        }
        EngineMessage::Command {
            path,
            payload,
            reply,
        } => {
            let restarting = path.len() == 1 && path[0] == "restart";
            let report = engine.handle_command(&path, &payload);
            let _ = reply.send(report);
            return restarting;
        }
        EngineMessage::Peer(text) => engine.handle_peer(&text),
        EngineMessage::Restart(reply) => {
            if let Err(err) = engine.restart() {
                error!(error = %err, "Restart failed");
            }
            let _ = reply.send(());
            return true;
        }
        EngineMessage::CurrentState(reply) => {
            let _ = reply.send(engine.current_state().map(str::to_string));
        }
        EngineMessage::GetState { kind, key, reply } => {
            let _ = reply.send(engine.get_state(&kind, &key).cloned());
        }
        EngineMessage::Snapshot(reply) => {
            let _ = reply.send(engine.state().clone());
        }
    }
    false
}

/// Cloneable handle to a running engine task
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineMessage>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_timeout: Duration,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> EngineMessage,
    ) -> EngineResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    /// Write a state slot and wait for the evaluation it triggers
    pub async fn set_state(
        &self,
        kind: impl Into<String>,
        key: impl Into<String>,
        value: Value,
    ) -> EngineResult<bool> {
        let (kind, key) = (kind.into(), key.into());
        self.request(|reply| EngineMessage::SetState {
            kind,
            key,
            value,
            reply: Some(reply),
        })
        .await
    }

    /// Write a state slot without waiting; usable from non-async callbacks
    ///
    /// The change is dropped with a warning when the channel is full.
    pub fn notify_state(
        &self,
        kind: impl Into<String>,
        key: impl Into<String>,
        value: Value,
    ) -> EngineResult<()> {
        let message = EngineMessage::SetState {
            kind: kind.into(),
            key: key.into(),
            value,
            reply: None,
        };
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!(?message, "Engine channel full, dropping state change");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EngineError::Closed),
        }
    }

    /// Run a bus command; returns the report of `[]`
    pub async fn command(&self, path: Vec<String>, payload: impl Into<String>) -> EngineResult<Option<String>> {
        let payload = payload.into();
        self.request(|reply| EngineMessage::Command {
            path,
            payload,
            reply,
        })
        .await
    }

    pub async fn peer_message(&self, text: impl Into<String>) -> EngineResult<()> {
        self.tx
            .send(EngineMessage::Peer(text.into()))
            .await
            .map_err(|_| EngineError::Closed)
    }

    /// Reload the rules and re-enter the initial state
    pub async fn restart(&self) -> EngineResult<()> {
        self.request(EngineMessage::Restart).await
    }

    pub async fn current_state(&self) -> EngineResult<Option<String>> {
        self.request(EngineMessage::CurrentState).await
    }

    pub async fn get_state(
        &self,
        kind: impl Into<String>,
        key: impl Into<String>,
    ) -> EngineResult<Option<Value>> {
        let (kind, key) = (kind.into(), key.into());
        self.request(|reply| EngineMessage::GetState { kind, key, reply })
            .await
    }

    /// Copy of the whole state table
    pub async fn snapshot(&self) -> EngineResult<GlobalState> {
        self.request(EngineMessage::Snapshot).await
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Stop the task and wait for it, up to the shutdown timeout
    ///
    /// An event being processed is allowed to finish.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());

        let Some(task) = self.task.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(self.shutdown_timeout, task).await {
            Ok(Ok(())) => debug!("Engine task joined"),
            Ok(Err(err)) => error!(error = %err, "Engine task failed"),
            Err(_) => warn!("Engine task did not stop in time"),
        }
    }
}
