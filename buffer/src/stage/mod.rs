//! Buffer stage - connects an upstream source and a downstream sink to a buffer
//!
//! # Data flow
//!
//! ```text
//!                    ┌──────────── BufferStage ─────────────┐
//! upstream ─Message─►│ input task ──push──► Buffer          │
//!          ◄Response─│     ▲                  │ next/shift  │
//!                    │     └─ relay ◄── output task ────────┼─Message─► downstream
//!                    │                        ▲             │
//!                    │                        └─────────────┼◄Response─
//!                    └──────────────────────────────────────┘
//! ```
//!
//! Storing buffers answer upstream as soon as the push lands. Deferring
//! buffers (passthrough) answer with whatever the downstream replied, carried
//! from the output task to the input task over the relay channel.
//!
//! # Lifecycle
//!
//! `Idle → Receiving | Listening → Running → Closing → Closed`
//!
//! Closing the inbound channel drains the buffer first. `close_async` stops
//! both tasks without draining.

mod runner;

use crate::buffer::Buffer;
use crate::config::BufferConfig;
use crate::error::{Result, VarastoError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use varasto_core::{Message, Response};

/// Lifecycle state of a [`BufferStage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// Nothing started
    Idle,
    /// Input task running, no listener yet
    Receiving,
    /// Output task running, no input yet
    Listening,
    /// Both tasks running
    Running,
    /// Shutting down or draining
    Closing,
    /// All tasks ended
    Closed,
}

impl StageState {
    fn is_shutting_down(self) -> bool {
        matches!(self, StageState::Closing | StageState::Closed)
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageState::Idle => "idle",
            StageState::Receiving => "receiving",
            StageState::Listening => "listening",
            StageState::Running => "running",
            StageState::Closing => "closing",
            StageState::Closed => "closed",
        };
        f.write_str(name)
    }
}

struct Lifecycle {
    state: StageState,
    receiving: bool,
    listening: bool,
    tasks: usize,
}

/// State shared between the stage handle and its tasks
pub(crate) struct Shared {
    pub(crate) buffer: Arc<dyn Buffer>,
    lifecycle: Mutex<Lifecycle>,
    /// `true` once the tasks must stop
    shutdown: watch::Sender<bool>,
    /// `true` once every task has ended
    closed: watch::Sender<bool>,
    fatal: Mutex<Option<String>>,
}

impl Shared {
    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Move to Closing without stopping the tasks (graceful drain)
    pub(crate) fn begin_close(&self) {
        let mut lc = self.lifecycle.lock();
        if !lc.state.is_shutting_down() {
            lc.state = StageState::Closing;
        }
    }

    /// Stop both tasks and close the buffer
    pub(crate) fn shutdown_now(&self) {
        {
            let mut lc = self.lifecycle.lock();
            match lc.state {
                StageState::Closed => {}
                _ if lc.tasks == 0 => {
                    lc.state = StageState::Closed;
                    self.closed.send_replace(true);
                }
                _ => lc.state = StageState::Closing,
            }
        }
        self.shutdown.send_replace(true);
        // Idempotent; a stage that closed by draining still flushes here
        self.buffer.close();
    }

    /// Record a storage failure and bring the stage down
    pub(crate) fn fail(&self, err: &VarastoError) {
        error!(
            strategy = self.buffer.strategy_name(),
            error = %err,
            "Buffer stage failed, shutting down"
        );
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_none() {
                *fatal = Some(err.to_string());
            }
        }
        self.shutdown_now();
    }

    fn task_started(&self) {
        self.lifecycle.lock().tasks += 1;
    }

    fn task_finished(&self) {
        let mut lc = self.lifecycle.lock();
        lc.tasks = lc.tasks.saturating_sub(1);
        if lc.state != StageState::Closed {
            lc.state = StageState::Closing;
        }
        if lc.tasks == 0 && lc.state != StageState::Closed {
            lc.state = StageState::Closed;
            self.closed.send_replace(true);
            info!(
                strategy = self.buffer.strategy_name(),
                backlog = self.buffer.backlog(),
                "Buffer stage closed"
            );
        }
    }
}

/// Decrements the task count when a stage task ends, even by panic
pub(crate) struct TaskGuard(Arc<Shared>);

impl TaskGuard {
    fn new(shared: &Arc<Shared>) -> Self {
        shared.task_started();
        Self(Arc::clone(shared))
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.0
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.task_finished();
    }
}

/// Channel ends not yet handed out
struct Channels {
    outbound_tx: Option<mpsc::Sender<Message>>,
    outbound_rx: Option<mpsc::Receiver<Message>>,
    upstream_tx: Option<mpsc::Sender<Response>>,
    upstream_rx: Option<mpsc::Receiver<Response>>,
    relay_tx: Option<mpsc::Sender<Response>>,
    relay_rx: Option<mpsc::Receiver<Response>>,
}

/// Pipeline stage that stores messages in a [`Buffer`] between an upstream
/// source and a downstream sink
///
/// Every message read from `message_chan()` must be answered with exactly
/// one [`Response`] on the channel passed to `start_listening`, and every
/// response on `response_chan()` must be read, or the stage stalls.
pub struct BufferStage {
    shared: Arc<Shared>,
    channels: Mutex<Channels>,
}

impl BufferStage {
    /// Create a stage around `buffer` with single-slot channels
    pub fn new(buffer: Arc<dyn Buffer>) -> Self {
        Self::with_capacity(buffer, 1)
    }

    /// Create a stage whose outbound and upstream channels hold `capacity`
    pub fn with_capacity(buffer: Arc<dyn Buffer>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        let (upstream_tx, upstream_rx) = mpsc::channel(capacity);
        let (relay_tx, relay_rx) = mpsc::channel(1);
        let (shutdown, _) = watch::channel(false);
        let (closed, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                buffer,
                lifecycle: Mutex::new(Lifecycle {
                    state: StageState::Idle,
                    receiving: false,
                    listening: false,
                    tasks: 0,
                }),
                shutdown,
                closed,
                fatal: Mutex::new(None),
            }),
            channels: Mutex::new(Channels {
                outbound_tx: Some(outbound_tx),
                outbound_rx: Some(outbound_rx),
                upstream_tx: Some(upstream_tx),
                upstream_rx: Some(upstream_rx),
                relay_tx: Some(relay_tx),
                relay_rx: Some(relay_rx),
            }),
        }
    }

    /// Build the configured buffer and wrap it in a stage
    pub fn from_config(config: &BufferConfig) -> Result<Self> {
        config.validate()?;
        let strategy = config.strategy();
        let buffer = strategy.build()?;
        info!(strategy = strategy.name(), "Buffer stage created");
        Ok(Self::new(buffer))
    }

    /// Bind the inbound channel and start the input task
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_receiving(&self, inbound: mpsc::Receiver<Message>) -> Result<()> {
        {
            let mut lc = self.shared.lifecycle.lock();
            if lc.receiving {
                return Err(VarastoError::AlreadyStarted("receiving"));
            }
            if lc.state.is_shutting_down() {
                return Err(VarastoError::Closed);
            }
            lc.receiving = true;
            lc.state = match lc.state {
                StageState::Listening => StageState::Running,
                _ => StageState::Receiving,
            };
        }

        let (upstream, relay) = {
            let mut ch = self.channels.lock();
            (ch.upstream_tx.take(), ch.relay_rx.take())
        };
        let upstream = upstream.ok_or(VarastoError::AlreadyStarted("receiving"))?;
        let relay = if self.shared.buffer.defers_ack() {
            relay
        } else {
            None
        };

        let guard = TaskGuard::new(&self.shared);
        tokio::spawn(runner::input_loop(guard, inbound, upstream, relay));
        info!(
            strategy = self.shared.buffer.strategy_name(),
            "Buffer stage receiving"
        );
        Ok(())
    }

    /// Bind the downstream response channel and start the output task
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_listening(&self, responses: mpsc::Receiver<Response>) -> Result<()> {
        {
            let mut lc = self.shared.lifecycle.lock();
            if lc.listening {
                return Err(VarastoError::AlreadyStarted("listening"));
            }
            if lc.state.is_shutting_down() {
                return Err(VarastoError::Closed);
            }
            lc.listening = true;
            lc.state = match lc.state {
                StageState::Receiving => StageState::Running,
                _ => StageState::Listening,
            };
        }

        let (outbound, relay) = {
            let mut ch = self.channels.lock();
            (ch.outbound_tx.take(), ch.relay_tx.take())
        };
        let outbound = outbound.ok_or(VarastoError::AlreadyStarted("listening"))?;
        let relay = if self.shared.buffer.defers_ack() {
            relay
        } else {
            None
        };

        let guard = TaskGuard::new(&self.shared);
        tokio::spawn(runner::output_loop(guard, outbound, responses, relay));
        info!(
            strategy = self.shared.buffer.strategy_name(),
            "Buffer stage listening"
        );
        Ok(())
    }

    /// Outbound messages for the downstream sink (handed out once)
    pub fn message_chan(&self) -> Option<mpsc::Receiver<Message>> {
        self.channels.lock().outbound_rx.take()
    }

    /// Responses for the upstream source (handed out once)
    pub fn response_chan(&self) -> Option<mpsc::Receiver<Response>> {
        self.channels.lock().upstream_rx.take()
    }

    /// Signal shutdown and close the buffer without waiting
    ///
    /// Idempotent. Messages still in a storing buffer stay there; for the
    /// mmap buffer they are picked up again on the next start.
    pub fn close_async(&self) {
        self.shared.shutdown_now();
    }

    /// Wait until every task has ended
    ///
    /// Returns `Timeout` if `timeout` elapses first. Shutdown keeps going
    /// either way, so a later call may still succeed.
    pub async fn wait_for_close(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.closed()).await {
            Ok(()) => Ok(()),
            Err(_) => Err(VarastoError::Timeout(timeout)),
        }
    }

    /// Resolve once the stage is closed
    pub async fn closed(&self) {
        let mut closed = self.shared.closed.subscribe();
        // The sender lives in `shared`, which we hold
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Current lifecycle state
    pub fn state(&self) -> StageState {
        self.shared.lifecycle.lock().state
    }

    /// Encoded bytes pending in the buffer
    pub fn backlog(&self) -> usize {
        self.shared.buffer.backlog()
    }

    /// The buffer this stage drives
    pub fn buffer(&self) -> &Arc<dyn Buffer> {
        &self.shared.buffer
    }

    /// First storage failure that stopped the stage, if any
    pub fn fatal_error(&self) -> Option<String> {
        self.shared.fatal.lock().clone()
    }
}

impl fmt::Debug for BufferStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferStage")
            .field("strategy", &self.shared.buffer.strategy_name())
            .field("state", &self.state())
            .field("backlog", &self.backlog())
            .finish()
    }
}
