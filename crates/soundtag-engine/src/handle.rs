//! Caller-side handle to a running engine.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, SendTimeoutError, Sender};
use parking_lot::RwLock;
use tracing::debug;

use soundtag_ipc::{EngineCommand, EngineState, SourceSpec, StreamMetrics, SwitchError, SwitchResult};

use crate::metrics::MetricsCollector;
use crate::registry::{Listener, ListenerRegistry};
use crate::state::ForwardGate;

/// Cloneable handle used by connection and control code.
///
/// `switch_to` blocks the calling thread until the engine has answered; call
/// it from a blocking context when driving it from async code.
#[derive(Clone)]
pub struct EngineHandle {
    command_tx: Sender<EngineCommand>,
    state: Arc<RwLock<EngineState>>,
    registry: Arc<ListenerRegistry>,
    metrics: Arc<MetricsCollector>,
    gate: Arc<ForwardGate>,
    reply_timeout: Duration,
    listener_buffer_chunks: usize,
}

impl EngineHandle {
    pub(crate) fn new(
        command_tx: Sender<EngineCommand>,
        state: Arc<RwLock<EngineState>>,
        registry: Arc<ListenerRegistry>,
        metrics: Arc<MetricsCollector>,
        gate: Arc<ForwardGate>,
        reply_timeout: Duration,
        listener_buffer_chunks: usize,
    ) -> Self {
        Self {
            command_tx,
            state,
            registry,
            metrics,
            gate,
            reply_timeout,
            listener_buffer_chunks,
        }
    }

    /// Switch the broadcast to `spec` and wait for the outcome.
    pub fn switch_to(&self, spec: SourceSpec) -> SwitchResult {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        debug!(source = %spec, "Requesting switch");

        self.send(EngineCommand::SwitchTo {
            spec,
            reply: reply_tx,
        })?;

        match reply_rx.recv_timeout(self.reply_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(SwitchError::Timeout(self.reply_timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(SwitchError::EngineUnavailable),
        }
    }

    /// Current engine state.
    pub fn state(&self) -> EngineState {
        self.state.read().clone()
    }

    /// Metrics snapshot taken on the calling thread.
    pub fn metrics(&self) -> StreamMetrics {
        self.metrics.snapshot(
            self.registry.len(),
            self.registry.total_evicted(),
            self.gate.current(),
        )
    }

    /// The shared listener registry.
    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    /// Register a new listener with the configured buffer size.
    ///
    /// Returns `None` once the engine has shut down and disconnected its listeners.
    pub fn attach_listener(&self) -> Option<Listener> {
        self.registry.attach(self.listener_buffer_chunks)
    }

    /// Stop the engine. Safe to call after it is gone.
    pub fn shutdown(&self) {
        if self.send(EngineCommand::Shutdown).is_err() {
            debug!("Engine already stopped");
        }
    }

    fn send(&self, command: EngineCommand) -> Result<(), SwitchError> {
        self.command_tx
            .send_timeout(command, self.reply_timeout)
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => SwitchError::Timeout(self.reply_timeout),
                SendTimeoutError::Disconnected(_) => SwitchError::EngineUnavailable,
            })
    }
}
