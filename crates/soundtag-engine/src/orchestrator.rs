//! Main engine orchestrator.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver, SendTimeoutError, Sender};
use parking_lot::RwLock;
use tracing::{debug, error, info, instrument, trace, warn};

use soundtag_ipc::{
    EngineCommand, EngineEvent, EngineState, SourceSpec, SwitchError, SwitchReason, SwitchResult,
};
use soundtag_transcoder::{ChunkStream, SourceCommand, TranscoderHandle};

use crate::handle::EngineHandle;
use crate::metrics::MetricsCollector;
use crate::registry::ListenerRegistry;
use crate::state::{ActiveSession, ForwardGate, ReaderThread};
use crate::EngineConfig;

/// Command loop poll interval; also drives restarts and metrics.
const TICK: Duration = Duration::from_millis(100);

/// How long a retired reader loop gets to exit before it is detached.
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Retry interval for a reader loop reporting end-of-stream to a busy engine.
const END_NOTIFY_RETRY: Duration = Duration::from_millis(100);

/// A silence process that ran at least this long resets the restart backoff.
const STABLE_RUN: Duration = Duration::from_secs(10);

struct PendingRestart {
    attempt: u32,
    due: Instant,
}

/// The broadcast engine.
///
/// Owns the active session and performs every switch on its own thread, so
/// switches are serialised by the command queue. The engine stops on
/// `Shutdown` or once every sender of its command channel is gone.
pub struct Engine {
    command_rx: Receiver<EngineCommand>,
    ended_tx: Sender<u64>,
    ended_rx: Receiver<u64>,
    event_tx: Sender<EngineEvent>,
    config: EngineConfig,
    source_command: Arc<dyn SourceCommand>,
    state: Arc<RwLock<EngineState>>,
    registry: Arc<ListenerRegistry>,
    metrics: Arc<MetricsCollector>,
    gate: Arc<ForwardGate>,
    session: Option<ActiveSession>,
    restart: Option<PendingRestart>,
    restart_streak: u32,
    last_metrics_report: Instant,
}

impl Engine {
    /// Create a new engine. Nothing is spawned until [`run`](Self::run).
    pub fn new(
        config: EngineConfig,
        source_command: Arc<dyn SourceCommand>,
        command_rx: Receiver<EngineCommand>,
        event_tx: Sender<EngineEvent>,
    ) -> Self {
        let (ended_tx, ended_rx) = crossbeam_channel::bounded(soundtag_ipc::COMMAND_CHANNEL_CAPACITY);

        Self {
            command_rx,
            ended_tx,
            ended_rx,
            event_tx,
            config,
            source_command,
            state: Arc::new(RwLock::new(EngineState::default())),
            registry: Arc::new(ListenerRegistry::new()),
            metrics: Arc::new(MetricsCollector::new()),
            gate: Arc::new(ForwardGate::new()),
            session: None,
            restart: None,
            restart_streak: 0,
            last_metrics_report: Instant::now(),
        }
    }

    /// A handle that drives this engine through `command_tx`, the sender
    /// paired with the engine's command receiver.
    pub fn handle(&self, command_tx: Sender<EngineCommand>) -> EngineHandle {
        EngineHandle::new(
            command_tx,
            Arc::clone(&self.state),
            Arc::clone(&self.registry),
            Arc::clone(&self.metrics),
            Arc::clone(&self.gate),
            self.config.reply_timeout,
            self.config.listener_buffer_chunks,
        )
    }

    /// Run the engine on a dedicated thread.
    pub fn spawn(mut self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("soundtag-engine".to_string())
            .spawn(move || self.run())
    }

    /// Run the engine (blocking) until a `Shutdown` command arrives or the
    /// command channel disconnects.
    #[instrument(name = "engine_run", skip(self))]
    pub fn run(&mut self) {
        info!("Engine starting");

        if let Err(e) = self.switch(SourceSpec::Silence, SwitchReason::Startup) {
            error!("Initial silence failed to start: {}", e);
            self.schedule_restart(1);
        }
        self.send_event(EngineEvent::Ready);

        let command_rx = self.command_rx.clone();
        let ended_rx = self.ended_rx.clone();

        loop {
            select! {
                recv(command_rx) -> command => match command {
                    Ok(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    Err(_) => {
                        info!("Command channel disconnected, shutting down");
                        break;
                    }
                },
                recv(ended_rx) -> generation => {
                    if let Ok(generation) = generation {
                        self.on_source_ended(generation);
                    }
                },
                default(TICK) => {}
            }
            self.on_tick();
        }

        self.shutdown_session();
        self.send_event(EngineEvent::Shutdown);
        info!("Engine stopped");
    }

    /// Handle a command. Returns false if engine should stop.
    fn handle_command(&mut self, command: EngineCommand) -> bool {
        debug!(?command, "Handling command");

        match command {
            EngineCommand::SwitchTo { spec, reply } => {
                let result = self.switch(spec, SwitchReason::Requested);
                if result.is_ok() {
                    self.restart_streak = 0;
                }
                if reply.try_send(result).is_err() {
                    debug!("Switch requester went away before the reply");
                }
            }
            EngineCommand::Shutdown => return false,
        }

        true
    }

    /// Start `spec`, install it, then retire the previous session.
    ///
    /// On failure nothing changes: the previous session keeps broadcasting.
    #[instrument(name = "switch_source", skip_all, fields(source = %spec, ?reason))]
    fn switch(&mut self, spec: SourceSpec, reason: SwitchReason) -> SwitchResult {
        let mut handle = match TranscoderHandle::start(
            self.source_command.as_ref(),
            spec.clone(),
            &self.config.transcoder,
        ) {
            Ok(handle) => handle,
            Err(e) => return Err(self.switch_failed(spec, reason, e.to_string())),
        };

        let Some(stream) = handle.stream() else {
            return Err(self.switch_failed(spec, reason, "transcoder output already taken".into()));
        };

        // Only this thread advances the gate.
        let generation = self.gate.current() + 1;
        let (start_tx, start_rx) = crossbeam_channel::bounded(1);
        let reader = ReaderLoop {
            generation,
            stream,
            start: start_rx,
            gate: Arc::clone(&self.gate),
            registry: Arc::clone(&self.registry),
            metrics: Arc::clone(&self.metrics),
            ended_tx: self.ended_tx.clone(),
        };
        let reader = match reader.spawn() {
            Ok(reader) => reader,
            Err(e) => {
                return Err(self.switch_failed(spec, reason, format!("failed to spawn reader loop: {e}")))
            }
        };

        self.gate.advance();
        let _ = start_tx.send(());

        let pid = handle.pid();
        let previous = self.session.replace(ActiveSession {
            generation,
            handle,
            reader: Some(reader),
            started_at: Instant::now(),
        });
        if let Some(previous) = previous {
            previous.shutdown(READER_JOIN_TIMEOUT);
        }

        self.restart = None;
        self.metrics.record_switch();
        self.metrics.set_source_active(true);

        let current = EngineState::for_source(&spec, generation);
        self.transition_to(current.clone(), reason);
        info!(generation, pid, "Switched source");

        Ok(current)
    }

    fn switch_failed(&self, spec: SourceSpec, reason: SwitchReason, cause: String) -> SwitchError {
        warn!(source = %spec, ?reason, "Switch failed: {}", cause);
        self.metrics.record_failed_switch();
        self.send_event(EngineEvent::SwitchFailed {
            spec: spec.clone(),
            reason,
            message: cause.clone(),
        });
        SwitchError::StartFailure { spec, cause }
    }

    fn on_source_ended(&mut self, generation: u64) {
        if generation != self.gate.current() {
            debug!(generation, "Ignoring end of superseded source");
            return;
        }
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let spec = session.spec().clone();
        let ran_for = session.started_at.elapsed();
        let stderr = session.handle.stderr_tail();

        info!(generation, source = %spec, ?ran_for, "Source ended");
        self.metrics.set_source_active(false);
        self.send_event(EngineEvent::SourceEnded {
            spec: spec.clone(),
            generation,
        });

        if spec.is_silence() {
            warn!(%stderr, "Silence transcoder exited unexpectedly");
            let attempt = next_restart_attempt(self.restart_streak, ran_for);
            self.schedule_restart(attempt);
        } else if let Err(e) = self.switch(SourceSpec::Silence, SwitchReason::SourceEnded) {
            error!("Fallback to silence failed: {}", e);
            self.schedule_restart(1);
        }
    }

    fn schedule_restart(&mut self, attempt: u32) {
        let delay = self.config.restart.delay_for_attempt(attempt);
        warn!(attempt, ?delay, "Scheduling silence restart");
        self.restart_streak = attempt;
        self.restart = Some(PendingRestart {
            attempt,
            due: Instant::now() + delay,
        });
    }

    fn on_tick(&mut self) {
        let due = self
            .restart
            .as_ref()
            .filter(|pending| Instant::now() >= pending.due)
            .map(|pending| pending.attempt);

        if let Some(attempt) = due {
            self.restart = None;
            if let Err(e) = self.switch(SourceSpec::Silence, SwitchReason::Recovery) {
                warn!(attempt, "Silence restart failed: {}", e);
                self.schedule_restart(attempt.saturating_add(1));
            }
        }

        if self.last_metrics_report.elapsed() >= self.config.metrics_interval {
            self.emit_metrics();
        }
    }

    fn emit_metrics(&mut self) {
        let evicted = self.registry.total_evicted();
        let metrics = self
            .metrics
            .snapshot(self.registry.len(), evicted, self.gate.current());
        debug!(
            listeners = metrics.listeners,
            bitrate_kbps = metrics.bitrate_kbps,
            "Metrics"
        );
        self.send_event(EngineEvent::Metrics(metrics));

        for warning in self.metrics.check_warnings(evicted) {
            warn!(?warning, "Performance warning");
            self.send_event(EngineEvent::PerformanceWarning(warning));
        }

        self.metrics.mark_reported(evicted);
        self.last_metrics_report = Instant::now();
    }

    fn shutdown_session(&mut self) {
        self.restart = None;
        if let Some(session) = self.session.take() {
            self.gate.advance();
            session.shutdown(READER_JOIN_TIMEOUT);
        }
        self.metrics.set_source_active(false);

        let disconnected = self.registry.clear();
        if disconnected > 0 {
            info!(listeners = disconnected, "Disconnected listeners");
        }
    }

    fn transition_to(&self, new_state: EngineState, reason: SwitchReason) {
        let previous = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, new_state.clone())
        };

        debug!(
            previous = %previous.name(),
            current = %new_state.name(),
            reason = reason.message(),
            "State transition"
        );

        self.send_event(EngineEvent::StateChanged {
            previous: Box::new(previous),
            current: Box::new(new_state),
            reason,
        });
    }

    fn send_event(&self, event: EngineEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            warn!("Failed to send event: {}", e);
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown_session();
    }
}

/// Forwards one session's chunks to the registry while its generation is installed.
struct ReaderLoop {
    generation: u64,
    stream: ChunkStream,
    start: Receiver<()>,
    gate: Arc<ForwardGate>,
    registry: Arc<ListenerRegistry>,
    metrics: Arc<MetricsCollector>,
    ended_tx: Sender<u64>,
}

impl ReaderLoop {
    fn spawn(self) -> std::io::Result<ReaderThread> {
        ReaderThread::spawn(format!("soundtag-reader-{}", self.generation), move || self.run())
    }

    fn run(self) {
        let ReaderLoop {
            generation,
            stream,
            start,
            gate,
            registry,
            metrics,
            ended_tx,
        } = self;

        // Wait until the engine has installed this generation.
        if start.recv().is_err() {
            return;
        }

        for chunk in stream {
            let forwarded = gate.forward_if_current(generation, || {
                let report = registry.broadcast(&chunk);
                metrics.record_chunk(chunk.len());
                trace!(
                    generation,
                    len = chunk.len(),
                    delivered = report.delivered,
                    "Chunk broadcast"
                );
            });

            if !forwarded {
                debug!(generation, "Reader loop superseded");
                return;
            }
        }

        notify_source_ended(generation, &gate, &ended_tx);
    }
}

fn notify_source_ended(generation: u64, gate: &ForwardGate, ended_tx: &Sender<u64>) {
    loop {
        // Stop retrying once superseded; the engine may be joining this thread.
        if gate.current() != generation {
            return;
        }

        match ended_tx.send_timeout(generation, END_NOTIFY_RETRY) {
            Ok(()) => {
                debug!(generation, "Source stream ended");
                return;
            }
            Err(SendTimeoutError::Timeout(_)) => {}
            Err(SendTimeoutError::Disconnected(_)) => return,
        }
    }
}

/// Backoff attempt for restarting silence after it exited having run for `ran_for`.
fn next_restart_attempt(streak: u32, ran_for: Duration) -> u32 {
    if ran_for >= STABLE_RUN {
        1
    } else {
        streak.saturating_add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quick_silence_exits_grow_the_backoff() {
        let quick = Duration::from_millis(200);
        assert_eq!(next_restart_attempt(0, quick), 1);
        assert_eq!(next_restart_attempt(1, quick), 2);
        assert_eq!(next_restart_attempt(4, quick), 5);
    }

    #[test]
    fn test_stable_silence_resets_the_backoff() {
        assert_eq!(next_restart_attempt(6, STABLE_RUN), 1);
        assert_eq!(next_restart_attempt(6, Duration::from_secs(60)), 1);
    }
}
