//! Broadcast engine.
//!
//! Fans a single live stream out to many listeners. The engine owns one
//! transcoder session at a time and switches between silence and file
//! playback without disconnecting anyone: the new source is started and
//! installed before the old one is killed, and a generation-tagged gate
//! keeps stale reader loops from writing to listeners.

mod handle;
mod metrics;
mod orchestrator;
mod registry;
mod restart;
mod sink;
mod state;

pub use handle::EngineHandle;
pub use metrics::MetricsCollector;
pub use orchestrator::Engine;
pub use registry::{BroadcastReport, Listener, ListenerGuard, ListenerRegistry};
pub use restart::RestartPolicy;
pub use sink::{ChannelSink, Sink, SinkError, SinkId};
pub use state::ForwardGate;

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;

use soundtag_ipc::EngineEvent;
use soundtag_transcoder::{SourceCommand, TranscoderConfig};

/// Chunks buffered per listener before it counts as stalled.
pub const LISTENER_BUFFER_CHUNKS: usize = 64;

/// Base delay before restarting silence after a failure.
pub const BASE_RESTART_DELAY_MS: u64 = 1000;

/// Upper bound for the restart delay.
pub const MAX_RESTART_DELAY_MS: u64 = 10_000;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Transcoder settings used for every source.
    pub transcoder: TranscoderConfig,

    /// Per-listener buffer, in chunks.
    pub listener_buffer_chunks: usize,

    /// How long `EngineHandle::switch_to` waits for the engine.
    pub reply_timeout: Duration,

    /// Interval between metrics events.
    pub metrics_interval: Duration,

    /// Backoff for restarting silence.
    pub restart: RestartPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transcoder: TranscoderConfig::default(),
            listener_buffer_chunks: LISTENER_BUFFER_CHUNKS,
            reply_timeout: Duration::from_secs(10),
            metrics_interval: Duration::from_secs(5),
            restart: RestartPolicy::default(),
        }
    }
}

/// Create an engine and a handle to it.
///
/// The engine stops once the handle and all its clones are dropped.
pub fn create_engine(
    config: EngineConfig,
    source_command: Arc<dyn SourceCommand>,
    event_tx: Sender<EngineEvent>,
) -> (Engine, EngineHandle) {
    let (command_tx, command_rx) = soundtag_ipc::command_channel();
    let engine = Engine::new(config, source_command, command_rx, event_tx);
    let handle = engine.handle(command_tx);
    (engine, handle)
}
