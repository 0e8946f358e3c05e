//! Engine event logging.

use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use soundtag_ipc::EngineEvent;

/// Log engine events until the engine drops its sender.
pub fn spawn_event_logger(events: Receiver<EngineEvent>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("soundtag-events".to_string())
        .spawn(move || {
            for event in events {
                log_event(&event);
            }
        })
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::StateChanged {
            previous,
            current,
            reason,
        } => info!(
            from = previous.name(),
            to = current.name(),
            generation = current.generation(),
            reason = reason.message(),
            "Now broadcasting {}",
            current.source()
        ),
        EngineEvent::SwitchFailed {
            spec,
            reason,
            message,
        } => warn!(source = %spec, ?reason, "Switch failed: {}", message),
        EngineEvent::SourceEnded { spec, generation } => {
            info!(source = %spec, generation, "Source finished")
        }
        EngineEvent::Metrics(metrics) => debug!(
            listeners = metrics.listeners,
            bitrate_kbps = metrics.bitrate_kbps,
            bytes = metrics.bytes_broadcast,
            "Stream metrics"
        ),
        EngineEvent::PerformanceWarning(warning) => warn!(?warning, "Stream warning"),
        EngineEvent::Ready => info!("Engine ready"),
        EngineEvent::Shutdown => info!("Engine shut down"),
    }
}
