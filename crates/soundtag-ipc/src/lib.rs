//! Typed caller<->engine messages for the soundtag broadcaster.
//!
//! This crate defines the commands, events, state and error types exchanged
//! between the engine thread and the components driving it.

mod commands;
mod error;
mod events;
mod state;
mod types;

pub use commands::{EngineCommand, SwitchResult};
pub use error::SwitchError;
pub use events::EngineEvent;
pub use state::{EngineState, SwitchReason};
pub use types::{OutputFormat, SourceSpec, StreamMetrics, WarningType};

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for commands (callers → engine).
pub const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Channel capacity for events (engine → observers).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates a bounded command channel.
pub fn command_channel() -> (Sender<EngineCommand>, Receiver<EngineCommand>) {
    crossbeam_channel::bounded(COMMAND_CHANNEL_CAPACITY)
}

/// Creates a bounded event channel.
pub fn event_channel() -> (Sender<EngineEvent>, Receiver<EngineEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
