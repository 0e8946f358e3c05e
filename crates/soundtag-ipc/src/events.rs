//! Events sent from the engine to its observers.

use serde::{Deserialize, Serialize};

use crate::state::{EngineState, SwitchReason};
use crate::types::{SourceSpec, StreamMetrics, WarningType};

/// Events that the engine can emit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    /// A new session was installed.
    StateChanged {
        /// Previous state.
        previous: Box<EngineState>,

        /// Current state.
        current: Box<EngineState>,

        /// Why the switch happened.
        reason: SwitchReason,
    },

    /// A switch could not start its transcoder; the previous session is untouched.
    SwitchFailed {
        spec: SourceSpec,
        reason: SwitchReason,
        message: String,
    },

    /// The current source's stream ended on its own.
    SourceEnded { spec: SourceSpec, generation: u64 },

    /// Updated stream metrics.
    Metrics(StreamMetrics),

    /// Operational warning detected.
    PerformanceWarning(WarningType),

    /// Engine is ready.
    Ready,

    /// Engine has shut down.
    Shutdown,
}
