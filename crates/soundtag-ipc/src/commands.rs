//! Commands sent from callers to the engine.

use crossbeam_channel::Sender;

use crate::error::SwitchError;
use crate::state::EngineState;
use crate::types::SourceSpec;

/// Outcome of a switch request.
pub type SwitchResult = Result<EngineState, SwitchError>;

/// Commands the engine thread processes, one at a time.
#[derive(Debug)]
pub enum EngineCommand {
    /// Replace the active source.
    SwitchTo {
        spec: SourceSpec,
        /// Where to send the outcome.
        reply: Sender<SwitchResult>,
    },

    /// Shutdown the engine completely.
    Shutdown,
}
