//! Errors returned to callers of the engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::SourceSpec;

/// Errors a switch request can report.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum SwitchError {
    /// The transcoder for the requested source could not be started.
    /// The previous session keeps running.
    #[error("Failed to start {spec}: {cause}")]
    StartFailure { spec: SourceSpec, cause: String },

    /// The engine thread is gone.
    #[error("Engine unavailable")]
    EngineUnavailable,

    /// The engine did not answer in time.
    #[error("Timed out after {0:?} waiting for the engine")]
    Timeout(Duration),
}
