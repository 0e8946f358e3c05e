//! Engine state machine types.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::SourceSpec;

/// The source currently being broadcast.
///
/// There is no terminal state: the engine moves between these two for the
/// lifetime of the process. Every transition installs a new session and bumps
/// the generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EngineState {
    /// Broadcasting generated silence.
    Silence {
        /// Generation of the installed session.
        generation: u64,
    },

    /// Broadcasting an audio file.
    PlayingFile {
        /// File being played.
        path: PathBuf,

        /// Generation of the installed session.
        generation: u64,
    },
}

impl Default for EngineState {
    fn default() -> Self {
        Self::Silence { generation: 0 }
    }
}

impl EngineState {
    /// State for a freshly installed session.
    pub fn for_source(spec: &SourceSpec, generation: u64) -> Self {
        match spec {
            SourceSpec::Silence => Self::Silence { generation },
            SourceSpec::File(path) => Self::PlayingFile {
                path: path.clone(),
                generation,
            },
        }
    }

    /// Returns true if silence is being broadcast.
    pub fn is_silence(&self) -> bool {
        matches!(self, Self::Silence { .. })
    }

    /// Returns true if a file is being broadcast.
    pub fn is_playing(&self) -> bool {
        matches!(self, Self::PlayingFile { .. })
    }

    /// Generation of the session this state describes.
    pub fn generation(&self) -> u64 {
        match self {
            Self::Silence { generation } | Self::PlayingFile { generation, .. } => *generation,
        }
    }

    /// The source behind this state.
    pub fn source(&self) -> SourceSpec {
        match self {
            Self::Silence { .. } => SourceSpec::Silence,
            Self::PlayingFile { path, .. } => SourceSpec::File(path.clone()),
        }
    }

    /// Returns a simple string representation of the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Silence { .. } => "Silence",
            Self::PlayingFile { .. } => "PlayingFile",
        }
    }
}

/// Why a switch was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwitchReason {
    /// Initial silence when the engine starts.
    Startup,

    /// A caller asked for the switch.
    Requested,

    /// The previous source's stream ended on its own.
    SourceEnded,

    /// Retry after an earlier fallback could not start.
    Recovery,
}

impl SwitchReason {
    /// Returns a display message for this reason.
    pub fn message(self) -> &'static str {
        match self {
            Self::Startup => "Engine startup",
            Self::Requested => "Requested by caller",
            Self::SourceEnded => "Source stream ended",
            Self::Recovery => "Recovering silence",
        }
    }
}
