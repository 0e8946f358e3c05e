//! Error types for the transcoder module.

use thiserror::Error;

/// Errors that can occur while starting a transcoder process.
#[derive(Debug, Error)]
pub enum TranscoderError {
    /// The process could not be spawned (missing executable, permissions).
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process closed its output before producing a single byte.
    #[error("Transcoder exited before producing output ({status}){}", stderr_suffix(.stderr))]
    ExitedEarly { status: String, stderr: String },

    /// A stdio pipe was not captured.
    #[error("Transcoder {0} pipe unavailable")]
    MissingPipe(&'static str),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}
