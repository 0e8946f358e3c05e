//! External transcoder process handle.
//!
//! A transcoder is an opaque program (ffmpeg in production) that, given a
//! [`SourceSpec`], writes the broadcast encoding to its stdout. This crate
//! spawns it, exposes its output as a blocking sequence of [`Bytes`] chunks
//! and kills it on request.

mod error;
mod ffmpeg;
mod process;

pub use error::TranscoderError;
pub use ffmpeg::FfmpegCommand;
pub use process::{ChunkStream, TranscoderHandle};

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use soundtag_ipc::{OutputFormat, SourceSpec};

/// Channel capacity for chunks between the stdout pump and the reader loop.
pub const CHUNK_CHANNEL_CAPACITY: usize = 64;

/// Bytes requested per stdout read.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Lines of stderr kept for error reports.
pub const STDERR_TAIL_LINES: usize = 16;

/// Result type for transcoder operations.
pub type TranscoderResult<T> = Result<T, TranscoderError>;

/// Transcoder process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscoderConfig {
    /// Transcoder executable.
    pub program: PathBuf,

    /// Encoding every source is converted to.
    pub output: OutputFormat,

    /// Bytes requested per stdout read.
    pub read_buffer_size: usize,

    /// Chunks buffered between the stdout pump and the consumer.
    pub chunk_channel_capacity: usize,

    /// How long `start` waits for the first output before accepting the process.
    pub startup_probe: Duration,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            output: OutputFormat::default(),
            read_buffer_size: READ_BUFFER_SIZE,
            chunk_channel_capacity: CHUNK_CHANNEL_CAPACITY,
            startup_probe: Duration::from_millis(750),
        }
    }
}

/// Builds the process invocation for a source.
pub trait SourceCommand: Send + Sync {
    /// Command that writes the encoded stream for `spec` to stdout.
    ///
    /// Stdio is configured by the caller.
    fn build(&self, spec: &SourceSpec) -> Command;

    /// Name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Create the production source command.
pub fn create_source_command(config: &TranscoderConfig) -> Arc<dyn SourceCommand> {
    tracing::info!(program = %config.program.display(), "Using ffmpeg transcoder");
    Arc::new(FfmpegCommand::new(config))
}
