//! Common types used across engine messages.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// What the active transcoder process should produce.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum SourceSpec {
    /// Generated silence, used while idle.
    Silence,

    /// An audio file on local storage.
    File(PathBuf),
}

impl SourceSpec {
    /// Create a file source.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    /// Returns true for the silence source.
    pub fn is_silence(&self) -> bool {
        matches!(self, Self::Silence)
    }

    /// Returns the file path, if this is a file source.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Silence => None,
            Self::File(path) => Some(path),
        }
    }
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Silence => write!(f, "silence"),
            Self::File(path) => write!(f, "file {}", path.display()),
        }
    }
}

/// Fixed encoding of every byte broadcast to listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFormat {
    /// Container/codec name understood by the transcoder (e.g. "mp3").
    pub codec: String,

    /// Sample rate in Hz.
    pub sample_rate: u32,

    /// Number of channels.
    pub channels: u16,

    /// Constant bitrate in kbps.
    pub bitrate_kbps: u32,
}

impl OutputFormat {
    /// MIME type listeners must be given for this encoding.
    pub fn content_type(&self) -> &'static str {
        match self.codec.as_str() {
            "mp3" => "audio/mpeg",
            "adts" | "aac" => "audio/aac",
            "ogg" | "opus" => "audio/ogg",
            "wav" => "audio/wav",
            _ => "application/octet-stream",
        }
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self {
            codec: "mp3".to_string(),
            sample_rate: 44_100,
            channels: 2,
            bitrate_kbps: 128,
        }
    }
}

/// Broadcast metrics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamMetrics {
    /// Chunks forwarded to the listener registry.
    pub chunks_broadcast: u64,

    /// Bytes forwarded to the listener registry.
    pub bytes_broadcast: u64,

    /// Currently registered listeners.
    pub listeners: usize,

    /// Listeners removed after a failed write, since startup.
    pub listeners_evicted: u64,

    /// Successful source switches, including automatic ones.
    pub switches: u64,

    /// Switch attempts that failed to start a transcoder.
    pub failed_switches: u64,

    /// Current session generation.
    pub generation: u64,

    /// Whether a transcoder process is currently installed.
    pub source_active: bool,

    /// Output bitrate observed since the previous report, in kbps.
    pub bitrate_kbps: u32,

    /// Engine uptime in seconds.
    pub uptime_seconds: u64,
}

/// Types of operational warnings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WarningType {
    /// Listeners were evicted because their connection failed or stalled.
    ListenersEvicted { count: u64 },

    /// No transcoder is running; listeners receive no bytes.
    NoActiveSource,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_spec_display() {
        assert_eq!(SourceSpec::Silence.to_string(), "silence");
        assert_eq!(
            SourceSpec::file("sounds/a.mp3").to_string(),
            "file sounds/a.mp3"
        );
    }

    #[test]
    fn test_source_spec_serde_shape() {
        let json = serde_json::to_value(SourceSpec::file("a.mp3")).unwrap();
        assert_eq!(json, serde_json::json!({ "kind": "file", "path": "a.mp3" }));

        let json = serde_json::to_value(SourceSpec::Silence).unwrap();
        assert_eq!(json, serde_json::json!({ "kind": "silence" }));
    }

    #[test]
    fn test_output_format_defaults() {
        let format = OutputFormat::default();
        assert_eq!(format.content_type(), "audio/mpeg");
        assert_eq!(format.bitrate_kbps, 128);
    }
}
