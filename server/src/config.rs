//! Server configuration from the environment.

use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use soundtag_engine::EngineConfig;
use soundtag_ipc::OutputFormat;
use soundtag_transcoder::TranscoderConfig;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 3000;

/// Default upload size limit in megabytes.
pub const DEFAULT_MAX_UPLOAD_MB: usize = 100;

/// Pages shipped with this crate.
pub const DEFAULT_PUBLIC_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/public");

/// A configuration variable could not be parsed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid {var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything the server needs to start.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind (`SOUNDTAG_BIND`).
    pub bind: IpAddr,

    /// Port to listen on (`PORT`).
    pub port: u16,

    /// Uploaded and playable files (`SOUNDTAG_SOUNDS_DIR`).
    pub sounds_dir: PathBuf,

    /// Static control and listener pages (`SOUNDTAG_PUBLIC_DIR`).
    pub public_dir: PathBuf,

    /// Transcoder executable (`SOUNDTAG_FFMPEG`).
    pub ffmpeg: PathBuf,

    /// Broadcast bitrate (`SOUNDTAG_BITRATE_KBPS`).
    pub bitrate_kbps: u32,

    /// Largest accepted upload (`SOUNDTAG_MAX_UPLOAD_MB`).
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            sounds_dir: PathBuf::from("sounds"),
            public_dir: PathBuf::from(DEFAULT_PUBLIC_DIR),
            ffmpeg: PathBuf::from("ffmpeg"),
            bitrate_kbps: OutputFormat::default().bitrate_kbps,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_MB * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Read the process environment; unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let bitrate_kbps = parse(&lookup, "SOUNDTAG_BITRATE_KBPS", defaults.bitrate_kbps)?;
        if bitrate_kbps == 0 {
            return Err(ConfigError::Invalid {
                var: "SOUNDTAG_BITRATE_KBPS",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        let max_upload_mb = parse(&lookup, "SOUNDTAG_MAX_UPLOAD_MB", DEFAULT_MAX_UPLOAD_MB)?;

        Ok(Self {
            bind: parse(&lookup, "SOUNDTAG_BIND", defaults.bind)?,
            port: parse(&lookup, "PORT", defaults.port)?,
            sounds_dir: lookup("SOUNDTAG_SOUNDS_DIR").map_or(defaults.sounds_dir, PathBuf::from),
            public_dir: lookup("SOUNDTAG_PUBLIC_DIR").map_or(defaults.public_dir, PathBuf::from),
            ffmpeg: lookup("SOUNDTAG_FFMPEG").map_or(defaults.ffmpeg, PathBuf::from),
            bitrate_kbps,
            max_upload_bytes: max_upload_mb.saturating_mul(1024 * 1024),
        })
    }

    /// Address the HTTP listener binds.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    /// Encoding every listener receives.
    pub fn output_format(&self) -> OutputFormat {
        OutputFormat {
            bitrate_kbps: self.bitrate_kbps,
            ..OutputFormat::default()
        }
    }

    /// Engine settings derived from this configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            transcoder: TranscoderConfig {
                program: self.ffmpeg.clone(),
                output: self.output_format(),
                ..TranscoderConfig::default()
            },
            ..EngineConfig::default()
        }
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var: &str| vars.get(var).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.socket_addr(), "0.0.0.0:3000".parse().unwrap());
        assert_eq!(config.sounds_dir, PathBuf::from("sounds"));
        assert_eq!(config.public_dir, PathBuf::from(DEFAULT_PUBLIC_DIR));
        assert!(config.public_dir.join("control/index.html").is_file());
        assert!(config.public_dir.join("listener/index.html").is_file());
        assert_eq!(config.bitrate_kbps, 128);
        assert_eq!(config.max_upload_bytes, 100 * 1024 * 1024);
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("PORT", "8080"),
            ("SOUNDTAG_BIND", "127.0.0.1"),
            ("SOUNDTAG_SOUNDS_DIR", "/srv/sounds"),
            ("SOUNDTAG_FFMPEG", "/usr/local/bin/ffmpeg"),
            ("SOUNDTAG_BITRATE_KBPS", "192"),
        ]))
        .unwrap();

        assert_eq!(config.socket_addr(), "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.sounds_dir, PathBuf::from("/srv/sounds"));

        let engine = config.engine_config();
        assert_eq!(engine.transcoder.program, PathBuf::from("/usr/local/bin/ffmpeg"));
        assert_eq!(engine.transcoder.output.bitrate_kbps, 192);
    }

    #[test]
    fn test_invalid_values_are_errors() {
        let err = ServerConfig::from_lookup(lookup(&[("PORT", "eighty")])).unwrap_err();
        assert!(err.to_string().starts_with("Invalid PORT=\"eighty\""));

        assert!(ServerConfig::from_lookup(lookup(&[("SOUNDTAG_BITRATE_KBPS", "0")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("SOUNDTAG_BIND", "nowhere")])).is_err());
    }
}
