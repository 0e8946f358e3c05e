//! ffmpeg invocation for each source.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Command;

use soundtag_ipc::{OutputFormat, SourceSpec};

use crate::{SourceCommand, TranscoderConfig};

/// Builds ffmpeg command lines that emit the configured output on stdout.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    program: PathBuf,
    output: OutputFormat,
}

impl FfmpegCommand {
    /// Create from transcoder configuration.
    pub fn new(config: &TranscoderConfig) -> Self {
        Self {
            program: config.program.clone(),
            output: config.output.clone(),
        }
    }

    /// Full argument list for `spec`.
    ///
    /// Both inputs are read with `-re` so output is paced in real time;
    /// an unpaced `anullsrc` would flood listeners.
    pub fn args(&self, spec: &SourceSpec) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-hide_banner", "-loglevel", "error", "-nostdin", "-re"]
            .into_iter()
            .map(OsString::from)
            .collect();

        match spec {
            SourceSpec::Silence => {
                args.push("-f".into());
                args.push("lavfi".into());
                args.push("-i".into());
                args.push(
                    format!(
                        "anullsrc=channel_layout={}:sample_rate={}",
                        channel_layout(self.output.channels),
                        self.output.sample_rate
                    )
                    .into(),
                );
            }
            SourceSpec::File(path) => {
                args.push("-i".into());
                args.push(path.as_os_str().to_owned());
            }
        }

        args.extend(
            [
                "-vn".to_string(),
                "-ac".to_string(),
                self.output.channels.to_string(),
                "-ar".to_string(),
                self.output.sample_rate.to_string(),
                "-b:a".to_string(),
                format!("{}k", self.output.bitrate_kbps),
                "-f".to_string(),
                self.output.codec.clone(),
                "pipe:1".to_string(),
            ]
            .into_iter()
            .map(OsString::from),
        );

        args
    }
}

impl SourceCommand for FfmpegCommand {
    fn build(&self, spec: &SourceSpec) -> Command {
        let mut command = Command::new(&self.program);
        command.args(self.args(spec));
        command
    }

    fn name(&self) -> &'static str {
        "ffmpeg"
    }
}

fn channel_layout(channels: u16) -> &'static str {
    match channels {
        1 => "mono",
        _ => "stereo",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_of(command: &FfmpegCommand, spec: &SourceSpec) -> Vec<String> {
        command
            .args(spec)
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_silence_args() {
        let command = FfmpegCommand::new(&TranscoderConfig::default());
        let args = args_of(&command, &SourceSpec::Silence);

        let input = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[input - 1], "lavfi");
        assert_eq!(
            args[input + 1],
            "anullsrc=channel_layout=stereo:sample_rate=44100"
        );
        assert!(args.contains(&"-re".to_string()));
        assert_eq!(args.last().unwrap(), "pipe:1");
    }

    #[test]
    fn test_file_args() {
        let command = FfmpegCommand::new(&TranscoderConfig::default());
        let args = args_of(&command, &SourceSpec::file("/srv/sounds/a b.mp3"));

        let input = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[input + 1], "/srv/sounds/a b.mp3");
        assert!(!args.contains(&"lavfi".to_string()));

        let tail = &args[args.len() - 10..];
        assert_eq!(
            tail,
            &["-vn", "-ac", "2", "-ar", "44100", "-b:a", "128k", "-f", "mp3", "pipe:1"][..]
        );
    }

    #[test]
    fn test_build_uses_configured_program() {
        let config = TranscoderConfig {
            program: PathBuf::from("/opt/ffmpeg/bin/ffmpeg"),
            output: OutputFormat {
                channels: 1,
                bitrate_kbps: 64,
                ..OutputFormat::default()
            },
            ..TranscoderConfig::default()
        };
        let command = FfmpegCommand::new(&config);
        let built = command.build(&SourceSpec::Silence);

        assert_eq!(built.get_program(), "/opt/ffmpeg/bin/ffmpeg");
        let args: Vec<_> = built.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert!(args.contains(&"anullsrc=channel_layout=mono:sample_rate=44100".to_string()));
        assert!(args.contains(&"64k".to_string()));
    }
}
