//! Transcoder process lifecycle.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::process::{Child, ChildStderr, ChildStdout, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, trace, warn};

use soundtag_ipc::SourceSpec;

use crate::error::TranscoderError;
use crate::{SourceCommand, TranscoderConfig, TranscoderResult, STDERR_TAIL_LINES};

/// How long an early-exited process gets to report its status before it is killed.
const EXIT_GRACE: Duration = Duration::from_millis(200);

/// One running transcoder process.
///
/// The process is killed on [`terminate`](Self::terminate) or drop; the
/// kill closes stdout, which ends the [`ChunkStream`].
pub struct TranscoderHandle {
    spec: SourceSpec,
    pid: u32,
    child: Mutex<Option<Child>>,
    stream: Option<ChunkStream>,
    stderr: StderrTail,
}

impl TranscoderHandle {
    /// Spawn the transcoder for `spec` and wait for it to prove it is producing output.
    ///
    /// Fails if the program cannot be spawned, or if the process closes its
    /// stdout without writing anything (e.g. the input file is unusable).
    #[instrument(name = "transcoder_start", skip_all, fields(source = %spec))]
    pub fn start(
        command: &dyn SourceCommand,
        spec: SourceSpec,
        config: &TranscoderConfig,
    ) -> TranscoderResult<Self> {
        let mut cmd = command.build(&spec);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let program = cmd.get_program().to_string_lossy().into_owned();
        let mut child = cmd
            .spawn()
            .map_err(|source| TranscoderError::Spawn { program, source })?;
        let pid = child.id();

        let stdout = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        let mut handle = Self {
            spec,
            pid,
            child: Mutex::new(Some(child)),
            stream: None,
            stderr: StderrTail::new(STDERR_TAIL_LINES),
        };

        let stdout = stdout.ok_or(TranscoderError::MissingPipe("stdout"))?;

        let stderr_done = match stderr_pipe {
            Some(pipe) => Some(spawn_stderr_drain(pipe, handle.stderr.clone(), pid)?),
            None => None,
        };

        let (chunk_tx, chunk_rx) = crossbeam_channel::bounded(config.chunk_channel_capacity);
        spawn_stdout_pump(stdout, chunk_tx, config.read_buffer_size, pid)?;

        let pending = match chunk_rx.recv_timeout(config.startup_probe) {
            Ok(chunk) => Some(chunk),
            Err(RecvTimeoutError::Timeout) => {
                debug!(pid, "No output within startup probe, accepting running process");
                None
            }
            Err(RecvTimeoutError::Disconnected) => {
                let status = handle.reap(EXIT_GRACE);
                if let Some(done) = stderr_done {
                    let _ = done.recv_timeout(EXIT_GRACE);
                }
                return Err(TranscoderError::ExitedEarly {
                    status,
                    stderr: handle.stderr.joined(),
                });
            }
        };

        handle.stream = Some(ChunkStream {
            pending,
            rx: chunk_rx,
        });

        info!(pid, command = command.name(), "Transcoder started");
        Ok(handle)
    }

    /// Take the chunk sequence. Returns `None` after the first call.
    pub fn stream(&mut self) -> Option<ChunkStream> {
        self.stream.take()
    }

    /// Kill and reap the process. Safe to call repeatedly.
    pub fn terminate(&self) {
        let Some(mut child) = self.child.lock().take() else {
            return;
        };

        if let Err(e) = child.kill() {
            debug!(pid = self.pid, "Kill failed (already exited?): {}", e);
        }

        match child.wait() {
            Ok(status) => debug!(pid = self.pid, %status, source = %self.spec, "Transcoder terminated"),
            Err(e) => warn!(pid = self.pid, "Failed to reap transcoder: {}", e),
        }
    }

    /// Returns true while the process has not exited and has not been terminated.
    pub fn is_running(&self) -> bool {
        match self.child.lock().as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Source this process produces.
    pub fn spec(&self) -> &SourceSpec {
        &self.spec
    }

    /// OS process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Most recent stderr lines, newline separated.
    pub fn stderr_tail(&self) -> String {
        self.stderr.joined()
    }

    /// Wait up to `grace` for a natural exit, then kill. Returns the exit status text.
    fn reap(&self, grace: Duration) -> String {
        let Some(mut child) = self.child.lock().take() else {
            return "already reaped".to_string();
        };

        let deadline = Instant::now() + grace;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return status.to_string(),
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(10)),
                Ok(None) => break,
                Err(e) => return format!("unknown status: {e}"),
            }
        }

        let _ = child.kill();
        match child.wait() {
            Ok(status) => status.to_string(),
            Err(e) => format!("unknown status: {e}"),
        }
    }
}

impl Drop for TranscoderHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Blocking sequence of output chunks; ends when the process exits or is killed.
pub struct ChunkStream {
    pending: Option<Bytes>,
    rx: Receiver<Bytes>,
}

impl Iterator for ChunkStream {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        if let Some(chunk) = self.pending.take() {
            return Some(chunk);
        }
        self.rx.recv().ok()
    }
}

/// Ring of recent stderr lines shared with the drain thread.
#[derive(Clone)]
struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl StderrTail {
    fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn joined(&self) -> String {
        let lines = self.lines.lock();
        lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

fn spawn_stdout_pump(
    stdout: ChildStdout,
    tx: Sender<Bytes>,
    buffer_size: usize,
    pid: u32,
) -> TranscoderResult<()> {
    thread::Builder::new()
        .name(format!("transcoder-stdout-{pid}"))
        .spawn(move || pump_stdout(stdout, tx, buffer_size, pid))?;
    Ok(())
}

fn pump_stdout(mut stdout: ChildStdout, tx: Sender<Bytes>, buffer_size: usize, pid: u32) {
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total: u64 = 0;

    loop {
        match stdout.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                total += n as u64;
                if tx.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    trace!(pid, "Chunk consumer gone, stopping pump");
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(pid, "Transcoder stdout read failed: {}", e);
                break;
            }
        }
    }

    debug!(pid, bytes = total, "Transcoder stdout closed");
}

/// Returns a receiver that disconnects once stderr reaches end-of-file.
fn spawn_stderr_drain(
    stderr: ChildStderr,
    tail: StderrTail,
    pid: u32,
) -> TranscoderResult<Receiver<()>> {
    let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);

    thread::Builder::new()
        .name(format!("transcoder-stderr-{pid}"))
        .spawn(move || {
            let _done = done_tx;
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) => {
                        debug!(pid, "transcoder: {}", line);
                        tail.push(line);
                    }
                    Err(_) => break,
                }
            }
        })?;

    Ok(done_rx)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Command;

    use crate::FfmpegCommand;

    /// Runs a shell script per source; file sources get the path as `$1`.
    struct ShellCommand {
        silence: &'static str,
        file: &'static str,
    }

    impl SourceCommand for ShellCommand {
        fn build(&self, spec: &SourceSpec) -> Command {
            let mut cmd = Command::new("sh");
            match spec {
                SourceSpec::Silence => {
                    cmd.arg("-c").arg(self.silence);
                }
                SourceSpec::File(path) => {
                    cmd.arg("-c").arg(self.file).arg("sh").arg(path);
                }
            }
            cmd
        }

        fn name(&self) -> &'static str {
            "sh"
        }
    }

    fn shell() -> ShellCommand {
        ShellCommand {
            silence: "while :; do printf s; sleep 0.02; done",
            file: "exec cat \"$1\"",
        }
    }

    fn config() -> TranscoderConfig {
        TranscoderConfig {
            startup_probe: Duration::from_millis(500),
            ..TranscoderConfig::default()
        }
    }

    #[test]
    fn test_file_stream_yields_contents_then_ends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.mp3");
        std::fs::write(&path, b"frame-one frame-two").unwrap();

        let mut handle = TranscoderHandle::start(&shell(), SourceSpec::file(&path), &config()).unwrap();
        let stream = handle.stream().unwrap();
        assert!(handle.stream().is_none());

        let bytes: Vec<u8> = stream.flat_map(|chunk| chunk.to_vec()).collect();
        assert_eq!(bytes, b"frame-one frame-two");
    }

    #[test]
    fn test_missing_file_is_start_failure() {
        let err = TranscoderHandle::start(
            &shell(),
            SourceSpec::file("/definitely/not/here.mp3"),
            &config(),
        )
        .err()
        .unwrap();

        match err {
            TranscoderError::ExitedEarly { stderr, .. } => {
                assert!(stderr.contains("here.mp3"), "stderr was {stderr:?}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_program_is_spawn_failure() {
        let command = FfmpegCommand::new(&TranscoderConfig {
            program: "/nonexistent/bin/ffmpeg".into(),
            ..TranscoderConfig::default()
        });

        let err = TranscoderHandle::start(&command, SourceSpec::Silence, &config())
            .err()
            .unwrap();
        assert!(matches!(err, TranscoderError::Spawn { .. }));
        assert!(err.to_string().contains("/nonexistent/bin/ffmpeg"));
    }

    #[test]
    fn test_terminate_ends_blocking_stream_promptly() {
        let mut handle = TranscoderHandle::start(&shell(), SourceSpec::Silence, &config()).unwrap();
        assert!(handle.is_running());
        let mut stream = handle.stream().unwrap();
        assert_eq!(stream.next().unwrap().as_ref(), b"s");

        let reader = thread::spawn(move || stream.count());
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        handle.terminate();
        handle.terminate();
        reader.join().unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!handle.is_running());
    }

    #[test]
    fn test_slow_starter_is_accepted_after_probe() {
        let command = ShellCommand {
            silence: "sleep 0.3; printf late",
            file: "exit 1",
        };
        let probe = TranscoderConfig {
            startup_probe: Duration::from_millis(50),
            ..TranscoderConfig::default()
        };

        let mut handle = TranscoderHandle::start(&command, SourceSpec::Silence, &probe).unwrap();
        let bytes: Vec<u8> = handle.stream().unwrap().flat_map(|c| c.to_vec()).collect();
        assert_eq!(bytes, b"late");
    }

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let tail = StderrTail::new(2);
        tail.push("one".into());
        tail.push("two".into());
        tail.push("three".into());
        assert_eq!(tail.joined(), "two\nthree");
    }
}
