//! Active session bookkeeping and the forward gate.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use tracing::{debug, warn};

use soundtag_ipc::SourceSpec;
use soundtag_transcoder::TranscoderHandle;

/// Generation counter that decides which reader loop may broadcast.
///
/// The engine advances it when it installs a session. A reader forwards a
/// chunk only through [`forward_if_current`](Self::forward_if_current),
/// which holds the lock across the fan-out: after `advance` returns, no
/// superseded reader can emit another chunk, and two readers never
/// broadcast at once.
#[derive(Debug, Default)]
pub struct ForwardGate {
    current: Mutex<u64>,
}

impl ForwardGate {
    /// Create a gate at generation 0 (nothing installed).
    pub fn new() -> Self {
        Self::default()
    }

    /// The installed generation.
    pub fn current(&self) -> u64 {
        *self.current.lock()
    }

    /// Install the next generation and return it.
    pub fn advance(&self) -> u64 {
        let mut current = self.current.lock();
        *current += 1;
        *current
    }

    /// Run `forward` if `generation` is still installed. Returns false if superseded.
    pub fn forward_if_current(&self, generation: u64, forward: impl FnOnce()) -> bool {
        let current = self.current.lock();
        if *current != generation {
            return false;
        }
        forward();
        true
    }
}

/// The installed transcoder and its reader loop.
pub(crate) struct ActiveSession {
    pub generation: u64,
    pub handle: TranscoderHandle,
    pub reader: Option<ReaderThread>,
    pub started_at: Instant,
}

impl ActiveSession {
    pub fn spec(&self) -> &SourceSpec {
        self.handle.spec()
    }

    /// Kill the process and wait up to `join_timeout` for the reader loop.
    ///
    /// The gate must already have moved past this session's generation.
    pub fn shutdown(mut self, join_timeout: Duration) {
        self.handle.terminate();

        debug!(
            generation = self.generation,
            source = %self.handle.spec(),
            played_ms = self.started_at.elapsed().as_millis() as u64,
            "Session retired"
        );

        if let Some(reader) = self.reader.take() {
            reader.join(join_timeout);
        }
    }
}

/// A reader loop thread whose exit can be awaited with a timeout.
pub(crate) struct ReaderThread {
    thread: JoinHandle<()>,
    done: Receiver<()>,
}

impl ReaderThread {
    /// Spawn `run` on a named thread.
    pub fn spawn(name: String, run: impl FnOnce() + Send + 'static) -> std::io::Result<Self> {
        let (done_tx, done) = crossbeam_channel::bounded::<()>(0);
        let thread = thread::Builder::new().name(name).spawn(move || {
            let _done = done_tx;
            run();
        })?;
        Ok(Self { thread, done })
    }

    /// Wait up to `timeout` for the thread to exit, then detach it.
    pub fn join(self, timeout: Duration) {
        if let Err(RecvTimeoutError::Timeout) = self.done.recv_timeout(timeout) {
            // Still blocked on a pipe held open by a grandchild; it exits once that closes.
            warn!("Reader loop did not exit in {:?}, detaching", timeout);
            return;
        }

        if self.thread.join().is_err() {
            warn!("Reader loop panicked");
        }
    }
}
