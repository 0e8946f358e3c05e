//! Listener sinks.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// Identity of one connected listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkId(pub u64);

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Why a write to a listener failed. Never surfaced past the registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// The listener's connection is gone.
    #[error("Listener disconnected")]
    Closed,

    /// The listener is not draining its buffer.
    #[error("Listener buffer full")]
    Stalled,

    /// Any other write failure.
    #[error("Write failed: {0}")]
    Io(String),
}

/// A writable destination for broadcast chunks.
///
/// `write` must not block: the broadcaster calls it for every listener in
/// turn and a slow listener would delay all the others.
pub trait Sink: Send + Sync {
    /// Stable identity used for registry membership.
    fn id(&self) -> SinkId;

    /// Deliver one chunk.
    fn write(&self, chunk: &Bytes) -> Result<(), SinkError>;
}

/// Sink backed by a bounded channel; the receiving half feeds the connection.
///
/// A full channel means the listener stalled and the write fails.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    id: SinkId,
    tx: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    /// Create a sink buffering at most `capacity` chunks.
    pub fn new(id: SinkId, capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { id, tx }, rx)
    }
}

impl Sink for ChannelSink {
    fn id(&self) -> SinkId {
        self.id
    }

    fn write(&self, chunk: &Bytes) -> Result<(), SinkError> {
        match self.tx.try_send(chunk.clone()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(SinkError::Stalled),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SinkError::Closed),
        }
    }
}
