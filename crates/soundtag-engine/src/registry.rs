//! Listener registry.
//!
//! The set of connected listeners. Connection handlers add and remove sinks
//! from any thread while the active reader loop broadcasts into it.
//! `broadcast` works on a snapshot, so membership changes never wait on (or
//! disturb) a fan-out in progress, and no lock is held while writing.
//! Once [`clear`](ListenerRegistry::clear) has run the registry is closed
//! and refuses new members.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::sink::{ChannelSink, Sink, SinkId};

/// Result of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sinks that accepted the chunk.
    pub delivered: usize,

    /// Sinks removed because their write failed.
    pub evicted: usize,
}

/// Concurrency-safe set of listener sinks, unique by [`SinkId`].
pub struct ListenerRegistry {
    sinks: RwLock<HashMap<SinkId, Arc<dyn Sink>>>,
    next_id: AtomicU64,
    evicted: AtomicU64,
    closed: AtomicBool,
}

impl ListenerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            sinks: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            evicted: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Allocate an identity for a new sink.
    pub fn next_id(&self) -> SinkId {
        SinkId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Add a sink. Returns false if a sink with the same id is already
    /// present or the registry is closed.
    pub fn add(&self, sink: Arc<dyn Sink>) -> bool {
        let id = sink.id();
        let mut sinks = self.sinks.write();
        if self.closed.load(Ordering::Acquire) {
            debug!(listener = %id, "Registry closed, listener refused");
            return false;
        }
        if sinks.contains_key(&id) {
            return false;
        }
        sinks.insert(id, sink);
        debug!(listener = %id, listeners = sinks.len(), "Listener added");
        true
    }

    /// Remove a sink. Returns false if it was not present.
    pub fn remove(&self, id: SinkId) -> bool {
        let mut sinks = self.sinks.write();
        let removed = sinks.remove(&id).is_some();
        if removed {
            debug!(listener = %id, listeners = sinks.len(), "Listener removed");
        }
        removed
    }

    /// Returns true if the sink is registered.
    pub fn contains(&self, id: SinkId) -> bool {
        self.sinks.read().contains_key(&id)
    }

    /// Number of registered sinks.
    pub fn len(&self) -> usize {
        self.sinks.read().len()
    }

    /// Returns true if no sinks are registered.
    pub fn is_empty(&self) -> bool {
        self.sinks.read().is_empty()
    }

    /// Drop every sink, ending all channel listeners, and close the registry.
    /// Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut sinks = self.sinks.write();
        self.closed.store(true, Ordering::Release);
        let removed = sinks.len();
        sinks.clear();
        removed
    }

    /// Returns true once [`clear`](Self::clear) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sinks evicted by failed writes since creation.
    pub fn total_evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// Send `chunk` to every current sink; failed sinks are removed.
    pub fn broadcast(&self, chunk: &Bytes) -> BroadcastReport {
        let snapshot: Vec<Arc<dyn Sink>> = self.sinks.read().values().cloned().collect();

        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();

        for sink in &snapshot {
            match sink.write(chunk) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    debug!(listener = %sink.id(), "Evicting listener: {}", e);
                    failed.push(sink.id());
                }
            }
        }

        if !failed.is_empty() {
            let mut sinks = self.sinks.write();
            for id in failed {
                if sinks.remove(&id).is_some() {
                    report.evicted += 1;
                }
            }
            self.evicted
                .fetch_add(report.evicted as u64, Ordering::Relaxed);
        }

        report
    }

    /// Register a channel-backed listener buffering up to `capacity` chunks.
    ///
    /// The listener is removed when the returned guard is dropped. Returns
    /// `None` once the registry is closed.
    pub fn attach(self: &Arc<Self>, capacity: usize) -> Option<Listener> {
        let id = self.next_id();
        let (sink, receiver) = ChannelSink::new(id, capacity);
        if !self.add(Arc::new(sink)) {
            return None;
        }

        Some(Listener {
            receiver,
            guard: ListenerGuard {
                id,
                registry: Arc::downgrade(self),
            },
        })
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered channel listener.
pub struct Listener {
    receiver: mpsc::Receiver<Bytes>,
    guard: ListenerGuard,
}

impl Listener {
    /// Identity in the registry.
    pub fn id(&self) -> SinkId {
        self.guard.id
    }

    /// Split into the chunk receiver and the membership guard.
    pub fn into_parts(self) -> (mpsc::Receiver<Bytes>, ListenerGuard) {
        (self.receiver, self.guard)
    }
}

/// Removes its listener from the registry on drop.
pub struct ListenerGuard {
    id: SinkId,
    registry: Weak<ListenerRegistry>,
}

impl ListenerGuard {
    /// Identity of the guarded listener.
    pub fn id(&self) -> SinkId {
        self.id
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}
