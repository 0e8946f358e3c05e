//! Metrics collection and reporting.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

use soundtag_ipc::{StreamMetrics, WarningType};

/// Collects and reports stream metrics.
///
/// Counters are written by reader loops and the engine thread; snapshots may
/// be taken from anywhere.
pub struct MetricsCollector {
    start_time: Instant,
    chunks: AtomicU64,
    bytes: AtomicU64,
    switches: AtomicU64,
    failed_switches: AtomicU64,
    source_active: AtomicBool,
    last_report_time: RwLock<Instant>,
    last_report_bytes: AtomicU64,
    last_report_evicted: AtomicU64,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            chunks: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            switches: AtomicU64::new(0),
            failed_switches: AtomicU64::new(0),
            source_active: AtomicBool::new(false),
            last_report_time: RwLock::new(now),
            last_report_bytes: AtomicU64::new(0),
            last_report_evicted: AtomicU64::new(0),
        }
    }

    /// Record one broadcast chunk.
    pub fn record_chunk(&self, len: usize) {
        self.chunks.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// Record a completed switch.
    pub fn record_switch(&self) {
        self.switches.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a switch whose transcoder failed to start.
    pub fn record_failed_switch(&self) {
        self.failed_switches.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark whether a transcoder is currently running.
    pub fn set_source_active(&self, active: bool) {
        self.source_active.store(active, Ordering::Relaxed);
    }

    /// Returns true if a transcoder is currently running.
    pub fn source_active(&self) -> bool {
        self.source_active.load(Ordering::Relaxed)
    }

    /// Get current metrics snapshot.
    ///
    /// Bitrate covers the window since the last [`mark_reported`](Self::mark_reported).
    pub fn snapshot(&self, listeners: usize, listeners_evicted: u64, generation: u64) -> StreamMetrics {
        let now = Instant::now();

        let bytes = self.bytes.load(Ordering::Relaxed);
        let window = now.duration_since(*self.last_report_time.read()).as_secs_f64();
        let window_bytes = bytes.saturating_sub(self.last_report_bytes.load(Ordering::Relaxed));
        let bitrate_kbps = if window > 0.0 {
            (window_bytes as f64 * 8.0 / window / 1000.0) as u32
        } else {
            0
        };

        StreamMetrics {
            chunks_broadcast: self.chunks.load(Ordering::Relaxed),
            bytes_broadcast: bytes,
            listeners,
            listeners_evicted,
            switches: self.switches.load(Ordering::Relaxed),
            failed_switches: self.failed_switches.load(Ordering::Relaxed),
            generation,
            source_active: self.source_active(),
            bitrate_kbps,
            uptime_seconds: now.duration_since(self.start_time).as_secs(),
        }
    }

    /// Check for warnings since the last report.
    pub fn check_warnings(&self, listeners_evicted: u64) -> Vec<WarningType> {
        let mut warnings = Vec::new();

        let count =
            listeners_evicted.saturating_sub(self.last_report_evicted.load(Ordering::Relaxed));
        if count > 0 {
            warnings.push(WarningType::ListenersEvicted { count });
        }

        if !self.source_active() {
            warnings.push(WarningType::NoActiveSource);
        }

        warnings
    }

    /// Start a new reporting window.
    pub fn mark_reported(&self, listeners_evicted: u64) {
        *self.last_report_time.write() = Instant::now();
        self.last_report_bytes
            .store(self.bytes.load(Ordering::Relaxed), Ordering::Relaxed);
        self.last_report_evicted
            .store(listeners_evicted, Ordering::Relaxed);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = MetricsCollector::new();
        metrics.record_chunk(100);
        metrics.record_chunk(50);
        metrics.record_switch();
        metrics.record_failed_switch();
        metrics.set_source_active(true);

        let snapshot = metrics.snapshot(3, 1, 7);
        assert_eq!(snapshot.chunks_broadcast, 2);
        assert_eq!(snapshot.bytes_broadcast, 150);
        assert_eq!(snapshot.listeners, 3);
        assert_eq!(snapshot.listeners_evicted, 1);
        assert_eq!(snapshot.switches, 1);
        assert_eq!(snapshot.failed_switches, 1);
        assert_eq!(snapshot.generation, 7);
        assert!(snapshot.source_active);
    }

    #[test]
    fn test_warnings_cover_window_since_last_report() {
        let metrics = MetricsCollector::new();
        metrics.set_source_active(true);
        assert!(metrics.check_warnings(0).is_empty());

        assert_eq!(
            metrics.check_warnings(2),
            vec![WarningType::ListenersEvicted { count: 2 }]
        );

        metrics.mark_reported(2);
        assert!(metrics.check_warnings(2).is_empty());
    }

    #[test]
    fn test_missing_source_warns() {
        let metrics = MetricsCollector::new();
        assert_eq!(metrics.check_warnings(0), vec![WarningType::NoActiveSource]);
    }
}
