// Run metrics
//
// Lock-free counters shared by all device pipelines of a capture run.

use crate::models::CaptureStatus;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Counters for one capture run.
///
/// Uses atomic operations so every device pipeline can record without locking.
/// Logged once at the end of a run via [`log_summary`](Self::log_summary).
#[derive(Debug)]
pub struct Metrics {
    /// Screens captured
    pub screens_captured: AtomicUsize,

    /// Screens that ended Failed (retries exhausted, cancelled, device setup failed)
    pub screens_failed: AtomicUsize,

    /// Screens that ended Unreachable
    pub screens_unreachable: AtomicUsize,

    /// App launches across all devices
    pub launches: AtomicU64,

    /// Input events sent (taps, swipes, text)
    pub input_events: AtomicU64,

    /// Accessibility tree fetches
    pub tree_fetches: AtomicU64,

    /// Wall time spent on captured screens, in milliseconds
    pub total_capture_time_ms: AtomicU64,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            screens_captured: AtomicUsize::new(0),
            screens_failed: AtomicUsize::new(0),
            screens_unreachable: AtomicUsize::new(0),
            launches: AtomicU64::new(0),
            input_events: AtomicU64::new(0),
            tree_fetches: AtomicU64::new(0),
            total_capture_time_ms: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record the terminal status of one (screen, device) pair
    pub fn record_outcome(&self, status: CaptureStatus) {
        let counter = match status {
            CaptureStatus::Captured => &self.screens_captured,
            CaptureStatus::Failed => &self.screens_failed,
            CaptureStatus::Unreachable => &self.screens_unreachable,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capture_time(&self, duration: Duration) {
        self.total_capture_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Fold in a session's counters (launches, inputs, tree fetches)
    pub fn record_session(&self, launches: u64, input_events: u64, tree_fetches: u64) {
        self.launches.fetch_add(launches, Ordering::Relaxed);
        self.input_events.fetch_add(input_events, Ordering::Relaxed);
        self.tree_fetches.fetch_add(tree_fetches, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average wall time per captured screen in milliseconds
    pub fn avg_capture_time_ms(&self) -> f64 {
        let total = self.total_capture_time_ms.load(Ordering::Relaxed);
        let count = self.screens_captured.load(Ordering::Relaxed);
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    pub fn log_summary(&self) {
        tracing::info!("=== Capture Metrics Summary ===");
        tracing::info!("Elapsed: {:.2}s", self.uptime().as_secs_f64());
        tracing::info!(
            "Screens: {} captured, {} failed, {} unreachable",
            self.screens_captured.load(Ordering::Relaxed),
            self.screens_failed.load(Ordering::Relaxed),
            self.screens_unreachable.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Capture time: {:.2}s (avg: {:.0}ms per screen)",
            self.total_capture_time_ms.load(Ordering::Relaxed) as f64 / 1000.0,
            self.avg_capture_time_ms()
        );
        tracing::info!(
            "Launches: {}, input events: {}, tree fetches: {}",
            self.launches.load(Ordering::Relaxed),
            self.input_events.load(Ordering::Relaxed),
            self.tree_fetches.load(Ordering::Relaxed)
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
