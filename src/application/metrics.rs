//! Observability metrics for stream rate limiting.
//!
//! Provides counters about limiter behavior for monitoring and debugging.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Metrics tracking rate limiting statistics.
///
/// All metrics use atomic operations for thread-safe updates and reads.
/// Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    events_allowed: AtomicU64,
    events_suppressed: AtomicU64,
    summaries_reported: AtomicU64,
    streams_expired: AtomicU64,
    expiry_reports: AtomicU64,
    sweeps_completed: AtomicU64,
    backend_errors: AtomicU64,
}

impl Metrics {
    /// Create a new metrics tracker.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_allowed(&self) {
        self.inner.events_allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_suppressed(&self) {
        self.inner.events_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an allowed event carrying a summary of earlier suppressions.
    pub(crate) fn record_summary(&self) {
        self.inner
            .summaries_reported
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a stream removed by the sweeper.
    pub(crate) fn record_expired(&self, reported: bool) {
        self.inner.streams_expired.fetch_add(1, Ordering::Relaxed);
        if reported {
            self.inner.expiry_reports.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_sweep(&self) {
        self.inner.sweeps_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_backend_error(&self) {
        self.inner.backend_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the total number of events allowed.
    pub fn events_allowed(&self) -> u64 {
        self.inner.events_allowed.load(Ordering::Relaxed)
    }

    /// Get the total number of events suppressed.
    pub fn events_suppressed(&self) -> u64 {
        self.inner.events_suppressed.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            events_allowed: load(&self.inner.events_allowed),
            events_suppressed: load(&self.inner.events_suppressed),
            summaries_reported: load(&self.inner.summaries_reported),
            streams_expired: load(&self.inner.streams_expired),
            expiry_reports: load(&self.inner.expiry_reports),
            sweeps_completed: load(&self.inner.sweeps_completed),
            backend_errors: load(&self.inner.backend_errors),
        }
    }

    /// Reset all metrics to zero.
    pub fn reset(&self) {
        for counter in [
            &self.inner.events_allowed,
            &self.inner.events_suppressed,
            &self.inner.summaries_reported,
            &self.inner.streams_expired,
            &self.inner.expiry_reports,
            &self.inner.sweeps_completed,
            &self.inner.backend_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// A point-in-time snapshot of metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    /// Events emitted, including those allowed because the backend failed
    pub events_allowed: u64,
    /// Events dropped
    pub events_suppressed: u64,
    /// Allowed events that carried a count of earlier suppressions
    pub summaries_reported: u64,
    /// Streams removed by the sweeper
    pub streams_expired: u64,
    /// Expired streams that still had suppressed events to report
    pub expiry_reports: u64,
    /// Sweeps that ran to completion
    pub sweeps_completed: u64,
    /// Failed calls to the stream store
    pub backend_errors: u64,
}

impl MetricsSnapshot {
    /// Calculate the suppression rate (0.0 to 1.0).
    ///
    /// Returns 0.0 if no events have been processed.
    pub fn suppression_rate(&self) -> f64 {
        let total = self.events_allowed.saturating_add(self.events_suppressed);
        if total == 0 {
            0.0
        } else {
            self.events_suppressed as f64 / total as f64
        }
    }

    /// Total number of events processed.
    pub fn total_events(&self) -> u64 {
        self.events_allowed.saturating_add(self.events_suppressed)
    }
}
