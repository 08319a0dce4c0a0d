//! Expiration of idle streams.
//!
//! Streams that have been quiet for longer than the configured offset are
//! removed so memory stays bounded. A stream removed with suppressed events
//! still pending produces an expiry report, so no suppression goes unreported.

use crate::application::metrics::Metrics;
use crate::application::ports::{StoreError, StreamStore};
use crate::domain::policy::Policy;
use crate::domain::summary::SuppressionSummary;
use crate::domain::time::{duration_micros, Timestamp};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "async")]
use tokio::sync::watch;
#[cfg(feature = "async")]
use tokio::task::JoinHandle;

const NEVER: u64 = u64::MAX;

/// Settings of an [`ExpirationSweeper`].
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Minimum interval between two sweeps
    pub check_interval: Duration,
    /// Idle time after which a stream is removed
    pub expire_offset: Duration,
    /// Template of expiry reports
    pub expire_msg: Arc<str>,
}

impl SweeperConfig {
    /// Take the expiry settings of a policy.
    pub fn from_policy(policy: &Policy) -> Self {
        Self {
            check_interval: policy.expire_check(),
            expire_offset: policy.expire_offset(),
            expire_msg: Arc::from(policy.expire_msg()),
        }
    }
}

/// Removes stale streams from a store and reports their pending suppressions.
pub struct ExpirationSweeper {
    store: Arc<dyn StreamStore>,
    config: SweeperConfig,
    metrics: Metrics,
    last_sweep_micros: AtomicU64,
}

impl fmt::Debug for ExpirationSweeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpirationSweeper")
            .field("config", &self.config)
            .field("last_sweep_micros", &self.last_sweep_micros)
            .finish_non_exhaustive()
    }
}

impl ExpirationSweeper {
    pub fn new(store: Arc<dyn StreamStore>, config: SweeperConfig, metrics: Metrics) -> Self {
        Self {
            store,
            config,
            metrics,
            last_sweep_micros: AtomicU64::new(NEVER),
        }
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    /// Sweep if the check interval has elapsed since the last sweep.
    ///
    /// Concurrent callers inside one interval are coalesced: exactly one of
    /// them sweeps, the others get `None` immediately.
    pub fn try_sweep(&self, now: Timestamp) -> Option<SweepOutcome> {
        if !self.claim(now) {
            return None;
        }
        Some(self.sweep_claimed(now))
    }

    /// Sweep now regardless of when the previous sweep ran.
    pub fn sweep(&self, now: Timestamp) -> SweepOutcome {
        self.last_sweep_micros
            .store(now.as_micros(), Ordering::Release);
        self.sweep_claimed(now)
    }

    /// Whether the check interval has elapsed since the last sweep.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.is_due_after(self.last_sweep_micros.load(Ordering::Acquire), now)
    }

    fn is_due_after(&self, last: u64, now: Timestamp) -> bool {
        last == NEVER
            || now.as_micros() >= last.saturating_add(duration_micros(self.config.check_interval))
    }

    fn claim(&self, now: Timestamp) -> bool {
        let last = self.last_sweep_micros.load(Ordering::Acquire);
        if !self.is_due_after(last, now) {
            return false;
        }
        self.last_sweep_micros
            .compare_exchange(last, now.as_micros(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn sweep_claimed(&self, now: Timestamp) -> SweepOutcome {
        let cutoff = now.saturating_sub(self.config.expire_offset);
        let mut outcome = SweepOutcome::default();

        let streams = match self.store.scan() {
            Ok(streams) => streams,
            Err(e) => {
                outcome.error = Some(e);
                return outcome;
            }
        };

        for (key, state) in streams {
            if !state.is_stale(cutoff) {
                continue;
            }
            // The stream may have been touched since the scan; only remove it
            // if it is still stale.
            let removed = match self.store.remove_if_stale(&key, cutoff) {
                Ok(Some(removed)) => removed,
                Ok(None) => continue,
                Err(e) => {
                    // Streams removed so far keep their reports; the rest
                    // are retried by the next sweep.
                    outcome.error = Some(e);
                    break;
                }
            };

            let reported = removed.skipped_count > 0;
            self.metrics.record_expired(reported);
            tracing::debug!(stream_id = %key, skipped = removed.skipped_count, "stream expired");

            if reported {
                outcome.reports.push(SuppressionSummary::expired(
                    key,
                    removed.skipped_count,
                    self.config.expire_offset,
                    Arc::clone(&self.config.expire_msg),
                ));
            }
        }

        self.metrics.record_sweep();
        outcome
    }
}

/// Result of one sweep.
///
/// A sweep interrupted by a store failure still carries the reports of the
/// streams it removed before the failure.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Expiry reports of removed streams with suppressed events
    pub reports: Vec<SuppressionSummary>,
    /// Store failure that ended the sweep early
    pub error: Option<StoreError>,
}

/// Error returned when stopping a background task fails.
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    /// The task panicked or was cancelled before it could stop cleanly.
    #[error("background task failed: {0}")]
    TaskFailed(String),
}

/// Handle to a periodic background task.
///
/// Dropping the handle leaves the task running; call
/// [`SweeperHandle::shutdown`] to stop it.
#[cfg(feature = "async")]
#[derive(Debug)]
pub struct SweeperHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

#[cfg(feature = "async")]
impl SweeperHandle {
    /// Run `tick` on the blocking pool every `period` until shut down.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(period: Duration, tick: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (stop, mut stopped) = watch::channel(false);
        let tick = Arc::new(tick);
        let period = period.max(Duration::from_millis(10));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Set once the handle is dropped; the task then runs until the runtime stops.
            let mut detached = false;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let tick = Arc::clone(&tick);
                        if let Err(e) = tokio::task::spawn_blocking(move || tick()).await {
                            tracing::warn!(error = %e, "background sweep task failed");
                        }
                    }
                    changed = stopped.changed(), if !detached => {
                        match changed {
                            Ok(()) if *stopped.borrow() => break,
                            Ok(()) => {}
                            Err(_) => detached = true,
                        }
                    }
                }
            }
        });

        Self { stop, task }
    }

    /// Whether the task has already exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the task to stop and wait for it.
    pub async fn shutdown(self) -> Result<(), ShutdownError> {
        let _ = self.stop.send(true);
        self.task
            .await
            .map_err(|e| ShutdownError::TaskFailed(e.to_string()))
    }
}
