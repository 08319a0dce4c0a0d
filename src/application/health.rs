//! Backend health tracking for fail-open operation.
//!
//! When the stream store misbehaves, decisions fall back to allowing every
//! event. [`BackendHealth`] decides when to stop calling a failing backend
//! (circuit breaker) and makes sure the failure is reported through a
//! low-frequency diagnostic rather than once per event.

use crate::domain::time::{duration_micros, Timestamp};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Backend calls proceed normally
    Closed = 0,
    /// Backend is skipped, all events are allowed
    Open = 1,
    /// A single trial call is in flight to test recovery
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Thresholds for backend health handling.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Consecutive failures before the backend is skipped
    pub failure_threshold: u32,
    /// How long the backend is skipped before a trial call
    pub recovery_timeout: Duration,
    /// Minimum interval between two diagnostics
    pub report_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            report_interval: Duration::from_secs(60),
        }
    }
}

/// A backend failure report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDiagnostic {
    /// Operation that failed (`decide`, `sweep`, ...)
    pub operation: &'static str,
    /// Rendered error
    pub error: String,
    /// Failures in a row at the time of the report
    pub consecutive_failures: u64,
    /// Failures that happened since the previous report without being reported
    pub unreported_failures: u64,
}

impl fmt::Display for BackendDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stream store {} failed ({} in a row, {} unreported): {}",
            self.operation, self.consecutive_failures, self.unreported_failures, self.error
        )
    }
}

/// Callback receiving backend diagnostics.
pub type DiagnosticSink = Arc<dyn Fn(&BackendDiagnostic) + Send + Sync + 'static>;

const NEVER: u64 = u64::MAX;

/// Circuit breaker and diagnostic throttle for one backend.
///
/// All times come from the caller's clock so behaviour is reproducible in tests.
pub struct BackendHealth {
    state: AtomicU8,
    consecutive_failures: AtomicU64,
    opened_at_micros: AtomicU64,
    last_report_micros: AtomicU64,
    unreported: AtomicU64,
    config: HealthConfig,
    sink: Option<DiagnosticSink>,
}

impl fmt::Debug for BackendHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendHealth")
            .field("state", &self.state())
            .field("consecutive_failures", &self.consecutive_failures())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Default for BackendHealth {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

impl BackendHealth {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU64::new(0),
            opened_at_micros: AtomicU64::new(0),
            last_report_micros: AtomicU64::new(NEVER),
            unreported: AtomicU64::new(0),
            config,
            sink: None,
        }
    }

    /// Deliver diagnostics to `sink` in addition to the log.
    pub fn with_sink(mut self, sink: DiagnosticSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Check whether the backend should be called at `now`.
    ///
    /// Returns `false` while the circuit is open; the caller then fails open.
    /// Once the recovery timeout has passed, exactly one caller is let through
    /// as a trial and the circuit moves to half-open. A trial whose outcome is
    /// never recorded is replaced by a new one after another recovery timeout.
    pub fn allow_request(&self, now: Timestamp) -> bool {
        if self.state() == CircuitState::Closed {
            return true;
        }

        let since = self.opened_at_micros.load(Ordering::Acquire);
        if now.saturating_duration_since(Timestamp::from_micros(since)) < self.config.recovery_timeout {
            return false;
        }
        // The caller that restarts the timer runs the trial.
        if self
            .opened_at_micros
            .compare_exchange(since, now.as_micros(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // A concurrent success may already have closed the circuit.
        let _ = self.state.compare_exchange(
            CircuitState::Open as u8,
            CircuitState::HalfOpen as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        true
    }

    /// Record a successful backend call.
    pub fn record_success(&self) {
        if self.consecutive_failures.swap(0, Ordering::AcqRel) > 0 {
            tracing::info!("stream store recovered, resuming rate limiting");
        }
        self.state
            .store(CircuitState::Closed as u8, Ordering::Release);
    }

    /// Record a failed backend call at `now` and report it if the diagnostic
    /// interval allows.
    pub fn record_failure(&self, operation: &'static str, error: &dyn fmt::Display, now: Timestamp) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

        match self.state() {
            CircuitState::HalfOpen => self.open(now),
            CircuitState::Closed if failures >= u64::from(self.config.failure_threshold) => {
                self.open(now)
            }
            _ => {}
        }

        self.report(operation, error, failures, now);
    }

    /// Force the circuit closed and forget past failures.
    pub fn reset(&self) {
        self.state
            .store(CircuitState::Closed as u8, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
    }

    fn open(&self, now: Timestamp) {
        self.opened_at_micros
            .store(now.as_micros(), Ordering::Release);
        self.state.store(CircuitState::Open as u8, Ordering::Release);
    }

    fn report(&self, operation: &'static str, error: &dyn fmt::Display, failures: u64, now: Timestamp) {
        let last = self.last_report_micros.load(Ordering::Acquire);
        let due = last == NEVER
            || now.as_micros() >= last.saturating_add(duration_micros(self.config.report_interval));

        if !due
            || self
                .last_report_micros
                .compare_exchange(last, now.as_micros(), Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            self.unreported.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let diagnostic = BackendDiagnostic {
            operation,
            error: error.to_string(),
            consecutive_failures: failures,
            unreported_failures: self.unreported.swap(0, Ordering::AcqRel),
        };

        tracing::warn!(
            operation = diagnostic.operation,
            error = %diagnostic.error,
            consecutive_failures = diagnostic.consecutive_failures,
            unreported_failures = diagnostic.unreported_failures,
            "stream store failure, failing open"
        );

        if let Some(sink) = &self.sink {
            sink(&diagnostic);
        }
    }
}
