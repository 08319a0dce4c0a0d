//! Decision engine coordination logic.
//!
//! The engine turns a stream identifier into a [`Decision`] by merging the
//! per-call override over the base policy, truncating the identifier, and
//! running the atomic read-decide-write on the configured store. Store
//! failures never reach the caller: the event is allowed and the failure is
//! reported through the low-frequency diagnostic channel.

use crate::application::health::{BackendHealth, DiagnosticSink, HealthConfig};
use crate::application::metrics::Metrics;
use crate::application::ports::{Clock, StoreError, StreamStore};
use crate::application::sweeper::{ExpirationSweeper, SweepOutcome, SweeperConfig};
use crate::domain::policy::{Decision, Policy, PolicyOverride};
use crate::domain::stream::{StreamKey, StreamState};
use crate::domain::summary::SuppressionSummary;
use crate::domain::time::Timestamp;
use crate::infrastructure::clock::SystemClock;
use crate::infrastructure::storage::LocalStore;
use std::fmt;
use std::panic;
use std::sync::Arc;

#[cfg(feature = "async")]
use crate::application::sweeper::SweeperHandle;

/// Target of the log events emitted by [`log_summary`].
pub const SUMMARY_TARGET: &str = "stream_throttle::summary";

/// Callback receiving suppression summaries and expiry reports.
pub type SummarySink = Arc<dyn Fn(&SuppressionSummary) + Send + Sync + 'static>;

/// Default summary sink: one `WARN` event per summary.
pub fn log_summary(summary: &SuppressionSummary) {
    tracing::warn!(
        target: SUMMARY_TARGET,
        stream_id = %summary.stream_id,
        skipped = summary.skipped,
        expired = summary.is_expiry(),
        "{}",
        summary.format_message()
    );
}

/// Builder for a [`DecisionEngine`].
pub struct EngineBuilder {
    policy: Policy,
    store: Option<Arc<dyn StreamStore>>,
    clock: Option<Arc<dyn Clock>>,
    metrics: Option<Metrics>,
    health_config: HealthConfig,
    diagnostic_sink: Option<DiagnosticSink>,
    summary_sink: Option<SummarySink>,
    inline_sweep: bool,
}

impl EngineBuilder {
    fn new(policy: Policy) -> Self {
        Self {
            policy,
            store: None,
            clock: None,
            metrics: None,
            health_config: HealthConfig::default(),
            diagnostic_sink: None,
            summary_sink: None,
            inline_sweep: true,
        }
    }

    /// Store stream state in `store` instead of an in-process map.
    pub fn with_store(mut self, store: Arc<dyn StreamStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use a custom time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Share metrics with another component.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Thresholds for failing open and reporting backend failures.
    pub fn with_health_config(mut self, config: HealthConfig) -> Self {
        self.health_config = config;
        self
    }

    /// Receive backend failure diagnostics (in addition to the log).
    pub fn with_diagnostic_sink(mut self, sink: DiagnosticSink) -> Self {
        self.diagnostic_sink = Some(sink);
        self
    }

    /// Receive expiry reports. Defaults to [`log_summary`].
    pub fn with_summary_sink(mut self, sink: SummarySink) -> Self {
        self.summary_sink = Some(sink);
        self
    }

    /// Sweep expired streams from within `decide` calls (default: on).
    ///
    /// Turn this off when a background sweeper is started instead.
    pub fn with_inline_sweep(mut self, enabled: bool) -> Self {
        self.inline_sweep = enabled;
        self
    }

    pub fn build(self) -> DecisionEngine {
        let store = self.store.unwrap_or_else(|| Arc::new(LocalStore::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock::new()));
        let metrics = self.metrics.unwrap_or_default();

        let mut health = BackendHealth::new(self.health_config);
        if let Some(sink) = self.diagnostic_sink {
            health = health.with_sink(sink);
        }

        let sweeper = ExpirationSweeper::new(
            Arc::clone(&store),
            SweeperConfig::from_policy(&self.policy),
            metrics.clone(),
        );

        if self.policy.print_config() {
            tracing::info!(policy = ?self.policy, store = ?store, "stream throttle configuration");
        }

        DecisionEngine {
            inner: Arc::new(EngineInner {
                store,
                clock,
                policy: self.policy,
                metrics,
                health,
                sweeper,
                summary_sink: self.summary_sink.unwrap_or_else(|| Arc::new(log_summary)),
                inline_sweep: self.inline_sweep,
            }),
        }
    }
}

struct EngineInner {
    store: Arc<dyn StreamStore>,
    clock: Arc<dyn Clock>,
    policy: Policy,
    metrics: Metrics,
    health: BackendHealth,
    sweeper: ExpirationSweeper,
    summary_sink: SummarySink,
    inline_sweep: bool,
}

/// Per-stream rate limiting decisions.
///
/// Cheap to clone; clones share state, store and metrics.
///
/// # Example
/// ```
/// use stream_throttle::{Decision, DecisionEngine, ManualClock, Policy, Timestamp};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let clock = ManualClock::new(Timestamp::from_secs(1_000));
/// let engine = DecisionEngine::builder(Policy::new(Duration::from_secs(10)).unwrap())
///     .with_clock(Arc::new(clock.clone()))
///     .build();
///
/// assert_eq!(engine.decide(Some("disk")), Decision::Allow);
/// assert_eq!(engine.decide(Some("disk")), Decision::Suppress);
///
/// clock.advance(Duration::from_secs(10));
/// assert_eq!(engine.decide(Some("disk")), Decision::AllowWithSummary { skipped: 1 });
///
/// // Events without a stream are never limited.
/// assert_eq!(engine.decide(None), Decision::Allow);
/// ```
#[derive(Clone)]
pub struct DecisionEngine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for DecisionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecisionEngine")
            .field("policy", &self.inner.policy)
            .field("store", &self.inner.store)
            .field("inline_sweep", &self.inner.inline_sweep)
            .finish_non_exhaustive()
    }
}

impl DecisionEngine {
    /// Start building an engine around `policy`.
    pub fn builder(policy: Policy) -> EngineBuilder {
        EngineBuilder::new(policy)
    }

    /// Engine with an in-process store and the system clock.
    pub fn new(policy: Policy) -> Self {
        Self::builder(policy).build()
    }

    /// Decide on an event of `stream_id` using the base policy.
    pub fn decide(&self, stream_id: Option<&str>) -> Decision {
        self.decide_at(stream_id, &PolicyOverride::default(), self.inner.clock.now())
    }

    /// Decide on an event of `stream_id` with a per-call override.
    pub fn decide_with(&self, stream_id: Option<&str>, overrides: &PolicyOverride) -> Decision {
        self.decide_at(stream_id, overrides, self.inner.clock.now())
    }

    /// Decide on an event of `stream_id` that happened at `now`.
    ///
    /// # Fail-Safe Behavior
    /// If the store fails or panics, or the circuit breaker is open, the
    /// event is allowed. Failures are reported at most once per report
    /// interval, never once per event.
    pub fn decide_at(
        &self,
        stream_id: Option<&str>,
        overrides: &PolicyOverride,
        now: Timestamp,
    ) -> Decision {
        let Some(stream_id) = stream_id else {
            self.inner.metrics.record_allowed();
            return Decision::Allow;
        };

        let policy = self.inner.policy.merged(overrides);
        let key = StreamKey::new(stream_id, policy.stream_id_max_len());
        let decision = self.register(&key, &policy, now);

        match decision {
            Decision::Allow => self.inner.metrics.record_allowed(),
            Decision::AllowWithSummary { .. } => {
                self.inner.metrics.record_allowed();
                self.inner.metrics.record_summary();
            }
            Decision::Suppress => self.inner.metrics.record_suppressed(),
        }

        if self.inner.inline_sweep {
            self.sweep_if_due(now);
        }

        decision
    }

    fn register(&self, key: &StreamKey, policy: &Policy, now: Timestamp) -> Decision {
        self.call_store("decide", now, || {
            self.inner.store.register_event(key, policy, now)
        })
        .unwrap_or(Decision::Allow)
    }

    /// Run `call` against the store unless the circuit is open.
    ///
    /// Returns `None` when the call was skipped, failed, or panicked; the
    /// failure is recorded on the health tracker.
    fn call_store<T>(
        &self,
        operation: &'static str,
        now: Timestamp,
        call: impl FnOnce() -> Result<T, StoreError>,
    ) -> Option<T> {
        let health = &self.inner.health;
        if !health.allow_request(now) {
            return None;
        }

        match panic::catch_unwind(panic::AssertUnwindSafe(call)) {
            Ok(Ok(value)) => {
                health.record_success();
                Some(value)
            }
            Ok(Err(e)) => {
                self.record_failure(operation, &e, now);
                None
            }
            Err(_) => {
                self.record_failure(operation, &"store panicked", now);
                None
            }
        }
    }

    fn record_failure(&self, operation: &'static str, error: &dyn fmt::Display, now: Timestamp) {
        self.inner.metrics.record_backend_error();
        self.inner.health.record_failure(operation, error, now);
    }

    /// Decide on an event; identical to [`DecisionEngine::decide`].
    pub fn trigger(&self, stream_id: Option<&str>) -> Decision {
        self.decide(stream_id)
    }

    /// Decide on an event at `now`; identical to [`DecisionEngine::decide_at`].
    pub fn trigger_at(
        &self,
        stream_id: Option<&str>,
        overrides: &PolicyOverride,
        now: Timestamp,
    ) -> Decision {
        self.decide_at(stream_id, overrides, now)
    }

    /// Whether an event of `stream_id` would be allowed now. Changes nothing.
    pub fn should_trigger(&self, stream_id: Option<&str>) -> bool {
        self.should_trigger_at(stream_id, self.inner.clock.now())
    }

    /// Whether an event of `stream_id` would be allowed at `now`. Changes nothing.
    ///
    /// Answers `true` when the store cannot be read.
    pub fn should_trigger_at(&self, stream_id: Option<&str>, now: Timestamp) -> bool {
        let Some(stream_id) = stream_id else {
            return true;
        };

        let key = self.key(stream_id);
        self.call_store("should_trigger", now, || self.inner.store.get(&key))
            .map_or(true, |state| StreamState::would_allow(state.as_ref(), now))
    }

    /// Forget the state of `stream_id`; its next event is allowed.
    pub fn reset(&self, stream_id: &str) {
        let key = self.key(stream_id);
        self.call_store("reset", self.inner.clock.now(), || {
            self.inner.store.delete(&key)
        });
    }

    /// Restart the window of `stream_id` at `now`, as if an event had just
    /// been allowed. Pending suppressions are dropped.
    pub fn arm_at(&self, stream_id: &str, now: Timestamp) {
        let key = self.key(stream_id);
        let state = StreamState::armed(&self.inner.policy, now);
        self.call_store("arm", now, || self.inner.store.put(&key, state));
    }

    /// Build the summary to report alongside `decision`, if any.
    ///
    /// Returns `None` for plain allows, suppressions, and when the effective
    /// policy disables summaries.
    pub fn summary_for(
        &self,
        stream_id: &str,
        decision: Decision,
        overrides: &PolicyOverride,
    ) -> Option<SuppressionSummary> {
        let Decision::AllowWithSummary { skipped } = decision else {
            return None;
        };
        let policy = self.inner.policy.merged(overrides);
        if !policy.summary() {
            return None;
        }
        Some(SuppressionSummary::resumed(
            StreamKey::new(stream_id, policy.stream_id_max_len()),
            skipped,
            policy.summary_msg(),
        ))
    }

    /// Sweep expired streams at `now` if the check interval has elapsed.
    ///
    /// Expiry reports go to the summary sink. Returns the number of reports.
    pub fn sweep_if_due(&self, now: Timestamp) -> usize {
        if !self.inner.sweeper.is_due(now) {
            return 0;
        }
        self.run_sweep(now, |sweeper| sweeper.try_sweep(now))
    }

    /// Sweep expired streams now, ignoring the check interval.
    pub fn sweep_expired(&self) -> usize {
        let now = self.inner.clock.now();
        self.run_sweep(now, |sweeper| Some(sweeper.sweep(now)))
    }

    fn run_sweep(
        &self,
        now: Timestamp,
        sweep: impl FnOnce(&ExpirationSweeper) -> Option<SweepOutcome>,
    ) -> usize {
        if !self.inner.health.allow_request(now) {
            return 0;
        }

        let sweeper = &self.inner.sweeper;
        let outcome = match panic::catch_unwind(panic::AssertUnwindSafe(|| sweep(sweeper))) {
            Ok(Some(outcome)) => outcome,
            Ok(None) => return 0,
            Err(_) => {
                self.record_failure("sweep", &"store panicked", now);
                return 0;
            }
        };

        // Removed streams are gone from the store, so their reports go out
        // even when the sweep stopped early.
        let delivered = self.deliver(&outcome.reports);
        match outcome.error {
            Some(e) => self.record_failure("sweep", &e, now),
            None => self.inner.health.record_success(),
        }
        delivered
    }

    fn deliver(&self, reports: &[SuppressionSummary]) -> usize {
        for report in reports {
            (self.inner.summary_sink)(report);
        }
        reports.len()
    }

    /// Sweep in the background every `expire_check` until the handle is shut down.
    ///
    /// Must be called from within a tokio runtime.
    #[cfg(feature = "async")]
    pub fn start_sweeper(&self) -> SweeperHandle {
        let engine = self.clone();
        SweeperHandle::spawn(self.inner.policy.expire_check(), move || {
            engine.sweep_if_due(engine.inner.clock.now());
        })
    }

    fn key(&self, stream_id: &str) -> StreamKey {
        StreamKey::new(stream_id, self.inner.policy.stream_id_max_len())
    }

    pub fn policy(&self) -> &Policy {
        &self.inner.policy
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub fn health(&self) -> &BackendHealth {
        &self.inner.health
    }

    pub fn store(&self) -> &Arc<dyn StreamStore> {
        &self.inner.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Number of tracked streams, or 0 if the store cannot say.
    pub fn stream_count(&self) -> usize {
        self.inner.store.len().unwrap_or(0)
    }
}
