//! Tracing integration layer.
//!
//! Provides a per-layer [`Filter`] that applies stream rate limiting to log
//! events. Attach it to the output layer whose volume should be limited:
//!
//! ```rust,no_run
//! use stream_throttle::{Policy, StreamRateLimitLayer};
//! use std::time::Duration;
//! use tracing_subscriber::layer::SubscriberExt;
//! use tracing_subscriber::Layer;
//!
//! let policy = Policy::new(Duration::from_secs(60)).unwrap();
//! let rate_limit = StreamRateLimitLayer::new(policy);
//!
//! let subscriber = tracing_subscriber::registry()
//!     .with(tracing_subscriber::fmt::layer().with_filter(rate_limit.clone()));
//! tracing::subscriber::set_global_default(subscriber).unwrap();
//!
//! for _ in 0..100 {
//!     tracing::warn!(stream_id = "disk", "disk almost full");  // emitted once
//! }
//! ```
//!
//! Summaries cannot be logged from inside the filter (the subscriber is busy
//! dispatching the event being filtered), so they are buffered. Collect them
//! with [`StreamRateLimitLayer::drain_summaries`], log them with
//! [`StreamRateLimitLayer::emit_pending`], or enable active emission.

use crate::application::config::BuildError;
use crate::application::engine::{log_summary, DecisionEngine, EngineBuilder, SummarySink, SUMMARY_TARGET};
use crate::application::health::{DiagnosticSink, HealthConfig};
use crate::application::metrics::Metrics;
use crate::application::ports::{Clock, StreamStore};
use crate::domain::policy::Policy;
use crate::domain::stream::EventOrigin;
use crate::domain::summary::SuppressionSummary;
use crate::infrastructure::visitor::FieldVisitor;

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{Metadata, Subscriber};
use tracing_subscriber::layer::{Context, Filter};

#[cfg(feature = "async")]
use crate::application::sweeper::{ShutdownError, SweeperHandle};

/// Summaries kept for draining before the oldest are dropped.
pub const DEFAULT_SUMMARY_CAPACITY: usize = 10_000;

/// Builder for constructing a [`StreamRateLimitLayer`].
pub struct StreamRateLimitLayerBuilder {
    engine: EngineBuilder,
    exempt_targets: BTreeSet<String>,
    summary_sink: Option<SummarySink>,
    summary_capacity: usize,
    summary_interval: Duration,
    enable_active_emission: bool,
    #[cfg(feature = "async")]
    summary_formatter: Option<SummarySink>,
}

impl StreamRateLimitLayerBuilder {
    /// Set a custom clock (mainly for testing).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.engine = self.engine.with_clock(clock);
        self
    }

    /// Keep stream state in `store`, for example a shared Redis store.
    pub fn with_store(mut self, store: Arc<dyn StreamStore>) -> Self {
        self.engine = self.engine.with_store(store);
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.engine = self.engine.with_metrics(metrics);
        self
    }

    pub fn with_health_config(mut self, config: HealthConfig) -> Self {
        self.engine = self.engine.with_health_config(config);
        self
    }

    /// Receive store failure diagnostics.
    ///
    /// Diagnostics raised while an event is being filtered are also logged,
    /// but that log event cannot reach the subscriber doing the filtering.
    pub fn with_diagnostic_sink(mut self, sink: DiagnosticSink) -> Self {
        self.engine = self.engine.with_diagnostic_sink(sink);
        self
    }

    /// Sweep expired streams while filtering events (default: on).
    pub fn with_inline_sweep(mut self, enabled: bool) -> Self {
        self.engine = self.engine.with_inline_sweep(enabled);
        self
    }

    /// Exempt specific targets from rate limiting.
    ///
    /// Events from these targets always pass. Targets are matched exactly;
    /// duplicates and empty targets are ignored. The crate's own summary
    /// target is always exempt.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use stream_throttle::{Policy, StreamRateLimitLayer};
    /// # use std::time::Duration;
    /// let layer = StreamRateLimitLayer::builder(Policy::new(Duration::from_secs(10)).unwrap())
    ///     .with_exempt_targets(vec!["myapp::audit".to_string()])
    ///     .build()
    ///     .unwrap();
    /// ```
    pub fn with_exempt_targets(mut self, targets: Vec<String>) -> Self {
        self.exempt_targets = targets.into_iter().filter(|t| !t.is_empty()).collect();
        self
    }

    /// Deliver summaries and expiry reports to `sink` instead of buffering them.
    ///
    /// The sink runs inside the filter, so it must not rely on logging
    /// through the same subscriber.
    pub fn with_summary_sink(mut self, sink: SummarySink) -> Self {
        self.summary_sink = Some(sink);
        self
    }

    /// Maximum number of buffered summaries. When full, the oldest is dropped.
    pub fn with_summary_capacity(mut self, capacity: usize) -> Self {
        self.summary_capacity = capacity.max(1);
        self
    }

    /// Interval of the active emitter. Validated by `build()`.
    pub fn with_summary_interval(mut self, interval: Duration) -> Self {
        self.summary_interval = interval;
        self
    }

    /// Log buffered summaries and sweep expired streams from a background task.
    ///
    /// **Requires the `async` feature** and a running tokio runtime when
    /// `build()` is called. Without the feature this has no effect.
    ///
    /// Default: disabled
    pub fn with_active_emission(mut self, enabled: bool) -> Self {
        self.enable_active_emission = enabled;
        self
    }

    /// Log summaries from the active emitter with `formatter` instead of
    /// [`log_summary`].
    #[cfg(feature = "async")]
    pub fn with_summary_formatter(mut self, formatter: SummarySink) -> Self {
        self.summary_formatter = Some(formatter);
        self
    }

    /// Build the layer.
    ///
    /// # Errors
    /// Returns `BuildError` if the summary interval is zero, or if active
    /// emission is enabled outside a tokio runtime.
    pub fn build(self) -> Result<StreamRateLimitLayer, BuildError> {
        if self.summary_interval.is_zero() {
            return Err(BuildError::ZeroSummaryInterval);
        }

        #[cfg(feature = "async")]
        {
            let enable = self.enable_active_emission;
            let interval = self.summary_interval;
            let formatter = self.summary_formatter.clone();
            if enable && tokio::runtime::Handle::try_current().is_err() {
                return Err(BuildError::MissingRuntime);
            }

            let layer = self.assemble();
            if enable {
                let handle = layer.spawn_emitter(interval, formatter);
                *lock(&layer.emitter_handle) = Some(handle);
            }
            Ok(layer)
        }

        #[cfg(not(feature = "async"))]
        {
            Ok(self.assemble())
        }
    }

    fn assemble(self) -> StreamRateLimitLayer {
        let summaries = Arc::new(SummaryBuffer::new(self.summary_capacity));
        let sink = self.summary_sink.unwrap_or_else(|| {
            let buffer = Arc::clone(&summaries);
            Arc::new(move |summary: &SuppressionSummary| buffer.push(summary.clone()))
        });

        StreamRateLimitLayer {
            engine: self.engine.with_summary_sink(Arc::clone(&sink)).build(),
            exempt_targets: Arc::new(self.exempt_targets),
            sink,
            summaries,
            #[cfg(feature = "async")]
            emitter_handle: Arc::new(Mutex::new(None)),
        }
    }
}

#[derive(Debug)]
struct SummaryBuffer {
    pending: Mutex<VecDeque<SuppressionSummary>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl SummaryBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, summary: SuppressionSummary) {
        let mut pending = lock(&self.pending);
        if pending.len() >= self.capacity {
            pending.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        pending.push_back(summary);
    }

    fn drain(&self) -> Vec<SuppressionSummary> {
        lock(&self.pending).drain(..).collect()
    }

    fn len(&self) -> usize {
        lock(&self.pending).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A per-layer [`Filter`] that rate limits events by stream.
///
/// Each event's stream is taken from its `stream_id` field, or derived with
/// the policy's [`DefaultStreamStrategy`](crate::DefaultStreamStrategy). The
/// fields `period_sec` and `allow_next_n` override the policy for one event;
/// `throttle = false` lets an event through unconditionally.
///
/// Clones share the same engine and summary buffer.
#[derive(Clone)]
pub struct StreamRateLimitLayer {
    engine: DecisionEngine,
    exempt_targets: Arc<BTreeSet<String>>,
    sink: SummarySink,
    summaries: Arc<SummaryBuffer>,
    #[cfg(feature = "async")]
    emitter_handle: Arc<Mutex<Option<SweeperHandle>>>,
}

impl fmt::Debug for StreamRateLimitLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRateLimitLayer")
            .field("engine", &self.engine)
            .field("exempt_targets", &self.exempt_targets)
            .field("pending_summaries", &self.summaries.len())
            .finish_non_exhaustive()
    }
}

impl StreamRateLimitLayer {
    /// Create a builder for configuring the layer.
    ///
    /// Defaults:
    /// - Store: in-process
    /// - Clock: system clock
    /// - Summaries: buffered, up to 10,000
    /// - Summary interval: 30 seconds
    /// - Active emission: disabled
    pub fn builder(policy: Policy) -> StreamRateLimitLayerBuilder {
        StreamRateLimitLayerBuilder {
            engine: DecisionEngine::builder(policy),
            exempt_targets: BTreeSet::new(),
            summary_sink: None,
            summary_capacity: DEFAULT_SUMMARY_CAPACITY,
            summary_interval: Duration::from_secs(30),
            enable_active_emission: false,
            #[cfg(feature = "async")]
            summary_formatter: None,
        }
    }

    /// Create a layer with default settings around `policy`.
    pub fn new(policy: Policy) -> Self {
        Self::builder(policy).assemble()
    }

    /// Decide on one event. Returns whether it should be emitted.
    fn check_event(&self, event: &tracing::Event<'_>) -> bool {
        let metadata = event.metadata();
        let target = metadata.target();
        if target == SUMMARY_TARGET || self.exempt_targets.contains(target) {
            return self.engine.decide(None).is_allow();
        }

        let mut visitor = FieldVisitor::new();
        event.record(&mut visitor);
        let fields = visitor.into_fields();
        if fields.bypass() {
            return self.engine.decide(None).is_allow();
        }

        let stream_id = fields.stream_id.clone().or_else(|| {
            self.engine
                .policy()
                .default_stream_id()
                .derive(&origin(metadata, fields.message.as_deref()))
        });

        let overrides = fields.overrides();
        let decision = self.engine.decide_with(stream_id.as_deref(), &overrides);

        if let Some(stream_id) = stream_id.as_deref() {
            if let Some(summary) = self.engine.summary_for(stream_id, decision, &overrides) {
                (self.sink)(&summary);
            }
        }

        decision.is_allow()
    }

    /// Take every buffered summary and expiry report, oldest first.
    pub fn drain_summaries(&self) -> Vec<SuppressionSummary> {
        self.summaries.drain()
    }

    /// Log every buffered summary with [`log_summary`]. Returns how many were logged.
    ///
    /// Call this from application code, not from inside a subscriber.
    pub fn emit_pending(&self) -> usize {
        let summaries = self.drain_summaries();
        for summary in &summaries {
            log_summary(summary);
        }
        summaries.len()
    }

    /// Number of buffered summaries.
    pub fn pending_summaries(&self) -> usize {
        self.summaries.len()
    }

    /// Summaries discarded because the buffer was full.
    pub fn dropped_summaries(&self) -> u64 {
        self.summaries.dropped.load(Ordering::Relaxed)
    }

    pub fn engine(&self) -> &DecisionEngine {
        &self.engine
    }

    /// Get a reference to the metrics.
    pub fn metrics(&self) -> &Metrics {
        self.engine.metrics()
    }

    /// Get the current number of tracked streams.
    pub fn stream_count(&self) -> usize {
        self.engine.stream_count()
    }

    #[cfg(feature = "async")]
    fn spawn_emitter(&self, interval: Duration, formatter: Option<SummarySink>) -> SweeperHandle {
        let layer = self.clone();
        let formatter = formatter.unwrap_or_else(|| Arc::new(log_summary));
        SweeperHandle::spawn(interval, move || {
            layer.engine.sweep_if_due(layer.engine.clock().now());
            for summary in layer.drain_summaries() {
                formatter(&summary);
            }
        })
    }

    /// Shutdown the active emitter, if running.
    ///
    /// **Requires the `async` feature.**
    ///
    /// # Errors
    ///
    /// Returns an error if the emitter task fails to shut down gracefully.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use stream_throttle::{Policy, StreamRateLimitLayer};
    /// # use std::time::Duration;
    /// # async fn example() {
    /// let layer = StreamRateLimitLayer::builder(Policy::new(Duration::from_secs(10)).unwrap())
    ///     .with_active_emission(true)
    ///     .build()
    ///     .unwrap();
    ///
    /// // Use the layer...
    ///
    /// layer.shutdown().await.expect("shutdown failed");
    /// # }
    /// ```
    #[cfg(feature = "async")]
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        let handle = lock(&self.emitter_handle).take();
        if let Some(handle) = handle {
            handle.shutdown().await?;
        }
        Ok(())
    }
}

fn origin<'a>(metadata: &'a Metadata<'_>, message: Option<&'a str>) -> EventOrigin<'a> {
    EventOrigin {
        file: metadata.file(),
        line: metadata.line(),
        module_path: metadata.module_path(),
        message,
    }
}

impl<S> Filter<S> for StreamRateLimitLayer
where
    S: Subscriber,
{
    fn enabled(&self, _meta: &Metadata<'_>, _cx: &Context<'_, S>) -> bool {
        // Actual filtering happens in event_enabled, where field values are known.
        true
    }

    fn event_enabled(&self, event: &tracing::Event<'_>, _cx: &Context<'_, S>) -> bool {
        self.check_event(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::stream::DefaultStreamStrategy;
    use crate::domain::time::Timestamp;
    use crate::infrastructure::clock::ManualClock;
    use crate::infrastructure::mocks::MockCaptureLayer;
    use tracing::{info, warn};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::Layer;

    fn policy(period_secs: u64) -> Policy {
        Policy::new(Duration::from_secs(period_secs)).unwrap()
    }

    fn layer_with_clock(policy: Policy) -> (StreamRateLimitLayer, ManualClock) {
        let clock = ManualClock::new(Timestamp::from_secs(1_000));
        let layer = StreamRateLimitLayer::builder(policy)
            .with_clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        (layer, clock)
    }

    fn run(layer: &StreamRateLimitLayer, f: impl FnOnce()) -> MockCaptureLayer {
        let capture = MockCaptureLayer::new();
        let subscriber =
            tracing_subscriber::registry().with(capture.clone().with_filter(layer.clone()));
        tracing::subscriber::with_default(subscriber, f);
        capture
    }

    #[test]
    fn test_exempt_targets_deduplication() {
        let layer = StreamRateLimitLayer::builder(policy(1))
            .with_exempt_targets(vec![
                "myapp::security".to_string(),
                "myapp::security".to_string(),
                "myapp::audit".to_string(),
                "".to_string(),
            ])
            .build()
            .unwrap();

        assert_eq!(layer.exempt_targets.len(), 2);
        assert!(layer.exempt_targets.contains("myapp::security"));
        assert!(layer.exempt_targets.contains("myapp::audit"));
    }

    #[test]
    fn test_zero_summary_interval_rejected() {
        let result = StreamRateLimitLayer::builder(policy(1))
            .with_summary_interval(Duration::ZERO)
            .build();
        assert!(matches!(result, Err(BuildError::ZeroSummaryInterval)));
    }

    #[test]
    fn test_explicit_stream_id_limits_events() {
        let (layer, _clock) = layer_with_clock(policy(60));
        let capture = run(&layer, || {
            for _ in 0..5 {
                warn!(stream_id = "disk", "disk almost full");
            }
            warn!(stream_id = "net", "link down");
        });

        assert_eq!(capture.count(), 2);
        assert_eq!(layer.metrics().events_suppressed(), 4);
        assert_eq!(layer.stream_count(), 2);
    }

    #[test]
    fn test_message_strategy_groups_identical_text() {
        let (layer, _clock) = layer_with_clock(policy(60));
        let capture = run(&layer, || {
            for i in 0..3 {
                info!("retrying connection");
                info!("attempt {}", i);
            }
        });

        let messages: Vec<_> = capture.get_captured().into_iter().map(|e| e.message).collect();
        assert_eq!(
            messages,
            vec!["retrying connection", "attempt 0", "attempt 1", "attempt 2"]
        );
    }

    #[test]
    fn test_call_site_strategy_groups_by_location() {
        let (layer, _clock) =
            layer_with_clock(policy(60).with_default_stream_id(DefaultStreamStrategy::CallSite));
        let capture = run(&layer, || {
            for i in 0..3 {
                info!("attempt {}", i);
            }
        });
        assert_eq!(capture.count(), 1);
    }

    #[test]
    fn test_none_strategy_limits_only_explicit_streams() {
        let (layer, _clock) =
            layer_with_clock(policy(60).with_default_stream_id(DefaultStreamStrategy::None));
        let capture = run(&layer, || {
            for _ in 0..3 {
                info!("unkeyed");
                info!(stream_id = "keyed", "keyed");
            }
        });
        assert_eq!(capture.count(), 4);
        assert_eq!(layer.stream_count(), 1);
    }

    #[test]
    fn test_throttle_false_bypasses() {
        let (layer, _clock) = layer_with_clock(policy(60));
        let capture = run(&layer, || {
            for _ in 0..3 {
                info!(throttle = false, "heartbeat");
            }
        });
        assert_eq!(capture.count(), 3);
        assert_eq!(layer.stream_count(), 0);
    }

    #[test]
    fn test_exempt_and_summary_targets_pass() {
        let layer = StreamRateLimitLayer::builder(policy(60))
            .with_exempt_targets(vec!["myapp::audit".to_string()])
            .build()
            .unwrap();
        let capture = run(&layer, || {
            for _ in 0..3 {
                info!(target: "myapp::audit", "login");
                info!(target: SUMMARY_TARGET, "summary");
            }
        });
        assert_eq!(capture.count(), 6);
        assert_eq!(layer.metrics().events_allowed(), 6);
    }

    #[test]
    fn test_summary_buffered_when_stream_resumes() {
        let (layer, clock) = layer_with_clock(policy(10));
        let capture = run(&layer, || {
            for _ in 0..5 {
                warn!(stream_id = "disk", "disk almost full");
            }
            clock.advance(Duration::from_secs(10));
            warn!(stream_id = "disk", "disk almost full");
        });

        assert_eq!(capture.count(), 2);
        assert_eq!(layer.pending_summaries(), 1);
        let summaries = layer.drain_summaries();
        assert_eq!(summaries[0].skipped, 4);
        assert_eq!(
            summaries[0].format_message(),
            "+ skipped 4 logs due to rate-limiting"
        );
        assert!(layer.drain_summaries().is_empty());
    }

    #[test]
    fn test_period_field_overrides_policy() {
        let (layer, clock) = layer_with_clock(policy(3600));
        let capture = run(&layer, || {
            warn!(stream_id = "fast", period_sec = 1.0, "tick");
            clock.advance(Duration::from_secs(1));
            warn!(stream_id = "fast", period_sec = 1.0, "tick");
            warn!(stream_id = "fast", period_sec = 1.0, "tick");
        });
        assert_eq!(capture.count(), 2);
    }

    #[test]
    fn test_expiry_reports_buffered() {
        let policy = policy(2)
            .with_expire_check(Duration::ZERO)
            .with_expire_offset(Duration::ZERO);
        let (layer, clock) = layer_with_clock(policy);
        run(&layer, || {
            warn!(stream_id = "Test", "x");
            warn!(stream_id = "Test", "x");
            clock.advance(Duration::from_millis(1100));
            warn!(stream_id = "Follow-up", "y");
        });

        let summaries = layer.drain_summaries();
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].is_expiry());
        assert_eq!(summaries[0].stream_id.as_str(), "Test");
    }

    #[test]
    fn test_buffer_drops_oldest_when_full() {
        let clock = ManualClock::new(Timestamp::from_secs(0));
        let layer = StreamRateLimitLayer::builder(policy(1))
            .with_clock(Arc::new(clock.clone()))
            .with_summary_capacity(2)
            .build()
            .unwrap();

        run(&layer, || {
            for id in ["a", "b", "c"] {
                warn!(stream_id = id, "x");
                warn!(stream_id = id, "x");
            }
            clock.advance(Duration::from_secs(1));
            for id in ["a", "b", "c"] {
                warn!(stream_id = id, "x");
            }
        });

        let ids: Vec<_> = layer
            .drain_summaries()
            .into_iter()
            .map(|s| s.stream_id.into_string())
            .collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(layer.dropped_summaries(), 1);
    }

    #[test]
    fn test_custom_summary_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let clock = ManualClock::new(Timestamp::from_secs(0));
        let layer = StreamRateLimitLayer::builder(policy(1))
            .with_clock(Arc::new(clock.clone()))
            .with_summary_sink(Arc::new(move |s: &SuppressionSummary| {
                sink_seen.lock().unwrap().push(s.skipped);
            }))
            .build()
            .unwrap();

        run(&layer, || {
            warn!(stream_id = "k", "x");
            warn!(stream_id = "k", "x");
            clock.advance(Duration::from_secs(1));
            warn!(stream_id = "k", "x");
        });

        assert_eq!(*seen.lock().unwrap(), vec![1]);
        assert_eq!(layer.pending_summaries(), 0);
    }

    #[cfg(feature = "async")]
    #[test]
    fn test_active_emission_requires_runtime() {
        let result = StreamRateLimitLayer::builder(policy(1))
            .with_active_emission(true)
            .build();
        assert!(matches!(result, Err(BuildError::MissingRuntime)));
    }

    #[cfg(feature = "async")]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_active_emission_drains_buffer() {
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let formatter_seen = Arc::clone(&emitted);
        let clock = ManualClock::new(Timestamp::from_secs(0));

        let layer = StreamRateLimitLayer::builder(policy(1))
            .with_clock(Arc::new(clock.clone()))
            .with_active_emission(true)
            .with_summary_interval(Duration::from_millis(20))
            .with_summary_formatter(Arc::new(move |s: &SuppressionSummary| {
                formatter_seen.lock().unwrap().push(s.skipped);
            }))
            .build()
            .unwrap();

        run(&layer, || {
            warn!(stream_id = "k", "x");
            warn!(stream_id = "k", "x");
            warn!(stream_id = "k", "x");
            clock.advance(Duration::from_secs(1));
            warn!(stream_id = "k", "x");
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        layer.shutdown().await.expect("shutdown failed");

        assert_eq!(*emitted.lock().unwrap(), vec![2]);
        assert_eq!(layer.pending_summaries(), 0);
    }
}
