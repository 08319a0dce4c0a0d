//! # stream-throttle
//!
//! Per-stream log rate limiting with suppression summaries.
//!
//! Every event belongs to a *stream*, identified by a string. Within a stream
//! at most one event is emitted per period; the rest are counted and dropped.
//! When the stream next emits, the count of dropped events is reported, and a
//! stream that goes quiet with dropped events still pending is reported when
//! it expires. No suppression goes unreported.
//!
//! State lives in an in-process map by default, or in Redis (feature
//! `redis-storage`) so that a fleet of processes shares one budget per stream.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stream_throttle::{Policy, StreamRateLimitLayer};
//! use tracing_subscriber::prelude::*;
//! use std::time::Duration;
//!
//! let policy = Policy::new(Duration::from_secs(60)).unwrap();
//! let rate_limit = StreamRateLimitLayer::new(policy);
//!
//! // Apply the rate limit as a filter to your fmt layer
//! tracing_subscriber::registry()
//!     .with(tracing_subscriber::fmt::layer().with_filter(rate_limit.clone()))
//!     .init();
//!
//! for _ in 0..1_000 {
//!     tracing::error!(stream_id = "db", "database unreachable");  // logged once
//! }
//!
//! // Later, outside of any subscriber callback:
//! rate_limit.emit_pending();
//! ```
//!
//! ## Streams
//!
//! The stream of an event is, in order of precedence:
//! - the value of its `stream_id` field;
//! - otherwise, what the policy's [`DefaultStreamStrategy`] derives: the
//!   message text (default), the call site (`file:line`), or nothing, in
//!   which case the event is never limited.
//!
//! Stream identifiers longer than `stream_id_max_len` are truncated, so
//! identifiers sharing a prefix share a stream.
//!
//! Per-event fields adjust the policy for one event:
//!
//! ```rust,no_run
//! # use tracing::warn;
//! warn!(stream_id = "disk", period_sec = 5.0, "disk almost full");  // 5s window
//! warn!(stream_id = "disk", allow_next_n = 3, "disk almost full");  // 3 extra events after each allowed one
//! warn!(throttle = false, "always logged");
//! ```
//!
//! ## Without `tracing`
//!
//! [`DecisionEngine`] answers "should this event be emitted?" for any logging
//! or alerting pipeline, and [`Trigger`] reduces it to a boolean:
//!
//! ```rust
//! use stream_throttle::{Policy, Trigger};
//! use std::time::Duration;
//!
//! let alerts = Trigger::new(Policy::new(Duration::from_secs(3600)).unwrap());
//! if alerts.trigger("host-17 disk") {
//!     // page someone
//! }
//! assert!(!alerts.trigger("host-17 disk"));
//! ```
//!
//! ## Expiration
//!
//! Streams idle for longer than `expire_offset` (default 15 minutes) are
//! removed at most every `expire_check` (default 60 seconds). The sweep runs
//! inline in the decision path by default; with the `async` feature it can run
//! on a background task instead:
//!
//! ```rust,no_run
//! # use stream_throttle::{DecisionEngine, Policy};
//! # use std::time::Duration;
//! # async fn example() {
//! let engine = DecisionEngine::builder(Policy::new(Duration::from_secs(10)).unwrap())
//!     .with_inline_sweep(false)
//!     .build();
//! let sweeper = engine.start_sweeper();
//! // ...
//! sweeper.shutdown().await.expect("shutdown failed");
//! # }
//! ```
//!
//! ## Fail-Safe Operation
//!
//! A failing store never hides events: decisions fail open, a circuit breaker
//! stops calling the store after repeated failures, and failures are reported
//! at most once per minute through `tracing` and an optional
//! [`DiagnosticSink`].
//!
//! ## Configuration
//!
//! [`ThrottleConfig`] deserializes the whole configuration with `serde`:
//!
//! ```rust
//! use stream_throttle::ThrottleConfig;
//!
//! let config: ThrottleConfig = serde_json::from_str(r#"{
//!     "period_sec": 30,
//!     "default_stream_id": "call_site",
//!     "expire_offset_sec": 600
//! }"#).unwrap();
//! let engine = config.build_engine().unwrap();
//! assert!(engine.decide(Some("k")).is_allow());
//! ```

// Domain layer - pure business logic
pub mod domain;

// Application layer - orchestration
pub mod application;

// Infrastructure layer - external adapters
pub mod infrastructure;

// Re-export commonly used types for convenience
pub use domain::{
    policy::{ConfigError, Decision, Policy, PolicyOverride},
    stream::{DefaultStreamStrategy, EventOrigin, StreamKey, StreamState},
    summary::{render_template, SummaryKind, SuppressionSummary},
    time::Timestamp,
};

pub use application::{
    config::{BuildError, ThrottleConfig},
    engine::{log_summary, DecisionEngine, EngineBuilder, SummarySink, SUMMARY_TARGET},
    health::{BackendDiagnostic, BackendHealth, CircuitState, DiagnosticSink, HealthConfig},
    metrics::{Metrics, MetricsSnapshot},
    ports::{Clock, StoreError, StreamStore},
    sweeper::{ExpirationSweeper, ShutdownError, SweepOutcome, SweeperConfig},
    trigger::Trigger,
};

#[cfg(feature = "async")]
pub use application::sweeper::SweeperHandle;

pub use infrastructure::{
    clock::{ManualClock, SystemClock},
    layer::{StreamRateLimitLayer, StreamRateLimitLayerBuilder},
    storage::LocalStore,
};

#[cfg(feature = "redis-storage")]
pub use infrastructure::redis_storage::{RedisStore, RedisStoreConfig};
