//! Boolean trigger API.
//!
//! For callers that do not format messages and only need a yes/no answer,
//! for example "send this alert at most once per hour per host".

use crate::application::engine::DecisionEngine;
use crate::domain::policy::{Decision, Policy, PolicyOverride};
use crate::domain::time::Timestamp;

/// Thin boolean wrapper around a [`DecisionEngine`].
///
/// # Example
/// ```
/// use stream_throttle::{Policy, Timestamp, Trigger};
/// use std::time::Duration;
///
/// let trigger = Trigger::new(Policy::new(Duration::from_secs(60)).unwrap());
/// let start = Timestamp::from_secs(1_000);
///
/// assert!(trigger.trigger_at("stream1", start));
/// assert!(!trigger.should_trigger_at("stream1", start + Duration::from_secs(30)));
/// assert!(trigger.trigger_at("stream1", start + Duration::from_secs(60)));
/// ```
#[derive(Debug, Clone)]
pub struct Trigger {
    engine: DecisionEngine,
}

impl Trigger {
    /// Trigger backed by an in-process store and the system clock.
    pub fn new(policy: Policy) -> Self {
        Self {
            engine: DecisionEngine::builder(policy).build(),
        }
    }

    /// Share an existing engine.
    pub fn from_engine(engine: DecisionEngine) -> Self {
        Self { engine }
    }

    /// Register an occurrence of `stream_id`; `true` if it should fire.
    pub fn trigger(&self, stream_id: &str) -> bool {
        self.engine.trigger(Some(stream_id)).is_allow()
    }

    pub fn trigger_at(&self, stream_id: &str, now: Timestamp) -> bool {
        self.engine
            .trigger_at(Some(stream_id), &PolicyOverride::default(), now)
            .is_allow()
    }

    /// Register an occurrence and return the full decision, including the
    /// number of occurrences that did not fire.
    pub fn trigger_with(&self, stream_id: &str, overrides: &PolicyOverride) -> Decision {
        self.engine.decide_with(Some(stream_id), overrides)
    }

    /// Whether an occurrence of `stream_id` would fire now, without registering it.
    pub fn should_trigger(&self, stream_id: &str) -> bool {
        self.engine.should_trigger(Some(stream_id))
    }

    pub fn should_trigger_at(&self, stream_id: &str, now: Timestamp) -> bool {
        self.engine.should_trigger_at(Some(stream_id), now)
    }

    /// Forget `stream_id`; its next occurrence fires.
    pub fn reset_trigger(&self, stream_id: &str) {
        self.engine.reset(stream_id);
    }

    /// Restart the window of `stream_id` as if it had just fired, without
    /// firing. Occurrences within the next period will not fire.
    pub fn arm(&self, stream_id: &str) {
        self.engine.arm_at(stream_id, self.engine.clock().now());
    }

    pub fn arm_at(&self, stream_id: &str, now: Timestamp) {
        self.engine.arm_at(stream_id, now);
    }

    pub fn engine(&self) -> &DecisionEngine {
        &self.engine
    }
}
