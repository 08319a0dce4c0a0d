//! Field visitor extracting stream controls from events.
//!
//! Events opt into per-event behaviour through well-known fields:
//!
//! ```rust,ignore
//! warn!(stream_id = "disk", "disk almost full");
//! warn!(stream_id = "disk", period_sec = 5.0, allow_next_n = 2, "disk almost full");
//! info!(throttle = false, "never limited");
//! ```
//!
//! Fields with an unusable value are ignored, so a typo never hides an event.

use crate::domain::policy::PolicyOverride;
use std::fmt;
use tracing::field::{Field, Visit};

pub(crate) const STREAM_ID_FIELD: &str = "stream_id";
pub(crate) const PERIOD_FIELD: &str = "period_sec";
pub(crate) const ALLOW_NEXT_N_FIELD: &str = "allow_next_n";
pub(crate) const THROTTLE_FIELD: &str = "throttle";
const MESSAGE_FIELD: &str = "message";

/// Stream controls found on one event.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct StreamFields {
    pub stream_id: Option<String>,
    pub period_sec: Option<f64>,
    pub allow_next_n: Option<u32>,
    pub throttle: Option<bool>,
    pub message: Option<String>,
}

impl StreamFields {
    /// Whether the event asked not to be limited.
    pub fn bypass(&self) -> bool {
        self.throttle == Some(false)
    }

    /// Per-event policy override. Invalid periods fall back to the base policy.
    pub fn overrides(&self) -> PolicyOverride {
        let mut overrides = PolicyOverride::new();
        if let Some(period_sec) = self.period_sec {
            if let Ok(with_period) = overrides.clone().with_period_secs(period_sec) {
                overrides = with_period;
            }
        }
        if let Some(n) = self.allow_next_n {
            overrides = overrides.with_allow_next_n(n);
        }
        overrides
    }
}

/// Visitor collecting [`StreamFields`].
#[derive(Debug, Default)]
pub(crate) struct FieldVisitor {
    fields: StreamFields,
}

impl FieldVisitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_fields(self) -> StreamFields {
        self.fields
    }

    fn record_text(&mut self, field: &Field, value: &str) {
        match field.name() {
            STREAM_ID_FIELD => self.fields.stream_id = Some(value.to_owned()),
            MESSAGE_FIELD => self.fields.message = Some(value.to_owned()),
            PERIOD_FIELD => self.fields.period_sec = value.trim().parse().ok(),
            ALLOW_NEXT_N_FIELD => self.fields.allow_next_n = value.trim().parse().ok(),
            THROTTLE_FIELD => self.fields.throttle = value.trim().parse().ok(),
            _ => {}
        }
    }

    fn record_integer(&mut self, field: &Field, value: i128) {
        match field.name() {
            STREAM_ID_FIELD => self.fields.stream_id = Some(value.to_string()),
            PERIOD_FIELD => self.fields.period_sec = Some(value as f64),
            ALLOW_NEXT_N_FIELD => self.fields.allow_next_n = u32::try_from(value).ok(),
            _ => {}
        }
    }
}

impl Visit for FieldVisitor {
    fn record_f64(&mut self, field: &Field, value: f64) {
        match field.name() {
            PERIOD_FIELD => self.fields.period_sec = Some(value),
            STREAM_ID_FIELD => self.fields.stream_id = Some(value.to_string()),
            _ => {}
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record_integer(field, i128::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record_integer(field, i128::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        match field.name() {
            THROTTLE_FIELD => self.fields.throttle = Some(value),
            STREAM_ID_FIELD => self.fields.stream_id = Some(value.to_string()),
            _ => {}
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_text(field, value);
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.record_text(field, &value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        // `%value` and the message arrive here; their Debug output is the text.
        self.record_text(field, &format!("{:?}", value));
    }
}
