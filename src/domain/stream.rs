//! Streams and their suppression state.
//!
//! A stream is the set of events sharing a [`StreamKey`]. Each stream owns a
//! [`StreamState`], the small state machine deciding whether the next event
//! of that stream is emitted.

use crate::domain::policy::{Decision, Policy};
use crate::domain::time::Timestamp;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;

/// Identifier of a rate-limited stream.
///
/// Construct it with [`StreamKey::new`] to apply the policy's length limit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey(String);

impl StreamKey {
    /// Build a key from a caller-supplied identifier, keeping at most
    /// `max_len` characters.
    pub fn new(stream_id: &str, max_len: Option<usize>) -> Self {
        match max_len {
            Some(max) => match stream_id.char_indices().nth(max) {
                Some((cut, _)) => Self(stream_id[..cut].to_owned()),
                None => Self(stream_id.to_owned()),
            },
            None => Self(stream_id.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for StreamKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for StreamKey {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Borrow<str> for StreamKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How an adapter derives a stream identifier for events that carry none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultStreamStrategy {
    /// Events without an explicit identifier are never rate limited.
    None,
    /// Events from the same source location share a stream.
    CallSite,
    /// Events with identical message text share a stream.
    #[default]
    Message,
}

/// What an adapter knows about an event when deriving its stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventOrigin<'a> {
    pub file: Option<&'a str>,
    pub line: Option<u32>,
    pub module_path: Option<&'a str>,
    pub message: Option<&'a str>,
}

impl DefaultStreamStrategy {
    /// Derive the stream identifier for an event, or `None` to leave it unlimited.
    pub fn derive(&self, origin: &EventOrigin<'_>) -> Option<String> {
        match self {
            DefaultStreamStrategy::None => None,
            DefaultStreamStrategy::CallSite => {
                let location = origin.file.or(origin.module_path)?;
                Some(match origin.line {
                    Some(line) => format!("{location}:{line}"),
                    None => location.to_owned(),
                })
            }
            DefaultStreamStrategy::Message => origin.message.map(str::to_owned),
        }
    }
}

/// Field names used when a state is stored as a flat record.
pub(crate) const FIELD_NEXT_VALID_TIME: &str = "next_valid_time";
pub(crate) const FIELD_SKIPPED_COUNT: &str = "skipped_count";
pub(crate) const FIELD_ALLOW_NEXT_N_REMAINING: &str = "allow_next_n_remaining";
pub(crate) const FIELD_LAST_SEEN_TIME: &str = "last_seen_time";

/// Suppression state of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamState {
    /// Earliest time at which the next event may pass the window check.
    pub next_valid_time: Timestamp,
    /// Events suppressed since the last allowed one.
    pub skipped_count: u64,
    /// Events that may still bypass the window check.
    pub allow_next_n_remaining: u32,
    /// When the stream last saw an event.
    pub last_seen_time: Timestamp,
}

impl StreamState {
    /// State of a stream seen for the first time at `now`.
    pub fn fresh(now: Timestamp) -> Self {
        Self {
            next_valid_time: now,
            skipped_count: 0,
            allow_next_n_remaining: 0,
            last_seen_time: now,
        }
    }

    /// State of a stream whose window was just restarted at `now`.
    pub fn armed(policy: &Policy, now: Timestamp) -> Self {
        Self {
            next_valid_time: now + policy.period(),
            skipped_count: 0,
            allow_next_n_remaining: policy.allow_next_n(),
            last_seen_time: now,
        }
    }

    /// Register an event at `now` and decide whether it is emitted.
    ///
    /// The window boundary is inclusive: an event at exactly
    /// `next_valid_time` is allowed.
    pub fn register_event(&mut self, policy: &Policy, now: Timestamp) -> Decision {
        self.last_seen_time = now;

        if self.allow_next_n_remaining > 0 {
            self.allow_next_n_remaining -= 1;
            return Decision::Allow;
        }

        if now >= self.next_valid_time {
            let skipped = self.skipped_count;
            *self = Self::armed(policy, now);
            return if skipped > 0 {
                Decision::AllowWithSummary { skipped }
            } else {
                Decision::Allow
            };
        }

        self.skipped_count = self.skipped_count.saturating_add(1);
        Decision::Suppress
    }

    /// Whether an event at `now` would be allowed, without registering it.
    pub fn would_allow(state: Option<&StreamState>, now: Timestamp) -> bool {
        match state {
            None => true,
            Some(state) => state.allow_next_n_remaining > 0 || now >= state.next_valid_time,
        }
    }

    /// Whether the stream has been idle for longer than allowed at `cutoff`.
    pub fn is_stale(&self, cutoff: Timestamp) -> bool {
        self.last_seen_time < cutoff
    }

    /// Flatten into field/value pairs for record-oriented stores.
    pub fn to_fields(&self) -> [(&'static str, String); 4] {
        [
            (
                FIELD_NEXT_VALID_TIME,
                self.next_valid_time.as_micros().to_string(),
            ),
            (FIELD_SKIPPED_COUNT, self.skipped_count.to_string()),
            (
                FIELD_ALLOW_NEXT_N_REMAINING,
                self.allow_next_n_remaining.to_string(),
            ),
            (
                FIELD_LAST_SEEN_TIME,
                self.last_seen_time.as_micros().to_string(),
            ),
        ]
    }

    /// Rebuild a state from stored fields.
    ///
    /// Returns `None` when a field is missing or unparsable; callers treat
    /// such records as absent.
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let number = |name: &str| fields.get(name)?.trim().parse::<u64>().ok();
        Some(Self {
            next_valid_time: Timestamp::from_micros(number(FIELD_NEXT_VALID_TIME)?),
            skipped_count: number(FIELD_SKIPPED_COUNT)?,
            allow_next_n_remaining: number(FIELD_ALLOW_NEXT_N_REMAINING)?.try_into().ok()?,
            last_seen_time: Timestamp::from_micros(number(FIELD_LAST_SEEN_TIME)?),
        })
    }
}
