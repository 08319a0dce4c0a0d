//! Rate limiting policy and decisions.
//!
//! A [`Policy`] carries every tunable of the stream limiter. Validation happens
//! when a policy (or a per-call [`PolicyOverride`]) is built, so a decision can
//! never fail because of configuration.

use crate::domain::stream::DefaultStreamStrategy;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

/// Default summary note appended to an allowed event that follows suppressions.
pub const DEFAULT_SUMMARY_MSG: &str = "+ skipped {numskip} logs due to rate-limiting";

/// Default message reported when a stream with pending suppressions expires.
pub const DEFAULT_EXPIRE_MSG: &str =
    "[Previous logs] {numskip} logs were skipped for stream '{stream_id}' before it expired";

/// Default minimum interval between expiry sweeps.
pub const DEFAULT_EXPIRE_CHECK: Duration = Duration::from_secs(60);

/// Default idle time after which a stream is considered stale.
pub const DEFAULT_EXPIRE_OFFSET: Duration = Duration::from_secs(900);

/// Error returned when configuration values are invalid.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// No suppression period was configured.
    #[error("period_sec is required")]
    MissingPeriod,
    /// The suppression period is zero, negative or not a number.
    #[error("period_sec must be a finite number greater than 0, got {0}")]
    InvalidPeriod(f64),
    /// An expiry interval is negative or not a number.
    #[error("{field} must be a finite number of seconds >= 0, got {value}")]
    InvalidExpiry {
        /// Name of the offending setting
        field: &'static str,
        /// The rejected value
        value: f64,
    },
    /// Stream identifiers cannot be truncated to nothing.
    #[error("stream_id_max_len must be greater than 0")]
    ZeroStreamIdMaxLen,
    /// Shared-store key prefix exceeds the allowed length.
    #[error("redis_prefix must be at most {max} characters, got {len}")]
    PrefixTooLong {
        /// Length of the configured prefix
        len: usize,
        /// Maximum accepted length
        max: usize,
    },
}

/// Outcome of a rate limiting decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Emit the event.
    Allow,
    /// Emit the event; `skipped` earlier events of the stream were suppressed.
    AllowWithSummary {
        /// Events suppressed since the previous allowed one
        skipped: u64,
    },
    /// Drop the event.
    Suppress,
}

impl Decision {
    /// Whether the event should be emitted.
    pub fn is_allow(&self) -> bool {
        !matches!(self, Decision::Suppress)
    }

    /// Whether the event should be dropped.
    pub fn is_suppress(&self) -> bool {
        matches!(self, Decision::Suppress)
    }

    /// Number of suppressed events to report alongside this one.
    pub fn skipped(&self) -> u64 {
        match self {
            Decision::AllowWithSummary { skipped } => *skipped,
            _ => 0,
        }
    }
}

pub(crate) fn validate_period_secs(period_sec: f64) -> Result<Duration, ConfigError> {
    if !period_sec.is_finite() || period_sec <= 0.0 {
        return Err(ConfigError::InvalidPeriod(period_sec));
    }
    Duration::try_from_secs_f64(period_sec).map_err(|_| ConfigError::InvalidPeriod(period_sec))
}

pub(crate) fn validate_expiry_secs(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::InvalidExpiry { field, value });
    }
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidExpiry { field, value })
}

/// Tunables for per-stream rate limiting.
///
/// # Example
/// ```
/// use stream_throttle::{DefaultStreamStrategy, Policy};
/// use std::time::Duration;
///
/// let policy = Policy::new(Duration::from_secs(30))
///     .unwrap()
///     .with_allow_next_n(2)
///     .with_default_stream_id(DefaultStreamStrategy::CallSite);
///
/// assert_eq!(policy.period(), Duration::from_secs(30));
/// assert_eq!(policy.allow_next_n(), 2);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    period: Duration,
    allow_next_n: u32,
    stream_id_max_len: Option<usize>,
    expire_check: Duration,
    expire_offset: Duration,
    expire_msg: Arc<str>,
    summary: bool,
    summary_msg: Arc<str>,
    default_stream_id: DefaultStreamStrategy,
    print_config: bool,
}

impl Policy {
    /// Create a policy with the given suppression period and defaults elsewhere.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidPeriod` if `period` is zero.
    pub fn new(period: Duration) -> Result<Self, ConfigError> {
        if period.is_zero() {
            return Err(ConfigError::InvalidPeriod(0.0));
        }
        Ok(Self {
            period,
            allow_next_n: 0,
            stream_id_max_len: None,
            expire_check: DEFAULT_EXPIRE_CHECK,
            expire_offset: DEFAULT_EXPIRE_OFFSET,
            expire_msg: Arc::from(DEFAULT_EXPIRE_MSG),
            summary: true,
            summary_msg: Arc::from(DEFAULT_SUMMARY_MSG),
            default_stream_id: DefaultStreamStrategy::default(),
            print_config: false,
        })
    }

    /// Create a policy from a period given in (fractional) seconds.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidPeriod` for zero, negative or non-finite values.
    pub fn from_secs_f64(period_sec: f64) -> Result<Self, ConfigError> {
        Self::new(validate_period_secs(period_sec)?)
    }

    /// Let the next `n` events after each allowed event bypass the window.
    pub fn with_allow_next_n(mut self, n: u32) -> Self {
        self.allow_next_n = n;
        self
    }

    /// Truncate stream identifiers to at most `max_len` characters.
    ///
    /// # Errors
    /// Returns `ConfigError::ZeroStreamIdMaxLen` if `max_len` is zero.
    pub fn with_stream_id_max_len(mut self, max_len: usize) -> Result<Self, ConfigError> {
        if max_len == 0 {
            return Err(ConfigError::ZeroStreamIdMaxLen);
        }
        self.stream_id_max_len = Some(max_len);
        Ok(self)
    }

    /// Minimum interval between expiry sweeps. Zero sweeps on every request.
    pub fn with_expire_check(mut self, interval: Duration) -> Self {
        self.expire_check = interval;
        self
    }

    /// Idle time after which a stream's state is evicted.
    pub fn with_expire_offset(mut self, offset: Duration) -> Self {
        self.expire_offset = offset;
        self
    }

    /// Template for expiry reports.
    pub fn with_expire_msg(mut self, template: impl Into<String>) -> Self {
        self.expire_msg = Arc::from(template.into());
        self
    }

    /// Enable or disable summary notes on allowed events.
    pub fn with_summary(mut self, enabled: bool) -> Self {
        self.summary = enabled;
        self
    }

    /// Template for the summary note.
    pub fn with_summary_msg(mut self, template: impl Into<String>) -> Self {
        self.summary_msg = Arc::from(template.into());
        self
    }

    /// How adapters derive a stream identifier when none is given.
    pub fn with_default_stream_id(mut self, strategy: DefaultStreamStrategy) -> Self {
        self.default_stream_id = strategy;
        self
    }

    /// Log the effective configuration when an engine is built from it.
    pub fn with_print_config(mut self, enabled: bool) -> Self {
        self.print_config = enabled;
        self
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn allow_next_n(&self) -> u32 {
        self.allow_next_n
    }

    pub fn stream_id_max_len(&self) -> Option<usize> {
        self.stream_id_max_len
    }

    pub fn expire_check(&self) -> Duration {
        self.expire_check
    }

    pub fn expire_offset(&self) -> Duration {
        self.expire_offset
    }

    pub fn expire_msg(&self) -> &str {
        &self.expire_msg
    }

    pub fn summary(&self) -> bool {
        self.summary
    }

    pub fn summary_msg(&self) -> &str {
        &self.summary_msg
    }

    pub fn default_stream_id(&self) -> DefaultStreamStrategy {
        self.default_stream_id
    }

    pub fn print_config(&self) -> bool {
        self.print_config
    }

    /// Apply a per-call override on top of this policy.
    ///
    /// Borrows `self` unchanged when the override is empty, which is the
    /// common case on the hot path.
    pub fn merged(&self, overrides: &PolicyOverride) -> Cow<'_, Policy> {
        if overrides.is_empty() {
            return Cow::Borrowed(self);
        }
        let mut policy = self.clone();
        if let Some(period) = overrides.period {
            policy.period = period;
        }
        if let Some(n) = overrides.allow_next_n {
            policy.allow_next_n = n;
        }
        if let Some(summary) = overrides.summary {
            policy.summary = summary;
        }
        if let Some(msg) = &overrides.summary_msg {
            policy.summary_msg = Arc::clone(msg);
        }
        Cow::Owned(policy)
    }
}

/// Per-call adjustments merged over a base [`Policy`].
///
/// Values are validated here, so merging never fails.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PolicyOverride {
    period: Option<Duration>,
    allow_next_n: Option<u32>,
    summary: Option<bool>,
    summary_msg: Option<Arc<str>>,
}

impl PolicyOverride {
    /// An override that changes nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different suppression period for this call.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidPeriod` if `period` is zero.
    pub fn with_period(mut self, period: Duration) -> Result<Self, ConfigError> {
        if period.is_zero() {
            return Err(ConfigError::InvalidPeriod(0.0));
        }
        self.period = Some(period);
        Ok(self)
    }

    /// Use a different suppression period, given in seconds.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidPeriod` for zero, negative or non-finite values.
    pub fn with_period_secs(mut self, period_sec: f64) -> Result<Self, ConfigError> {
        self.period = Some(validate_period_secs(period_sec)?);
        Ok(self)
    }

    pub fn with_allow_next_n(mut self, n: u32) -> Self {
        self.allow_next_n = Some(n);
        self
    }

    pub fn with_summary(mut self, enabled: bool) -> Self {
        self.summary = Some(enabled);
        self
    }

    pub fn with_summary_msg(mut self, template: impl Into<String>) -> Self {
        self.summary_msg = Some(Arc::from(template.into()));
        self
    }

    /// Whether this override leaves the base policy untouched.
    pub fn is_empty(&self) -> bool {
        self.period.is_none()
            && self.allow_next_n.is_none()
            && self.summary.is_none()
            && self.summary_msg.is_none()
    }
}
