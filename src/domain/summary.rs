//! Suppression summaries.
//!
//! A summary tells the reader how many events of a stream were dropped. It is
//! produced either when the stream emits again after suppressing events, or
//! when the sweeper evicts a stream that still had suppressed events pending.

use crate::domain::stream::StreamKey;
use std::sync::Arc;
use std::time::Duration;

/// Why a summary was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryKind {
    /// The stream emitted again after suppressing events.
    Resumed,
    /// The stream expired while events were suppressed.
    Expired {
        /// Idle time after which the stream was evicted
        expire_offset: Duration,
    },
}

/// Count of suppressed events for one stream, with the template used to report it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuppressionSummary {
    /// Stream the suppressed events belonged to
    pub stream_id: StreamKey,
    /// Number of suppressed events
    pub skipped: u64,
    /// What triggered the summary
    pub kind: SummaryKind,
    template: Arc<str>,
}

impl SuppressionSummary {
    /// Summary attached to an allowed event.
    pub fn resumed(stream_id: StreamKey, skipped: u64, template: impl Into<Arc<str>>) -> Self {
        Self {
            stream_id,
            skipped,
            kind: SummaryKind::Resumed,
            template: template.into(),
        }
    }

    /// Report for a stream evicted with suppressed events pending.
    pub fn expired(
        stream_id: StreamKey,
        skipped: u64,
        expire_offset: Duration,
        template: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            stream_id,
            skipped,
            kind: SummaryKind::Expired { expire_offset },
            template: template.into(),
        }
    }

    pub fn is_expiry(&self) -> bool {
        matches!(self.kind, SummaryKind::Expired { .. })
    }

    /// Render the summary text.
    ///
    /// # Example
    /// ```
    /// use stream_throttle::{StreamKey, SuppressionSummary};
    ///
    /// let summary = SuppressionSummary::resumed(
    ///     StreamKey::from("db"),
    ///     3,
    ///     "+ skipped {numskip} logs due to rate-limiting",
    /// );
    /// assert_eq!(summary.format_message(), "+ skipped 3 logs due to rate-limiting");
    /// ```
    pub fn format_message(&self) -> String {
        let expire_time_sec = match self.kind {
            SummaryKind::Expired { expire_offset } => expire_offset.as_secs_f64(),
            SummaryKind::Resumed => 0.0,
        };
        render_template(
            &self.template,
            self.skipped,
            self.stream_id.as_str(),
            expire_time_sec,
        )
    }
}

/// Substitute `{numskip}`, `{stream_id}` and `{expire_time_sec}` in `template`.
///
/// Unknown placeholders are left as they are.
pub fn render_template(
    template: &str,
    numskip: u64,
    stream_id: &str,
    expire_time_sec: f64,
) -> String {
    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let Some(end) = tail.find('}') else {
            out.push_str(tail);
            return out;
        };
        match &tail[1..end] {
            "numskip" => out.push_str(&numskip.to_string()),
            "stream_id" => out.push_str(stream_id),
            "expire_time_sec" => out.push_str(&expire_time_sec.to_string()),
            _ => out.push_str(&tail[..=end]),
        }
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    out
}
