//! Example demonstrating suppression summaries and expiry reports.
//!
//! With active emission, a background task logs buffered summaries and
//! sweeps idle streams, so a stream that goes quiet still has its suppressed
//! events reported.
//!
//! Run with: `cargo run --example summaries --features async`

use std::sync::Arc;
use std::time::Duration;
use stream_throttle::{Policy, StreamRateLimitLayer, SuppressionSummary, SUMMARY_TARGET};
use tracing::{error, warn};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() {
    println!("=== Suppression Summary Example ===\n");

    let policy = Policy::new(Duration::from_millis(500))
        .expect("valid period")
        .with_summary_msg("+ {numskip} similar events hidden")
        .with_expire_check(Duration::from_millis(200))
        .with_expire_offset(Duration::from_secs(1))
        .with_expire_msg("stream {stream_id} went quiet with {numskip} hidden events");

    let rate_limit = StreamRateLimitLayer::builder(policy)
        .with_active_emission(true)
        .with_summary_interval(Duration::from_millis(200))
        // Summary events use the crate's summary target, which is never limited
        .with_summary_formatter(Arc::new(|summary: &SuppressionSummary| {
            warn!(
                target: SUMMARY_TARGET,
                stream_id = %summary.stream_id,
                skipped = summary.skipped,
                "{}",
                summary.format_message()
            );
        }))
        .build()
        .expect("failed to build layer");

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(rate_limit.clone()))
        .init();

    println!("Burst of 20 errors on \"payments\", then a pause:");
    for i in 1..=20 {
        error!(stream_id = "payments", attempt = i, "card processor timeout");
    }
    tokio::time::sleep(Duration::from_millis(600)).await;

    println!("\nThe stream resumes; the next event carries a summary:");
    error!(stream_id = "payments", "card processor timeout");
    tokio::time::sleep(Duration::from_millis(300)).await;

    println!("\nBurst of 10 on \"search\", which then goes quiet:");
    for i in 1..=10 {
        warn!(stream_id = "search", attempt = i, "index lagging");
    }
    tokio::time::sleep(Duration::from_millis(1500)).await;

    rate_limit.shutdown().await.expect("shutdown failed");

    let snapshot = rate_limit.metrics().snapshot();
    println!("\n=== Statistics ===");
    println!("Summaries reported: {}", snapshot.summaries_reported);
    println!("Expiry reports:     {}", snapshot.expiry_reports);
    println!("Streams expired:    {}", snapshot.streams_expired);
}
