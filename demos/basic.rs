//! Basic example demonstrating per-stream rate limiting.
//!
//! Every stream emits at most one event per period. Suppressed events are
//! counted and reported by a summary line once the stream emits again.
//!
//! Run with: `cargo run --example basic`

use std::time::Duration;
use stream_throttle::{Policy, StreamRateLimitLayer};
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

fn main() {
    // One event per stream per second
    let policy = Policy::new(Duration::from_secs(1)).expect("valid period");
    let rate_limit = StreamRateLimitLayer::new(policy);

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(rate_limit.clone()))
        .init();

    println!("=== Basic Stream Rate Limiting Example ===\n");
    println!("Policy: one event per stream per second\n");

    println!("Emitting 10 events on stream \"db\":");
    for i in 1..=10 {
        error!(stream_id = "db", iteration = i, "database unreachable");
    }

    println!("\nEmitting 10 events on stream \"disk\" (separate budget):");
    for i in 1..=10 {
        warn!(stream_id = "disk", iteration = i, "disk almost full");
    }

    println!("\nWithout a stream_id, the message text is the stream:");
    for _ in 1..=5 {
        info!("cache miss");
    }

    println!("\nthrottle = false bypasses the limiter:");
    for i in 1..=3 {
        info!(throttle = false, iteration = i, "always logged");
    }

    println!("\nWaiting for the period to pass...\n");
    std::thread::sleep(Duration::from_millis(1100));

    error!(stream_id = "db", "database unreachable");
    warn!(stream_id = "disk", "disk almost full");

    // Summaries are buffered by the filter; log them from application code
    let emitted = rate_limit.emit_pending();

    let snapshot = rate_limit.metrics().snapshot();
    println!("\n=== Statistics ===");
    println!("Summaries emitted: {}", emitted);
    println!("Streams tracked:   {}", rate_limit.stream_count());
    println!("Events allowed:    {}", snapshot.events_allowed);
    println!("Events suppressed: {}", snapshot.events_suppressed);
    println!(
        "Suppression rate:  {:.1}%",
        snapshot.suppression_rate() * 100.0
    );
}
