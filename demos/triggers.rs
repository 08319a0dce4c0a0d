//! Example demonstrating the trigger API outside of `tracing`.
//!
//! A [`Trigger`] answers "should this fire?" per stream, which suits alerting
//! and paging as much as logging.
//!
//! Run with: `cargo run --example triggers`

use std::sync::Arc;
use std::time::Duration;
use stream_throttle::{
    Decision, DecisionEngine, ManualClock, Policy, PolicyOverride, SuppressionSummary, Timestamp,
    Trigger,
};

fn main() {
    println!("=== Trigger Example ===\n");

    let clock = Arc::new(ManualClock::new(Timestamp::from_secs(0)));
    let policy = Policy::new(Duration::from_secs(60))
        .expect("valid period")
        .with_allow_next_n(1);
    let engine = DecisionEngine::builder(policy)
        .with_clock(clock.clone())
        // Receives expiry reports of streams that went quiet
        .with_summary_sink(Arc::new(|report: &SuppressionSummary| {
            println!("  expired: {}", report.format_message());
        }))
        .build();
    let alerts = Trigger::from_engine(engine);

    println!("Policy: one alert per host per minute, plus one follow-up\n");
    for attempt in 1..=4 {
        let fired = alerts.trigger("host-17");
        println!("  t=0s  attempt {} fired: {}", attempt, fired);
    }

    println!("\nPeeking does not consume the budget:");
    println!("  should_trigger = {}", alerts.should_trigger("host-17"));

    clock.advance(Duration::from_secs(61));
    println!("\nAfter 61s:");
    let decision = alerts.trigger_with("host-17", &PolicyOverride::new());
    match decision {
        Decision::AllowWithSummary { skipped } => {
            println!("  fired again, {} alerts were held back", skipped)
        }
        other => println!("  decision: {:?}", other),
    }

    println!("\nArming a stream holds it back for a full period:");
    alerts.arm("host-42");
    println!("  host-42 fired: {}", alerts.trigger("host-42"));

    println!("\nResetting a stream forgets it:");
    alerts.reset_trigger("host-42");
    println!("  host-42 fired: {}", alerts.trigger("host-42"));

    let snapshot = alerts.engine().metrics().snapshot();
    println!("\n=== Statistics ===");
    println!("Allowed:    {}", snapshot.events_allowed);
    println!("Suppressed: {}", snapshot.events_suppressed);
}
