//! Boolean trigger API used outside of logging.

use std::sync::Arc;
use std::time::Duration;
use stream_throttle::{DecisionEngine, ManualClock, Policy, Timestamp, Trigger};

fn trigger(period: Duration) -> (Trigger, ManualClock) {
    let clock = ManualClock::new(Timestamp::from_secs(0));
    let engine = DecisionEngine::builder(Policy::new(period).unwrap())
        .with_clock(Arc::new(clock.clone()))
        .build();
    (Trigger::from_engine(engine), clock)
}

#[test]
fn test_alert_fires_once_per_period() {
    let (alerts, clock) = trigger(Duration::from_secs(1));

    let mut fired = 0;
    for _ in 0..10 {
        if alerts.trigger("stream1") {
            fired += 1;
        }
        clock.advance(Duration::from_millis(250));
    }
    // t = 0.0 and t = 1.0 and t = 2.0
    assert_eq!(fired, 3);
}

#[test]
fn test_should_trigger_does_not_consume() {
    let (alerts, _clock) = trigger(Duration::from_secs(1));
    for _ in 0..5 {
        assert!(alerts.should_trigger("stream1"));
    }
    assert!(alerts.trigger("stream1"));
    assert!(!alerts.should_trigger("stream1"));
}

#[test]
fn test_reset_then_arm() {
    let (alerts, clock) = trigger(Duration::from_secs(1));

    assert!(alerts.trigger("stream1"));
    alerts.reset_trigger("stream1");
    assert!(alerts.should_trigger("stream1"));

    alerts.arm("stream1");
    assert!(!alerts.should_trigger("stream1"));
    clock.advance(Duration::from_secs(1));
    assert!(alerts.trigger("stream1"));
}

#[test]
fn test_streams_independent() {
    let (alerts, _clock) = trigger(Duration::from_secs(60));
    assert!(alerts.trigger("host-a"));
    assert!(alerts.trigger("host-b"));
    assert!(!alerts.trigger("host-a"));
    assert_eq!(alerts.engine().stream_count(), 2);
}
