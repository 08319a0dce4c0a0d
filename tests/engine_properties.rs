//! Behavioural properties of the decision engine.

use std::sync::Arc;
use std::time::Duration;
use stream_throttle::{
    Decision, DecisionEngine, ManualClock, Policy, PolicyOverride, StreamKey, StreamStore,
    Timestamp,
};

fn engine(policy: Policy) -> DecisionEngine {
    DecisionEngine::builder(policy)
        .with_clock(Arc::new(ManualClock::new(Timestamp::from_secs(0))))
        .with_inline_sweep(false)
        .build()
}

fn period(secs: u64) -> Policy {
    Policy::new(Duration::from_secs(secs)).unwrap()
}

fn skipped(engine: &DecisionEngine, key: &str) -> u64 {
    engine
        .store()
        .get(&StreamKey::from(key))
        .unwrap()
        .map(|state| state.skipped_count)
        .unwrap_or(0)
}

fn decide(engine: &DecisionEngine, key: &str, at: Timestamp) -> Decision {
    engine.decide_at(Some(key), &PolicyOverride::new(), at)
}

#[test]
fn test_first_decision_always_allowed() {
    let t0 = Timestamp::from_secs(1_700_000_000);
    for secs in [1, 60, 3600] {
        let engine = engine(period(secs));
        for key in ["a", "b", "a very long stream identifier"] {
            assert_eq!(decide(&engine, key, t0), Decision::Allow);
        }
    }
}

#[test]
fn test_second_decision_within_period_suppressed() {
    let engine = engine(period(10));
    let t0 = Timestamp::from_secs(100);

    assert_eq!(decide(&engine, "k", t0), Decision::Allow);
    assert_eq!(
        decide(&engine, "k", t0 + Duration::from_millis(9_999)),
        Decision::Suppress
    );
    assert_eq!(skipped(&engine, "k"), 1);
}

#[test]
fn test_window_boundary_is_inclusive() {
    let engine = engine(period(10));
    let t0 = Timestamp::from_secs(100);

    decide(&engine, "k", t0);
    assert_eq!(
        decide(&engine, "k", t0 + Duration::from_secs(10)),
        Decision::Allow
    );
}

#[test]
fn test_allow_next_n_bypasses_timing() {
    let engine = engine(period(10).with_allow_next_n(3));
    let t0 = Timestamp::from_secs(100);

    assert_eq!(decide(&engine, "k", t0), Decision::Allow);
    for _ in 0..3 {
        assert_eq!(decide(&engine, "k", t0), Decision::Allow);
    }
    assert_eq!(decide(&engine, "k", t0), Decision::Suppress);
    assert_eq!(skipped(&engine, "k"), 1);
}

#[test]
fn test_allow_next_n_per_call_override() {
    let engine = engine(period(10));
    let t0 = Timestamp::from_secs(100);
    let burst = PolicyOverride::new().with_allow_next_n(2);

    assert!(engine.decide_at(Some("k"), &burst, t0).is_allow());
    assert!(engine.decide_at(Some("k"), &burst, t0).is_allow());
    assert!(engine.decide_at(Some("k"), &burst, t0).is_allow());
    assert!(engine.decide_at(Some("k"), &burst, t0).is_suppress());
}

#[test]
fn test_reset_reopens_window() {
    let engine = engine(period(3600));
    let t0 = Timestamp::from_secs(100);

    decide(&engine, "k", t0);
    decide(&engine, "k", t0);
    engine.reset("k");
    assert_eq!(decide(&engine, "k", t0), Decision::Allow);
}

#[test]
fn test_absent_key_never_limited() {
    let engine = engine(period(3600));
    for _ in 0..1_000 {
        assert_eq!(engine.decide(None), Decision::Allow);
    }
    assert_eq!(engine.stream_count(), 0);
}

#[test]
fn test_hundred_rapid_calls_then_summary() {
    let engine = engine(period(1));
    let t0 = Timestamp::from_secs(5_000);

    let decisions: Vec<_> = (0..100).map(|_| decide(&engine, "wolf", t0)).collect();
    assert_eq!(decisions.iter().filter(|d| d.is_allow()).count(), 1);
    assert_eq!(decisions.iter().filter(|d| d.is_suppress()).count(), 99);
    assert_eq!(skipped(&engine, "wolf"), 99);

    assert_eq!(
        decide(&engine, "wolf", t0 + Duration::from_secs(1)),
        Decision::AllowWithSummary { skipped: 99 }
    );
    assert_eq!(skipped(&engine, "wolf"), 0);
}

#[test]
fn test_next_valid_time_non_decreasing_across_allows() {
    let engine = engine(period(2));
    let mut now = Timestamp::from_secs(0);
    let mut last_next_valid = Timestamp::EPOCH;

    for step in 0..50u64 {
        now = now + Duration::from_millis(300 + (step % 7) * 100);
        if decide(&engine, "k", now).is_allow() {
            let state = engine.store().get(&StreamKey::from("k")).unwrap().unwrap();
            assert!(state.next_valid_time >= last_next_valid);
            assert_eq!(state.skipped_count, 0);
            last_next_valid = state.next_valid_time;
        }
    }
}

#[test]
fn test_concurrent_decisions_serialize() {
    let engine = engine(period(60));
    let t0 = Timestamp::from_secs(100);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            std::thread::spawn(move || {
                (0..250)
                    .filter(|_| decide(&engine, "shared", t0).is_allow())
                    .count()
            })
        })
        .collect();

    let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(allowed, 1);
    assert_eq!(skipped(&engine, "shared"), 1_999);
}

#[test]
fn test_should_trigger_matches_decide_without_mutating() {
    let engine = engine(period(10).with_allow_next_n(1));
    let t0 = Timestamp::from_secs(100);

    for offset_ms in [0, 10, 5_000, 10_000, 10_001, 25_000] {
        let now = t0 + Duration::from_millis(offset_ms);
        let before = engine.store().get(&StreamKey::from("k")).unwrap();
        let predicted = engine.should_trigger_at(Some("k"), now);
        assert_eq!(engine.store().get(&StreamKey::from("k")).unwrap(), before);
        assert_eq!(decide(&engine, "k", now).is_allow(), predicted);
    }
}
