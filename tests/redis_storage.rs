//! Integration tests for the Redis stream store.
//!
//! These tests need a Redis server at `REDIS_URL` (default
//! `redis://127.0.0.1/`) and are ignored by default. Run with
//! `cargo test --features redis-storage --test redis_storage -- --ignored`

#![cfg(feature = "redis-storage")]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use redis::AsyncCommands;
use stream_throttle::{
    Decision, DecisionEngine, ManualClock, Policy, RedisStore, RedisStoreConfig, StreamKey,
    StreamState, StreamStore, SuppressionSummary, Timestamp,
};

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string())
}

/// Connect with a prefix unique to the test and start from an empty namespace.
async fn store(test_name: &str) -> RedisStore {
    let config = RedisStoreConfig::new(&format!("test:{test_name}")).unwrap();
    let store = RedisStore::connect(&redis_url(), config)
        .await
        .expect("Failed to connect to Redis");
    store.clear().unwrap();
    store
}

fn period(secs: u64) -> Policy {
    Policy::new(Duration::from_secs(secs)).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires Redis
async fn test_register_event_matches_local_semantics() {
    let store = store("register").await;
    let key = StreamKey::from("wolf");
    let policy = period(1);
    let t0 = Timestamp::from_secs(1_700_000_000);

    assert_eq!(store.register_event(&key, &policy, t0).unwrap(), Decision::Allow);
    for _ in 0..99 {
        assert_eq!(
            store.register_event(&key, &policy, t0).unwrap(),
            Decision::Suppress
        );
    }
    assert_eq!(store.get(&key).unwrap().unwrap().skipped_count, 99);

    assert_eq!(
        store
            .register_event(&key, &policy, t0 + Duration::from_secs(1))
            .unwrap(),
        Decision::AllowWithSummary { skipped: 99 }
    );
    store.clear().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires Redis
async fn test_allow_next_n_round_trip() {
    let store = store("allow_next_n").await;
    let key = StreamKey::from("k");
    let policy = period(60).with_allow_next_n(2);
    let t0 = Timestamp::from_secs(1_700_000_000);

    let decisions: Vec<_> = (0..4)
        .map(|_| store.register_event(&key, &policy, t0).unwrap())
        .collect();
    assert_eq!(
        decisions,
        vec![
            Decision::Allow,
            Decision::Allow,
            Decision::Allow,
            Decision::Suppress
        ]
    );
    store.clear().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires Redis
async fn test_partial_record_treated_as_absent() {
    let store = store("partial").await;
    let key = StreamKey::from("broken");

    let client = redis::Client::open(redis_url()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let _: () = conn
        .hset("test:partial:streams:broken", "skipped_count", 7)
        .await
        .unwrap();

    assert_eq!(store.get(&key).unwrap(), None);
    assert_eq!(
        store
            .register_event(&key, &period(60), Timestamp::from_secs(10))
            .unwrap(),
        Decision::Allow
    );
    let state = store.get(&key).unwrap().unwrap();
    assert_eq!(state.skipped_count, 0);
    assert_eq!(state.last_seen_time, Timestamp::from_secs(10));
    store.clear().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires Redis
async fn test_partial_record_removed_by_sweep() {
    let store = store("corrupt").await;

    let client = redis::Client::open(redis_url()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let _: () = conn
        .hset("test:corrupt:streams:broken", "skipped_count", 7)
        .await
        .unwrap();

    let scanned = store.scan().unwrap();
    assert_eq!(scanned.len(), 1);
    assert_eq!(scanned[0].1.last_seen_time, Timestamp::EPOCH);

    let reports = Arc::new(Mutex::new(Vec::<SuppressionSummary>::new()));
    let sink_reports = Arc::clone(&reports);
    let engine = DecisionEngine::builder(period(60))
        .with_store(Arc::new(store))
        .with_clock(Arc::new(ManualClock::new(Timestamp::from_secs(1_700_000_000))))
        .with_inline_sweep(false)
        .with_summary_sink(Arc::new(move |s: &SuppressionSummary| {
            sink_reports.lock().unwrap().push(s.clone());
        }))
        .build();

    assert_eq!(engine.sweep_expired(), 0);
    assert!(reports.lock().unwrap().is_empty());
    assert_eq!(engine.store().len().unwrap(), 0);
    assert_eq!(engine.metrics().snapshot().backend_errors, 0);
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires Redis
async fn test_put_get_scan_delete() {
    let store = store("crud").await;
    let state = StreamState {
        skipped_count: 3,
        ..StreamState::fresh(Timestamp::from_secs(42))
    };

    store.put(&"a".into(), state).unwrap();
    store.put(&"b".into(), state).unwrap();
    assert_eq!(store.get(&"a".into()).unwrap(), Some(state));
    assert_eq!(store.len().unwrap(), 2);

    let scanned: HashMap<_, _> = store.scan().unwrap().into_iter().collect();
    assert_eq!(scanned.get(&StreamKey::from("b")), Some(&state));

    assert!(store.delete(&"a".into()).unwrap());
    assert!(!store.delete(&"a".into()).unwrap());
    store.clear().unwrap();
    assert!(store.is_empty().unwrap());
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires Redis
async fn test_remove_if_stale_rechecks() {
    let store = store("stale").await;
    let key = StreamKey::from("k");
    let state = StreamState {
        skipped_count: 5,
        ..StreamState::fresh(Timestamp::from_secs(100))
    };
    store.put(&key, state).unwrap();

    assert_eq!(store.remove_if_stale(&key, Timestamp::from_secs(100)).unwrap(), None);
    assert_eq!(
        store.remove_if_stale(&key, Timestamp::from_secs(101)).unwrap(),
        Some(state)
    );
    assert_eq!(store.get(&key).unwrap(), None);
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires Redis
async fn test_long_stream_ids_stored() {
    let store = store("long").await;
    let id = "x".repeat(1_000);
    let key = StreamKey::from(id.as_str());
    let policy = period(60);
    let t0 = Timestamp::from_secs(1);

    assert!(store.register_event(&key, &policy, t0).unwrap().is_allow());
    assert!(store.register_event(&key, &policy, t0).unwrap().is_suppress());
    assert_eq!(store.len().unwrap(), 1);
    store.clear().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Requires Redis
async fn test_concurrent_processes_share_one_budget() {
    let t0 = Timestamp::from_secs(1_700_000_000);
    let mut engines = Vec::new();
    for _ in 0..4 {
        let store = store("fleet").await;
        engines.push(
            DecisionEngine::builder(period(60))
                .with_store(Arc::new(store))
                .with_clock(Arc::new(ManualClock::new(t0)))
                .with_inline_sweep(false)
                .build(),
        );
    }

    let handles: Vec<_> = engines
        .iter()
        .cloned()
        .map(|engine| {
            tokio::task::spawn_blocking(move || {
                (0..50)
                    .filter(|_| engine.decide(Some("shared")).is_allow())
                    .count()
            })
        })
        .collect();

    let mut allowed = 0;
    for handle in handles {
        allowed += handle.await.unwrap();
    }
    assert_eq!(allowed, 1);

    let state = engines[0]
        .store()
        .get(&StreamKey::from("shared"))
        .unwrap()
        .unwrap();
    assert_eq!(state.skipped_count, 199);
    engines[0].store().clear().unwrap();
}

#[test]
#[ignore] // Requires Redis
fn test_connect_blocking_outside_runtime() {
    let config = RedisStoreConfig::new("test:blocking")
        .unwrap()
        .with_ttl(Duration::from_secs(60));
    let store = RedisStore::connect_blocking(&redis_url(), config).expect("Failed to connect");
    store.clear().unwrap();

    let engine = DecisionEngine::builder(period(60))
        .with_store(Arc::new(store))
        .build();
    assert!(engine.decide(Some("k")).is_allow());
    assert!(engine.decide(Some("k")).is_suppress());
    engine.store().clear().unwrap();
}
