//! Example demonstrating Redis-backed stream state shared across processes.
//!
//! Every process pointing at the same Redis server and prefix shares one
//! budget per stream, so a fleet of replicas logs a failing dependency once
//! per period instead of once per replica.
//!
//! # Quick Start
//!
//! 1. Start Redis:
//!    ```bash
//!    docker run -p 6379:6379 redis:7-alpine
//!    ```
//!
//! 2. Run the example in two terminals at the same time:
//!    ```bash
//!    cargo run --example redis --features redis-storage
//!    ```
//!
//! Only one of the two processes logs each burst; the other sees the stream
//! already emitted by its peer.

use std::sync::Arc;
use std::time::Duration;
use stream_throttle::{Policy, RedisStore, RedisStoreConfig, StreamRateLimitLayer};
use tracing::{error, info};
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

    // Idle stream records disappear on their own after 5 minutes
    let config = RedisStoreConfig::new("stream_throttle_demo")?.with_ttl(Duration::from_secs(300));
    let store = RedisStore::connect(&url, config).await?;

    let policy = Policy::new(Duration::from_secs(2))?;
    let rate_limit = StreamRateLimitLayer::builder(policy)
        .with_store(Arc::new(store))
        .build()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(rate_limit.clone()))
        .init();

    info!(throttle = false, %url, "starting Redis-backed rate limiting example");

    for round in 1..=5 {
        for attempt in 1..=50 {
            error!(stream_id = "upstream", round, attempt, "upstream connection refused");
        }
        tokio::time::sleep(Duration::from_millis(2100)).await;
        rate_limit.emit_pending();
    }

    let snapshot = rate_limit.metrics().snapshot();
    info!(
        throttle = false,
        allowed = snapshot.events_allowed,
        suppressed = snapshot.events_suppressed,
        backend_errors = snapshot.backend_errors,
        "example complete"
    );

    Ok(())
}
