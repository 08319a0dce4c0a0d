//! Redis-backed stream store.
//!
//! Lets several processes share suppression state, so a stream is limited
//! across the whole fleet rather than per process.
//!
//! ## Data model
//!
//! Each stream is one Redis hash at `{prefix}:streams:{stream_id}` with the
//! fields `next_valid_time`, `skipped_count`, `allow_next_n_remaining` and
//! `last_seen_time` (times in microseconds since the Unix epoch). A hash with a
//! missing or unparsable field is treated as absent.
//!
//! Registering an event and removing a stale stream each run as a single Lua
//! script, so concurrent processes never lose an update.
//!
//! Keys longer than 192 bytes are shortened to the first 32 characters of the
//! stream identifier plus a digest of the whole identifier.
//!
//! ## Runtime
//!
//! The [`StreamStore`] port is synchronous. Calls made from inside a
//! multi-threaded tokio runtime use `block_in_place`; calls from plain threads
//! block on the runtime the store was connected on. Do not use the store from
//! a current-thread runtime.
//!
//! ## Example
//!
//! ```rust,no_run
//! use stream_throttle::{DecisionEngine, Policy, RedisStore, RedisStoreConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RedisStoreConfig::new("billing")?.with_ttl(Duration::from_secs(3600));
//! let store = RedisStore::connect_blocking("redis://127.0.0.1/", config)?;
//!
//! let engine = DecisionEngine::builder(Policy::new(Duration::from_secs(60))?)
//!     .with_store(Arc::new(store))
//!     .build();
//! engine.decide(Some("payment gateway timeout"));
//! # Ok(())
//! # }
//! ```

use crate::application::config::DEFAULT_REDIS_PREFIX;
use crate::application::ports::{StoreError, StreamStore};
use crate::domain::policy::{ConfigError, Decision, Policy};
use crate::domain::stream::{StreamKey, StreamState};
use crate::domain::time::{duration_micros, Timestamp};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};

/// Longest accepted key prefix, in characters.
pub const MAX_PREFIX_LEN: usize = 64;

const MAX_KEY_LEN: usize = 192;
const SHORT_ID_CHARS: usize = 32;
const DIGEST_HEX_CHARS: usize = 32;
const SCAN_BATCH: usize = 100;

// KEYS[1] stream hash
// ARGV: now, period, allow_next_n, ttl seconds (0 = none)
// Returns {allowed, skipped}
const REGISTER_EVENT_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local period = tonumber(ARGV[2])
local allow_next_n = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local fields = redis.call("HMGET", key, "next_valid_time", "skipped_count", "allow_next_n_remaining", "last_seen_time")
local next_valid = tonumber(fields[1])
local skipped = tonumber(fields[2])
local remaining = tonumber(fields[3])

if next_valid == nil or skipped == nil or remaining == nil or tonumber(fields[4]) == nil then
    next_valid = now
    skipped = 0
    remaining = 0
end

local allowed = 1
local summary = 0

if remaining > 0 then
    remaining = remaining - 1
elseif now >= next_valid then
    summary = skipped
    next_valid = now + period
    skipped = 0
    remaining = allow_next_n
else
    skipped = skipped + 1
    allowed = 0
end

redis.call("HSET", key,
    "next_valid_time", string.format("%.0f", next_valid),
    "skipped_count", string.format("%.0f", skipped),
    "allow_next_n_remaining", string.format("%.0f", remaining),
    "last_seen_time", string.format("%.0f", now))

if ttl > 0 then
    redis.call("EXPIRE", key, ttl)
end

return {allowed, summary}
"#;

// KEYS[1] stream hash
// ARGV: cutoff
// Returns the removed record, or nil if the stream is absent or fresh
const REMOVE_IF_STALE_SCRIPT: &str = r#"
local key = KEYS[1]
if redis.call("EXISTS", key) == 0 then
    return false
end

local last_seen = tonumber(redis.call("HGET", key, "last_seen_time"))
if last_seen ~= nil and last_seen >= tonumber(ARGV[1]) then
    return false
end

local record = redis.call("HGETALL", key)
redis.call("DEL", key)
return record
"#;

/// Settings of a [`RedisStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisStoreConfig {
    prefix: String,
    ttl: Option<Duration>,
}

impl RedisStoreConfig {
    /// Store streams under `prefix`.
    ///
    /// # Errors
    /// Returns `ConfigError::PrefixTooLong` if `prefix` exceeds
    /// [`MAX_PREFIX_LEN`] characters.
    pub fn new(prefix: &str) -> Result<Self, ConfigError> {
        let len = prefix.chars().count();
        if len > MAX_PREFIX_LEN {
            return Err(ConfigError::PrefixTooLong {
                len,
                max: MAX_PREFIX_LEN,
            });
        }
        Ok(Self {
            prefix: prefix.to_owned(),
            ttl: None,
        })
    }

    /// Let Redis drop streams that see no event for `ttl`, in addition to
    /// the sweeper. Rounded up to whole seconds.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    fn ttl_secs(&self) -> u64 {
        match self.ttl {
            None => 0,
            Some(ttl) => {
                let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
                secs.max(1)
            }
        }
    }
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_REDIS_PREFIX.to_owned(),
            ttl: None,
        }
    }
}

/// Stream store shared through Redis.
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
    namespace: String,
    handle: Handle,
    owned_runtime: Option<Runtime>,
    register_script: Script,
    remove_script: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .field("namespace", &self.namespace)
            .field("owns_runtime", &self.owned_runtime.is_some())
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect from within a tokio runtime.
    ///
    /// The store performs its I/O on the current runtime, which must be
    /// multi-threaded and outlive the store.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str, config: RedisStoreConfig) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self::with_connection(
            connection,
            config,
            Handle::current(),
            None,
        ))
    }

    /// Connect from synchronous code.
    ///
    /// The store owns a small runtime that drives the connection.
    ///
    /// # Errors
    /// Returns an error if the runtime cannot be started, the URL is invalid
    /// or the server is unreachable.
    pub fn connect_blocking(url: &str, config: RedisStoreConfig) -> Result<Self, StoreError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("stream-throttle-redis")
            .enable_all()
            .build()
            .map_err(|e| StoreError::Unavailable(format!("failed to start runtime: {e}")))?;

        let client = Client::open(url)?;
        let handle = runtime.handle().clone();
        let connection = match bridge(&handle, ConnectionManager::new(client)) {
            Ok(connection) => connection,
            Err(e) => {
                runtime.shutdown_background();
                return Err(e.into());
            }
        };

        Ok(Self::with_connection(
            connection,
            config,
            handle,
            Some(runtime),
        ))
    }

    fn with_connection(
        connection: ConnectionManager,
        config: RedisStoreConfig,
        handle: Handle,
        owned_runtime: Option<Runtime>,
    ) -> Self {
        let namespace = format!("{}:streams:", config.prefix);
        Self {
            connection,
            config,
            namespace,
            handle,
            owned_runtime,
            register_script: Script::new(REGISTER_EVENT_SCRIPT),
            remove_script: Script::new(REMOVE_IF_STALE_SCRIPT),
        }
    }

    pub fn config(&self) -> &RedisStoreConfig {
        &self.config
    }

    fn key(&self, key: &StreamKey) -> String {
        redis_key(&self.namespace, key)
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        bridge(&self.handle, future)
    }

    async fn scan_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut connection = self.connection.clone();
        let pattern = format!("{}*", escape_pattern(&self.namespace));
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut connection)
                .await?;

            keys.extend(batch);
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }

        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    async fn read_fields(&self, redis_key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut connection = self.connection.clone();
        Ok(connection.hgetall(redis_key).await?)
    }

    async fn read(&self, redis_key: &str) -> Result<Option<StreamState>, StoreError> {
        let fields = self.read_fields(redis_key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(StreamState::from_fields(&fields))
    }
}

impl Drop for RedisStore {
    fn drop(&mut self) {
        // Dropping a runtime blocks, which is not allowed inside another runtime.
        if let Some(runtime) = self.owned_runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl StreamStore for RedisStore {
    fn get(&self, key: &StreamKey) -> Result<Option<StreamState>, StoreError> {
        let redis_key = self.key(key);
        self.block_on(self.read(&redis_key))
    }

    fn put(&self, key: &StreamKey, state: StreamState) -> Result<(), StoreError> {
        let redis_key = self.key(key);
        let fields = state.to_fields();
        let ttl_secs = self.config.ttl_secs();

        self.block_on(async {
            let mut connection = self.connection.clone();
            let mut pipe = redis::pipe();
            pipe.atomic().hset_multiple(&redis_key, &fields).ignore();
            if ttl_secs > 0 {
                pipe.expire(&redis_key, ttl_secs as i64).ignore();
            }
            let () = pipe.query_async(&mut connection).await?;
            Ok::<_, StoreError>(())
        })
    }

    fn delete(&self, key: &StreamKey) -> Result<bool, StoreError> {
        let redis_key = self.key(key);
        self.block_on(async {
            let mut connection = self.connection.clone();
            let removed: u64 = connection.del(&redis_key).await?;
            Ok::<_, StoreError>(removed > 0)
        })
    }

    fn scan(&self) -> Result<Vec<(StreamKey, StreamState)>, StoreError> {
        self.block_on(async {
            let mut streams = Vec::new();
            for redis_key in self.scan_keys().await? {
                let Some(id) = redis_key.strip_prefix(&self.namespace) else {
                    continue;
                };
                let fields = self.read_fields(&redis_key).await?;
                if fields.is_empty() {
                    continue;
                }
                // Unreadable records look idle since the epoch, so a sweep
                // removes them instead of skipping them forever.
                let state = StreamState::from_fields(&fields)
                    .unwrap_or_else(|| StreamState::fresh(Timestamp::EPOCH));
                streams.push((StreamKey::from(id), state));
            }
            Ok::<_, StoreError>(streams)
        })
    }

    fn register_event(
        &self,
        key: &StreamKey,
        policy: &Policy,
        now: Timestamp,
    ) -> Result<Decision, StoreError> {
        let redis_key = self.key(key);

        let (allowed, skipped): (u8, u64) = self.block_on(async {
            let mut connection = self.connection.clone();
            self.register_script
                .key(&redis_key)
                .arg(now.as_micros())
                .arg(duration_micros(policy.period()))
                .arg(policy.allow_next_n())
                .arg(self.config.ttl_secs())
                .invoke_async(&mut connection)
                .await
        })?;

        Ok(match (allowed, skipped) {
            (0, _) => Decision::Suppress,
            (_, 0) => Decision::Allow,
            (_, skipped) => Decision::AllowWithSummary { skipped },
        })
    }

    fn remove_if_stale(
        &self,
        key: &StreamKey,
        cutoff: Timestamp,
    ) -> Result<Option<StreamState>, StoreError> {
        let redis_key = self.key(key);

        let removed: Option<HashMap<String, String>> = self.block_on(async {
            let mut connection = self.connection.clone();
            self.remove_script
                .key(&redis_key)
                .arg(cutoff.as_micros())
                .invoke_async(&mut connection)
                .await
        })?;

        Ok(removed.map(|fields| {
            // A corrupt record is removed without anything to report.
            StreamState::from_fields(&fields).unwrap_or_else(|| StreamState::fresh(Timestamp::EPOCH))
        }))
    }

    fn len(&self) -> Result<usize, StoreError> {
        self.block_on(async { Ok::<_, StoreError>(self.scan_keys().await?.len()) })
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.block_on(async {
            let keys = self.scan_keys().await?;
            let mut connection = self.connection.clone();
            for batch in keys.chunks(SCAN_BATCH) {
                let _: u64 = connection.del(batch).await?;
            }
            Ok::<_, StoreError>(())
        })
    }
}

/// Run `future` to completion on `handle` from synchronous code.
fn bridge<F: Future>(handle: &Handle, future: F) -> F::Output {
    match Handle::try_current() {
        Ok(_) => tokio::task::block_in_place(|| handle.block_on(future)),
        Err(_) => handle.block_on(future),
    }
}

fn redis_key(namespace: &str, key: &StreamKey) -> String {
    let full = format!("{namespace}{key}");
    if full.len() <= MAX_KEY_LEN {
        return full;
    }

    let id = key.as_str();
    let head: String = id.chars().take(SHORT_ID_CHARS).collect();
    let digest = blake3::hash(id.as_bytes()).to_hex();
    format!(
        "{namespace}{head}...({})",
        &digest.as_str()[..DIGEST_HEX_CHARS]
    )
}

/// Escape glob metacharacters so `pattern` only matches itself in `SCAN MATCH`.
fn escape_pattern(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
