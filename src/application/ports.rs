//! Ports (interfaces) for the application layer.
//!
//! In hexagonal architecture, ports define the interfaces that the application
//! layer needs. Infrastructure adapters implement these ports.

use crate::domain::policy::{Decision, Policy};
use crate::domain::stream::{StreamKey, StreamState};
use crate::domain::time::Timestamp;
use std::fmt::Debug;

/// Port for obtaining current time.
///
/// Infrastructure provides `SystemClock` for production and `ManualClock`
/// for tests.
pub trait Clock: Send + Sync + Debug {
    /// Get the current time.
    fn now(&self) -> Timestamp;
}

/// Error raised by a stream store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached or refused the operation.
    #[error("stream store unavailable: {0}")]
    Unavailable(String),
    /// The backend answered with something the store cannot interpret.
    #[error("unexpected reply from stream store: {0}")]
    Protocol(String),
    /// Error reported by the Redis client.
    #[cfg(feature = "redis-storage")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Port for stream state storage.
///
/// Implementations must make [`StreamStore::register_event`] atomic per key:
/// two concurrent calls for the same key observe each other's writes. A
/// record that is partially written or cannot be parsed is treated as absent.
pub trait StreamStore: Send + Sync + Debug {
    /// Read a stream's state.
    fn get(&self, key: &StreamKey) -> Result<Option<StreamState>, StoreError>;

    /// Replace a stream's state as a whole.
    fn put(&self, key: &StreamKey, state: StreamState) -> Result<(), StoreError>;

    /// Remove a stream's state. Returns whether anything was removed.
    fn delete(&self, key: &StreamKey) -> Result<bool, StoreError>;

    /// Snapshot of all streams. May miss or repeat streams changed concurrently.
    ///
    /// Records that cannot be decoded are listed as idle since the epoch so
    /// that expiration removes them.
    fn scan(&self) -> Result<Vec<(StreamKey, StreamState)>, StoreError>;

    /// Atomically load (or create) the state of `key`, register an event at
    /// `now` under `policy`, persist the result and return the decision.
    fn register_event(
        &self,
        key: &StreamKey,
        policy: &Policy,
        now: Timestamp,
    ) -> Result<Decision, StoreError>;

    /// Remove `key` only if it is still stale relative to `cutoff` at the time
    /// of removal. Returns the removed state.
    fn remove_if_stale(
        &self,
        key: &StreamKey,
        cutoff: Timestamp,
    ) -> Result<Option<StreamState>, StoreError>;

    /// Number of stored streams.
    fn len(&self) -> Result<usize, StoreError>;

    /// Check whether no streams are stored.
    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Remove every stream.
    fn clear(&self) -> Result<(), StoreError>;
}
