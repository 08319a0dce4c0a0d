//! Clock adapters for time operations.
//!
//! [`SystemClock`] is monotonic within a process but anchored to the wall
//! clock, so timestamps written by different processes to a shared store
//! remain comparable. [`ManualClock`] is driven explicitly by tests.

use crate::application::ports::Clock;
use crate::domain::time::Timestamp;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

/// Production clock.
///
/// Captures the wall-clock time once and advances it with `Instant`, so
/// readings never go backwards when the system clock is adjusted.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    wall_anchor: Timestamp,
    mono_anchor: Instant,
}

impl SystemClock {
    /// Create a new system clock anchored at the current time.
    pub fn new() -> Self {
        Self {
            wall_anchor: Timestamp::from_system_time(SystemTime::now()),
            mono_anchor: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        self.wall_anchor + self.mono_anchor.elapsed()
    }
}

/// Clock that only moves when told to.
///
/// Clones share the same time, so a test can hand one clone to an engine
/// and advance another.
///
/// # Examples
///
/// ```
/// use stream_throttle::{Clock, ManualClock, Timestamp};
/// use std::time::Duration;
///
/// let clock = ManualClock::new(Timestamp::from_secs(100));
/// clock.advance(Duration::from_millis(1500));
/// assert_eq!(clock.now(), Timestamp::from_secs_f64(101.5));
///
/// clock.set(Timestamp::from_secs(5));
/// assert_eq!(clock.now(), Timestamp::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<Timestamp>>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Start at the current wall-clock time.
    pub fn starting_now() -> Self {
        Self::new(Timestamp::from_system_time(SystemTime::now()))
    }

    pub fn advance(&self, duration: Duration) {
        let mut time = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *time = *time + duration;
    }

    pub fn set(&self, time: Timestamp) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = time;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}
