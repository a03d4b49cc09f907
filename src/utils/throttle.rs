//! Log throttling utility
//!
//! Detection requests run five times a second; when the detector is down the
//! same failure would otherwise be logged on every tick.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct KeyState {
    last_logged: Instant,
    suppressed: u64,
}

/// Limits how often a message with the same key is logged
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use vision_link::utils::LogThrottler;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
/// assert!(throttler.should_log("detect_failed"));
/// assert!(!throttler.should_log("detect_failed"));
/// assert_eq!(throttler.suppressed("detect_failed"), 1);
/// ```
pub struct LogThrottler {
    keys: Mutex<HashMap<String, KeyState>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `true` if the message should be logged now.
    ///
    /// A suppressed call increments the key's suppressed counter, which is
    /// reset the next time the key is allowed through.
    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut keys = self.keys.lock();

        match keys.get_mut(key) {
            Some(state) if now.duration_since(state.last_logged) < self.interval => {
                state.suppressed += 1;
                false
            }
            Some(state) => {
                state.last_logged = now;
                state.suppressed = 0;
                true
            }
            None => {
                keys.insert(
                    key.to_string(),
                    KeyState {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                true
            }
        }
    }

    /// Number of calls suppressed since the key was last logged
    pub fn suppressed(&self, key: &str) -> u64 {
        self.keys.lock().get(key).map(|s| s.suppressed).unwrap_or(0)
    }

    /// Forget a key once its error condition has recovered, so the next
    /// failure is logged immediately.
    pub fn clear(&self, key: &str) {
        self.keys.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `tracing::warn!`
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::warn!($($arg)*);
        }
    };
}

/// Throttled `tracing::debug!`
#[macro_export]
macro_rules! debug_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::debug!($($arg)*);
        }
    };
}
