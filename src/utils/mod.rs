//! Common utilities

pub mod throttle;

pub use throttle::LogThrottler;

/// Wall-clock milliseconds since the Unix epoch
pub fn unix_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
