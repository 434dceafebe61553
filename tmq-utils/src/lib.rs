//! Small helpers shared by the tmq crates
//!
//! ## Core Features:
//! - **Counters**: Thread-safe current/max counter ([`Counter`]) used for broker statistics
//! - **Duration Conversion**: `"1h30m15s"` style strings to [`Duration`], plus a serde helper
//! - **Timestamp Utilities**: Millisecond timestamps, the clock the delivery engine runs on
//!
//! ```
//! use tmq_utils::{to_duration, timestamp_millis};
//!
//! let retry = to_duration("20s");
//! assert_eq!(retry.as_millis(), 20_000);
//!
//! assert!(timestamp_millis() > 0);
//! ```

#![deny(unsafe_code)]

use std::time::Duration;

use serde::{de::Deserializer, Deserialize};

mod counter;

pub use counter::Counter;

/// Timestamp representation in milliseconds since Unix epoch
pub type TimestampMillis = i64;

/// Deserialize Duration from human-readable string format
#[inline]
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    Ok(to_duration(&v))
}

/// Convert human-readable duration string to Duration
///
/// # Supported units:
/// - ms: milliseconds
/// - s: seconds
/// - m: minutes
/// - h: hours
/// - d: days
///
/// # Example:
/// ```
/// let duration = tmq_utils::to_duration("1h30m15s");
/// assert_eq!(duration.as_secs(), 5415);
///
/// let short = tmq_utils::to_duration("1s500ms");
/// assert_eq!(short.as_millis(), 1500);
/// ```
#[inline]
pub fn to_duration(text: &str) -> Duration {
    let text = text.to_lowercase().replace("ms", "Y");
    let ms: u64 = text
        .split_inclusive(['s', 'm', 'h', 'd', 'Y'])
        .map(|x| {
            let mut chars = x.chars();
            let u = match chars.nth_back(0) {
                None => return 0,
                Some(u) => u,
            };
            let v = match chars.as_str().trim().parse::<u64>() {
                Err(_e) => return 0,
                Ok(v) => v,
            };
            match u {
                'Y' => v,
                's' => v * 1000,
                'm' => v * 60000,
                'h' => v * 3600000,
                'd' => v * 86400000,
                _ => 0,
            }
        })
        .sum();
    Duration::from_millis(ms)
}

/// Get current timestamp in milliseconds
///
/// # Example:
/// ```
/// let ts = tmq_utils::timestamp_millis();
/// assert!(ts > 0);
/// ```
#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.as_millis() as i64)
        .unwrap_or_else(|_| chrono::Local::now().timestamp_millis())
}

/// Format millisecond timestamp to string
#[inline]
pub fn format_timestamp_millis(t: TimestampMillis) -> String {
    if t <= 0 {
        "".into()
    } else {
        use chrono::TimeZone;
        if let chrono::LocalResult::Single(t) = chrono::Local.timestamp_millis_opt(t) {
            t.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
        } else {
            "".into()
        }
    }
}
