//! # Utility Functions
//!
//! Formatting helpers for human-readable log and notification output, plus
//! wall-clock helpers producing the epoch-millisecond timestamps used by
//! snapshots and summaries.

use chrono::{TimeZone, Utc};

/// Get current timestamp as milliseconds since Unix epoch
///
/// Snapshots and reporting queries express time as epoch milliseconds. If the
/// system clock is before the Unix epoch, returns 0 rather than panicking.
pub fn current_timestamp_ms() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default()
}

/// Format an epoch-millisecond timestamp as a UTC date and time
///
/// ## Examples
///
/// ```rust
/// # use stats_aggregator::utils::format_timestamp_ms;
/// assert_eq!(format_timestamp_ms(1_500), "1970-01-01 00:00:01.500");
/// ```
pub fn format_timestamp_ms(timestamp_ms: u64) -> String {
    match i64::try_from(timestamp_ms)
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
        None => format!("{}ms", timestamp_ms),
    }
}

/// Format latency value for human-readable output
///
/// The function automatically selects the most appropriate unit:
/// - Nanoseconds for values < 1,000 ns
/// - Microseconds for values < 1,000,000 ns
/// - Milliseconds for values < 1,000,000,000 ns
/// - Seconds otherwise
pub fn format_latency(latency_ns: u64) -> String {
    if latency_ns < 1_000 {
        format!("{}ns", latency_ns)
    } else if latency_ns < 1_000_000 {
        format!("{:.2}μs", latency_ns as f64 / 1_000.0)
    } else if latency_ns < 1_000_000_000 {
        format!("{:.2}ms", latency_ns as f64 / 1_000_000.0)
    } else {
        format!("{:.2}s", latency_ns as f64 / 1_000_000_000.0)
    }
}
