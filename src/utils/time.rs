use chrono::{DateTime, Local, TimeZone};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in microseconds since the Unix epoch.
pub fn now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// File modification time in integer nanoseconds. Missing files get 0 so
/// that a vanished source still fingerprints deterministically.
pub fn mtime_ns(path: &std::path::Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

pub fn to_datetime(us: i64) -> DateTime<Local> {
    Local
        .timestamp_micros(us)
        .single()
        .unwrap_or_else(|| Local.timestamp_micros(0).unwrap())
}

/// ISO-8601 rendering of a microsecond timestamp, for `list` output.
pub fn format_us(us: i64) -> String {
    to_datetime(us).format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// Human-readable age of a microsecond timestamp ("5 minutes ago").
pub fn time_ago(us: i64) -> String {
    let seconds = ((now_us() - us).max(0) / 1_000_000) as u64;
    let minutes = seconds / 60;
    let hours = minutes / 60;
    let days = hours / 24;
    if seconds < 60 {
        format!("{} seconds ago", seconds)
    } else if minutes < 60 {
        format!("{} minutes ago", minutes)
    } else if hours < 24 {
        format!("{} hours ago", hours)
    } else if days < 7 {
        format!("{} days ago", days)
    } else if days < 30 {
        format!("{} weeks ago", days / 7)
    } else if days < 365 {
        format!("{} months ago", days / 30)
    } else {
        format!("{} years ago", days / 365)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_ago_buckets() {
        let now = now_us();
        assert!(time_ago(now).ends_with("seconds ago"));
        assert_eq!(time_ago(now - 120 * 1_000_000), "2 minutes ago");
        assert_eq!(time_ago(now - 3 * 3600 * 1_000_000), "3 hours ago");
        assert_eq!(time_ago(now - 2 * 86400 * 1_000_000), "2 days ago");
    }
}
