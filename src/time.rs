use std::time::UNIX_EPOCH;

/// Milliseconds since the Unix epoch, for duration log lines.
pub fn now_unix_millis() -> u128 {
    UNIX_EPOCH.elapsed().map(|d| d.as_millis()).unwrap_or(0)
}
