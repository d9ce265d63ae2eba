//! Display helpers for status output.

use std::time::Duration;

const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

/// Human-readable byte count: `"0 B"`, `"1.50 KB"`, `"3.20 MB"`...
///
/// Base 1024, two decimals, GB is the largest unit.
pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    format!("{:.2} {}", value, UNITS[unit])
}

/// `HH:MM:SS`; hours keep growing past 99
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
