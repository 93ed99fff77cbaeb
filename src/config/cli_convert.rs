//! CLI string conversion utilities

use anyhow::{Context, Result};
use std::time::Duration;

/// Parse a duration string (e.g., "500ms", "60s", "5m", "1h") to a Duration
///
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();
    if s.is_empty() {
        anyhow::bail!("Empty duration string");
    }

    let (num_str, millis_per_unit) = if s.ends_with("ms") {
        (s.trim_end_matches("ms"), 1u64)
    } else if s.ends_with("sec") || s.ends_with('s') {
        (s.trim_end_matches("sec").trim_end_matches('s'), 1000)
    } else if s.ends_with("min") || s.ends_with('m') {
        (s.trim_end_matches("min").trim_end_matches('m'), 60_000)
    } else if s.ends_with("hr") || s.ends_with('h') {
        (s.trim_end_matches("hr").trim_end_matches('h'), 3_600_000)
    } else {
        (s.as_str(), 1000)
    };

    let num: u64 = num_str.trim().parse()
        .with_context(|| format!("Invalid duration format: {}", s))?;

    let millis = num
        .checked_mul(millis_per_unit)
        .with_context(|| format!("Duration out of range: {}", s))?;

    Ok(Duration::from_millis(millis))
}

/// Parse an optional duration string
pub fn parse_optional_duration(s: Option<&str>) -> Result<Option<Duration>> {
    s.map(parse_duration).transpose()
}

/// Normalize a store address, adding `default_port` when none is given
pub fn normalize_addr(addr: &str, default_port: u16) -> String {
    let addr = addr.trim();
    if addr.contains(':') {
        addr.to_string()
    } else {
        format!("{}:{}", addr, default_port)
    }
}
