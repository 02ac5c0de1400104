//! Parsers for the unit grammar the configuration
//! surface uses: binary byte sizes (`KB|MB|GB|TB`), rates (`<size>/s`, `0` =
//! unlimited), and human-readable durations.

use std::time::Duration;

use crate::error::ConfigError;

const KB: u64 = 1024;
const MB: u64 = KB * 1024;
const GB: u64 = MB * 1024;
const TB: u64 = GB * 1024;

/// Parses a byte size such as `"512MB"`, `"2GB"`, or a bare integer (bytes).
/// `"0"` means zero, not unlimited — callers that treat `0` as "unlimited"
/// (rate fields) should check the value after parsing.
pub fn parse_size(raw: &str) -> Result<u64, ConfigError> {
    let trimmed = raw.trim();
    let invalid = || ConfigError::InvalidValue(format!("not a valid size: {raw:?}"));

    let (digits, multiplier) = if let Some(n) = trimmed.strip_suffix("TB") {
        (n, TB)
    } else if let Some(n) = trimmed.strip_suffix("GB") {
        (n, GB)
    } else if let Some(n) = trimmed.strip_suffix("MB") {
        (n, MB)
    } else if let Some(n) = trimmed.strip_suffix("KB") {
        (n, KB)
    } else if let Some(n) = trimmed.strip_suffix('B') {
        (n, 1)
    } else {
        (trimmed, 1)
    };

    let value: f64 = digits.trim().parse().map_err(|_| invalid())?;
    if value < 0.0 {
        return Err(invalid());
    }
    Ok((value * multiplier as f64).round() as u64)
}

/// Parses a rate such as `"10MB/s"` or `"0"` (unlimited). The `/s` suffix is
/// optional — `transfer.max_upload_rate` etc. are always byte rates, so a
/// bare size is accepted too.
pub fn parse_rate(raw: &str) -> Result<u64, ConfigError> {
    let trimmed = raw.trim();
    let without_suffix = trimmed.strip_suffix("/s").unwrap_or(trimmed);
    parse_size(without_suffix)
}

/// Parses a human-readable duration (`"10s"`, `"5m"`, `"1h"`) via `humantime`.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(raw.trim())
        .map_err(|e| ConfigError::InvalidValue(format!("not a valid duration {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_bytes() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("0").unwrap(), 0);
    }

    #[test]
    fn parses_binary_suffixes() {
        assert_eq!(parse_size("1KB").unwrap(), 1024);
        assert_eq!(parse_size("2MB").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_size("1.5GB").unwrap(), (1.5 * 1024.0 * 1024.0 * 1024.0) as u64);
        assert_eq!(parse_size("1TB").unwrap(), 1024u64.pow(4));
    }

    #[test]
    fn parses_rate_with_and_without_suffix() {
        assert_eq!(parse_rate("10MB/s").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_rate("10MB").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_rate("0").unwrap(), 0);
    }

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_size("not-a-size").is_err());
        assert!(parse_duration("not-a-duration").is_err());
    }
}
