//! Human-readable size strings and byte formatting.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Default per-disk safety margin (1 GiB).
pub const DEFAULT_DISK_MARGIN: u64 = 1024 * 1024 * 1024;

#[allow(clippy::unwrap_used)] // pattern is a compile-time constant
static SIZE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(\d+)\s*([KMGT])?\s*$").unwrap());

/// Error returned when a size string cannot be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid size string: {input:?}")]
pub struct SizeParseError {
    /// The string that failed to parse.
    pub input: String,
}

/// Parses a human-readable size string to bytes.
///
/// Accepted formats: `"1024"`, `"100K"`, `"500M"`, `"1G"`, `"2T"`, using
/// 1024-based units. A trailing `B` is tolerated as syntactic noise
/// (`"1GB"` == `"1G"`). Parsing is case-insensitive and ignores
/// surrounding whitespace.
///
/// # Errors
///
/// Returns [`SizeParseError`] on any other input, including negative
/// numbers, fractional values, and unknown suffixes.
pub fn parse_size(s: &str) -> Result<u64, SizeParseError> {
    // Strip an optional trailing 'B' (as in "1GB", "500MB").
    let trimmed = s.trim();
    let normalized = trimmed.strip_suffix(['B', 'b']).unwrap_or(trimmed);

    let captures = SIZE_PATTERN
        .captures(normalized)
        .ok_or_else(|| SizeParseError { input: s.into() })?;

    let number: u64 = captures[1]
        .parse()
        .map_err(|_| SizeParseError { input: s.into() })?;

    let multiplier = match captures.get(2).map(|m| m.as_str().to_ascii_uppercase()) {
        Some(suffix) => match suffix.as_str() {
            "K" => 1024,
            "M" => 1024 * 1024,
            "G" => 1024 * 1024 * 1024,
            _ => 1024u64 * 1024 * 1024 * 1024, // "T" - the regex admits nothing else
        },
        None => 1,
    };

    Ok(number * multiplier)
}

/// Formats a byte count as a short human-readable string.
///
/// ```
/// use bulkdl_core::bulk::format_bytes;
///
/// assert_eq!(format_bytes(0), "0 B");
/// assert_eq!(format_bytes(1024), "1.0 KB");
/// assert_eq!(format_bytes(1_073_741_824), "1.0 GB");
/// ```
#[must_use]
pub fn format_bytes(n: u64) -> String {
    if n < 1024 {
        return format!("{n} B");
    }
    #[allow(clippy::cast_precision_loss)]
    let mut value = n as f64;
    for unit in ["KB", "MB", "GB", "TB"] {
        value /= 1024.0;
        if value < 1024.0 || unit == "TB" {
            return format!("{value:.1} {unit}");
        }
    }
    unreachable!("loop always returns on the TB unit")
}
