//! Human-friendly unit parsing
//!
//! Memory sizes ("512MB", "1G", "0.5G") and durations ("100ms", "30s", "30d") as they appear in
//! configuration files.

use std::time::Duration;
use thiserror::Error;

/// Unit parsing errors
#[derive(Debug, Error, PartialEq)]
pub enum UnitParseError {
    #[error("Invalid format: '{input}'. Expected a number followed by an optional unit")]
    InvalidFormat { input: String },

    #[error("Invalid memory unit: {unit}. Supported units: B, K, M, G, T (with optional 'B' suffix)")]
    InvalidMemoryUnit { unit: String },

    #[error("Invalid duration unit: {unit}. Supported units: ms, s, m, h, d")]
    InvalidDurationUnit { unit: String },

    #[error("Invalid value: {value}. Must be a non-negative number")]
    InvalidValue { value: String },

    #[error("Value too large: {input}")]
    TooLarge { input: String },
}

/// Parse a memory size into bytes
///
/// ```
/// use plugin_runtime::units::parse_memory_size;
///
/// assert_eq!(parse_memory_size("1024").unwrap(), 1024);
/// assert_eq!(parse_memory_size("512MB").unwrap(), 512 * 1024 * 1024);
/// assert_eq!(parse_memory_size("0.5G").unwrap(), 512 * 1024 * 1024);
/// ```
pub fn parse_memory_size(input: &str) -> Result<u64, UnitParseError> {
    let normalized = input.trim().to_uppercase();
    let (value, unit) = split_number(&normalized)?;

    let multiplier: u64 = match unit.trim() {
        "" | "B" | "BYTES" => 1,
        "K" | "KB" | "KIB" => 1024,
        "M" | "MB" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GIB" => 1024 * 1024 * 1024,
        "T" | "TB" | "TIB" => 1024_u64.pow(4),
        other => return Err(UnitParseError::InvalidMemoryUnit { unit: other.to_string() }),
    };

    let bytes = value * multiplier as f64;
    if bytes >= u64::MAX as f64 {
        return Err(UnitParseError::TooLarge { input: input.to_string() });
    }
    Ok(bytes as u64)
}

/// Parse a memory size into (fractional) megabytes
pub fn parse_memory_mb(input: &str) -> Result<f64, UnitParseError> {
    parse_memory_size(input).map(|bytes| bytes as f64 / (1024.0 * 1024.0))
}

/// Parse a duration; a bare number is seconds
///
/// ```
/// use std::time::Duration;
/// use plugin_runtime::units::parse_duration;
///
/// assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
/// assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
/// assert_eq!(parse_duration("30d").unwrap(), Duration::from_secs(30 * 86_400));
/// ```
pub fn parse_duration(input: &str) -> Result<Duration, UnitParseError> {
    let normalized = input.trim().to_lowercase();
    let (value, unit) = split_number(&normalized)?;

    let nanos_per_unit = match unit.trim() {
        "ms" | "msec" | "millis" => 1e6,
        "" | "s" | "sec" | "secs" | "seconds" => 1e9,
        "m" | "min" | "mins" | "minutes" => 6e10,
        "h" | "hr" | "hours" => 3.6e12,
        "d" | "day" | "days" => 8.64e13,
        other => return Err(UnitParseError::InvalidDurationUnit { unit: other.to_string() }),
    };

    let nanos = (value * nanos_per_unit).round();
    if nanos >= u64::MAX as f64 {
        return Err(UnitParseError::TooLarge { input: input.to_string() });
    }
    Ok(Duration::from_nanos(nanos as u64))
}

/// Format bytes as human-readable string
pub fn format_memory_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const THRESHOLD: f64 = 1024.0;

    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= THRESHOLD && unit_index < UNITS.len() - 1 {
        size /= THRESHOLD;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else if size.fract() == 0.0 {
        format!("{:.0} {}", size, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

/// Split a leading decimal number from its unit suffix
fn split_number(input: &str) -> Result<(f64, &str), UnitParseError> {
    let mut number_end = 0;
    let mut found_decimal = false;

    for (i, ch) in input.char_indices() {
        match ch {
            '0'..='9' => number_end = i + 1,
            '.' if !found_decimal => {
                found_decimal = true;
                number_end = i + 1;
            }
            _ => break,
        }
    }

    if number_end == 0 {
        return Err(UnitParseError::InvalidFormat { input: input.to_string() });
    }

    let number = &input[..number_end];
    let value = number.parse::<f64>()
        .map_err(|_| UnitParseError::InvalidValue { value: number.to_string() })?;
    Ok((value, &input[number_end..]))
}
