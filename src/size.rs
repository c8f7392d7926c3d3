//! Human-readable size strings.

use crate::error::{Error, Result};

pub const KB: u64 = 1024;
pub const MB: u64 = KB * 1024;
pub const GB: u64 = MB * 1024;
pub const TB: u64 = GB * 1024;

const UNITS: [(&str, u64); 4] = [("KB", KB), ("MB", MB), ("GB", GB), ("TB", TB)];

fn is_decimal(s: &str) -> bool {
    let (int, frac) = match s.split_once('.') {
        Some((int, frac)) => (int, Some(frac)),
        None => (s, None),
    };
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    digits(int) && frac.map_or(true, digits)
}

fn parse_number(original: &str, number: &str) -> Result<f64> {
    match number.trim().parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => Ok(value),
        _ => Err(Error::InvalidSize(original.to_string())),
    }
}

/// Parses a size such as `"5.2GB"`, `"100 B"` or `"100.3"` into a number of bytes.
///
/// The unit suffix is case-insensitive and uses binary multiples (`1KB == 1024`).  A bare number
/// is taken as bytes.
pub fn parse_size(value: &str) -> Result<f64> {
    let trimmed = value.trim();

    if trimmed.len() >= 2 && trimmed.is_char_boundary(trimmed.len() - 2) {
        let (number, suffix) = trimmed.split_at(trimmed.len() - 2);
        for (unit, multiplier) in UNITS {
            if suffix.eq_ignore_ascii_case(unit) {
                return Ok(parse_number(value, number)? * multiplier as f64);
            }
        }
    }

    if is_decimal(trimmed) {
        return parse_number(value, trimmed);
    }

    if let Some(number) = trimmed.strip_suffix(['B', 'b']) {
        // allow at most one space between the number and the unit
        let number = number.strip_suffix(char::is_whitespace).unwrap_or(number);
        if is_decimal(number) {
            return parse_number(value, number);
        }
    }

    Err(Error::InvalidSize(value.to_string()))
}
