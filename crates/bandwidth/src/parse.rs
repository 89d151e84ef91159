use std::num::NonZeroU64;

mod numeric;

use numeric::{parse_decimal_with_exponent, pow_u128};

/// Errors returned when a size or speed string cannot be parsed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum SizeParseError {
    /// The text did not follow the `<number>[unit]` syntax.
    #[error("invalid size syntax")]
    Invalid,
    /// The value overflowed the supported range.
    #[error("size exceeds the supported range")]
    TooLarge,
}

/// Parses a byte quantity such as `4096`, `64K`, `1.5MiB` or `10MB`.
///
/// Leading and trailing ASCII whitespace is ignored. A bare number counts
/// bytes. Unit letters `K`, `M`, `G`, `T` and `P` scale by powers of 1024;
/// appending `B` (`KB`, `MB`, ...) switches to powers of 1000 and `iB`
/// keeps the binary base explicitly. The number may carry a fractional part
/// with `.` or `,` and a decimal exponent (`1e6`); the result truncates
/// towards zero.
pub fn parse_size(text: &str) -> Result<u64, SizeParseError> {
    let trimmed = text.trim_matches(|ch: char| ch.is_ascii_whitespace());
    if trimmed.is_empty() {
        return Err(SizeParseError::Invalid);
    }

    let numeric_end = numeric_prefix_len(trimmed.as_bytes());
    if numeric_end == 0 {
        return Err(SizeParseError::Invalid);
    }

    let decimal = parse_decimal_with_exponent(&trimmed[..numeric_end])?;
    let unit = trimmed[numeric_end..].trim_start_matches(|ch: char| ch.is_ascii_whitespace());
    let (base, repetitions) = parse_unit(unit)?;

    let scale = pow_u128(base, repetitions)?;
    let bytes = decimal.scaled(scale)?;
    u64::try_from(bytes).map_err(|_| SizeParseError::TooLarge)
}

/// Parses a copy speed in bytes per second.
///
/// Accepts everything [`parse_size`] does plus an optional `/s` suffix.
/// `Ok(None)` denotes an unthrottled copy (the text parsed to zero).
pub fn parse_speed(text: &str) -> Result<Option<NonZeroU64>, SizeParseError> {
    let trimmed = text.trim_matches(|ch: char| ch.is_ascii_whitespace());
    let without_rate = trimmed
        .strip_suffix("/s")
        .or_else(|| trimmed.strip_suffix("/S"))
        .unwrap_or(trimmed);

    parse_size(without_rate).map(NonZeroU64::new)
}

fn numeric_prefix_len(bytes: &[u8]) -> usize {
    let mut index = 0;
    while index < bytes.len() && matches!(bytes[index], b'0'..=b'9' | b'.' | b',') {
        index += 1;
    }

    // An exponent only counts when digits follow it; otherwise the `E` is
    // left for the unit parser to reject.
    if index > 0 && index < bytes.len() && matches!(bytes[index], b'e' | b'E') {
        let mut cursor = index + 1;
        if cursor < bytes.len() && matches!(bytes[cursor], b'+' | b'-') {
            cursor += 1;
        }
        let digits_start = cursor;
        while cursor < bytes.len() && bytes[cursor].is_ascii_digit() {
            cursor += 1;
        }
        if cursor > digits_start {
            index = cursor;
        }
    }

    index
}

fn parse_unit(unit: &str) -> Result<(u32, u32), SizeParseError> {
    let mut chars = unit.chars();
    let Some(letter) = chars.next() else {
        return Ok((1024, 0));
    };

    let repetitions = match letter.to_ascii_lowercase() {
        'b' if chars.as_str().is_empty() => return Ok((1024, 0)),
        'b' => return Err(SizeParseError::Invalid),
        'k' => 1,
        'm' => 2,
        'g' => 3,
        't' => 4,
        'p' => 5,
        _ => return Err(SizeParseError::Invalid),
    };

    let base = match chars.as_str() {
        "" | "ib" | "iB" | "Ib" | "IB" => 1024,
        "b" | "B" => 1000,
        _ => return Err(SizeParseError::Invalid),
    };

    Ok((base, repetitions))
}
